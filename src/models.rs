use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FenceError, FenceResult};

/// One item a bundle blocks: a website (hostname or IP, optional port and
/// CIDR mask) or an application identified by its reverse-DNS bundle id.
///
/// Ordering is by kind then text, which is also the normalized blocklist
/// file order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockEntry {
    Website {
        hostname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mask_len: Option<u8>,
    },
    App { bundle_id: String },
}

impl BlockEntry {
    pub fn website(hostname: &str) -> Self {
        BlockEntry::Website {
            hostname: hostname.to_ascii_lowercase(),
            port: None,
            mask_len: None,
        }
    }

    pub fn app(bundle_id: &str) -> Self {
        BlockEntry::App {
            bundle_id: bundle_id.to_string(),
        }
    }

    pub fn is_app(&self) -> bool {
        matches!(self, BlockEntry::App { .. })
    }

    /// Parse one blocklist line. Accepts `hostname`, `hostname:port`, `IP`,
    /// `IP/mask`, and `app:<bundle-identifier>`. Hostnames are lowercased;
    /// app bundle ids keep their case.
    pub fn parse(line: &str) -> FenceResult<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(FenceError::Validation("empty blocklist entry".to_string()));
        }

        if let Some(bundle_id) = line.strip_prefix("app:") {
            let bundle_id = bundle_id.trim();
            if bundle_id.is_empty() {
                return Err(FenceError::Validation("empty app bundle identifier".to_string()));
            }
            return Ok(BlockEntry::app(bundle_id));
        }

        let (host_part, mask_len) = match line.split_once('/') {
            Some((host, mask)) => {
                let mask: u8 = mask
                    .parse()
                    .map_err(|_| FenceError::Validation(format!("invalid mask in '{line}'")))?;
                if mask > 32 {
                    return Err(FenceError::Validation(format!("mask /{mask} out of range in '{line}'")));
                }
                (host, Some(mask))
            }
            None => (line, None),
        };

        let (hostname, port) = match host_part.rsplit_once(':') {
            Some((host, port_str)) if !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit()) => {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| FenceError::Validation(format!("invalid port in '{line}'")))?;
                if port == 0 {
                    return Err(FenceError::Validation(format!("port 0 in '{line}'")));
                }
                (host, Some(port))
            }
            _ => (host_part, None),
        };

        let hostname = hostname.trim().to_ascii_lowercase();
        if hostname.is_empty() {
            return Err(FenceError::Validation(format!("missing hostname in '{line}'")));
        }
        if hostname.contains(char::is_whitespace) {
            return Err(FenceError::Validation(format!("whitespace inside hostname '{hostname}'")));
        }
        if mask_len.is_some() && hostname.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(FenceError::Validation(format!(
                "mask requires an IPv4 address, got '{hostname}'"
            )));
        }

        Ok(BlockEntry::Website {
            hostname,
            port,
            mask_len,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            BlockEntry::Website { hostname, .. } => Some(hostname),
            BlockEntry::App { .. } => None,
        }
    }

    pub fn app_bundle_id(&self) -> Option<&str> {
        match self {
            BlockEntry::App { bundle_id } => Some(bundle_id),
            BlockEntry::Website { .. } => None,
        }
    }
}

impl fmt::Display for BlockEntry {
    /// The blocklist file line form; `parse` is its inverse.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockEntry::Website {
                hostname,
                port,
                mask_len,
            } => {
                write!(f, "{hostname}")?;
                if let Some(port) = port {
                    write!(f, ":{port}")?;
                }
                if let Some(mask) = mask_len {
                    write!(f, "/{mask}")?;
                }
                Ok(())
            }
            BlockEntry::App { bundle_id } => write!(f, "app:{bundle_id}"),
        }
    }
}

/// Parse a whole blocklist file: one entry per line, `#` comments and
/// blank lines ignored, duplicates removed, result sorted by kind then
/// text.
pub fn parse_blocklist(content: &str) -> FenceResult<Vec<BlockEntry>> {
    let mut entries = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        entries.insert(BlockEntry::parse(line)?);
    }
    Ok(entries.into_iter().collect())
}

/// Render entries back to the blocklist file format.
pub fn render_blocklist(entries: &[BlockEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out
}

/// Normalize an entry list: dedup and sort by kind then text.
pub fn normalize_entries(entries: Vec<BlockEntry>) -> Vec<BlockEntry> {
    entries.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

// Bundle color presets (hex, UI identification only).
pub const COLOR_RED: &str = "#e5484d";
pub const COLOR_ORANGE: &str = "#f76b15";
pub const COLOR_YELLOW: &str = "#ffc53d";
pub const COLOR_GREEN: &str = "#30a46c";
pub const COLOR_BLUE: &str = "#0090ff";
pub const COLOR_PURPLE: &str = "#8e4ec6";

pub const PRESET_COLORS: [&str; 6] = [
    COLOR_RED,
    COLOR_ORANGE,
    COLOR_YELLOW,
    COLOR_GREEN,
    COLOR_BLUE,
    COLOR_PURPLE,
];

/// A named group of blocked items sharing one weekly schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBundle {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub entries: Vec<BlockEntry>,
    pub enabled: bool,
    pub display_order: i64,
}

impl BlockBundle {
    pub fn new(name: &str, color: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            color: color.to_string(),
            entries: Vec::new(),
            enabled: true,
            display_order: 0,
        }
    }

    pub fn validate(&self) -> FenceResult<()> {
        if self.name.trim().is_empty() {
            return Err(FenceError::Validation("bundle name must not be empty".to_string()));
        }
        if self.entries.is_empty() {
            return Err(FenceError::Validation(format!(
                "bundle '{}' must have at least one entry",
                self.name
            )));
        }
        Ok(())
    }

    pub fn app_entries(&self) -> impl Iterator<Item = &BlockEntry> {
        self.entries.iter().filter(|e| e.is_app())
    }

    pub fn website_entries(&self) -> impl Iterator<Item = &BlockEntry> {
        self.entries.iter().filter(|e| !e.is_app())
    }

    /// Starter bundle with common social media sites.
    pub fn distracting_sites() -> Self {
        let mut bundle = Self::new("Distracting Sites", COLOR_RED);
        bundle.entries = normalize_entries(
            [
                "facebook.com",
                "twitter.com",
                "x.com",
                "instagram.com",
                "tiktok.com",
                "reddit.com",
                "youtube.com",
            ]
            .iter()
            .map(|h| BlockEntry::website(h))
            .collect(),
        );
        bundle
    }
}

/// Per-block enforcement toggles, carried with start requests and stored
/// alongside approved schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSettings {
    #[serde(default = "default_true")]
    pub block_hosts: bool,
    #[serde(default = "default_true")]
    pub block_firewall: bool,
    #[serde(default = "default_true")]
    pub block_apps: bool,
    /// Also block the `www.` twin of apex hostnames in the hosts file.
    #[serde(default = "default_true")]
    pub include_www_twins: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            block_hosts: true,
            block_firewall: true,
            block_apps: true,
            include_www_twins: true,
        }
    }
}

/// The daemon's persisted block record. `is_running == true` with a future
/// `end_date` means enforcement must be live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveBlock {
    pub is_running: bool,
    pub is_test: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub blocklist: Vec<BlockEntry>,
    pub is_allowlist: bool,
    pub controlling_uid: u32,
    #[serde(default)]
    pub settings: BlockSettings,
}

/// A pre-authorized job descriptor: consent for this schedule was granted
/// once at registration, so the timer-fired trigger needs no further
/// authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedSchedule {
    pub schedule_id: String,
    pub blocklist: Vec<BlockEntry>,
    pub is_allowlist: bool,
    pub settings: BlockSettings,
    pub controlling_uid: u32,
    /// Last instant the schedule's window can end; after this it is stale
    /// and may be cleaned up without authorization.
    pub expires_at: DateTime<Utc>,
}

/// Daemon state snapshot returned by the status IPC route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStatus {
    pub is_running: bool,
    pub is_test: bool,
    pub is_allowlist: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub entry_count: usize,
    pub blocklist: Vec<BlockEntry>,
    pub firewall_active: bool,
    pub hosts_active: bool,
    pub killer_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_hostnames_lowercased() {
        assert_eq!(BlockEntry::parse("  Facebook.COM  ").unwrap(), BlockEntry::website("facebook.com"));
    }

    #[test]
    fn parses_ports_and_masks() {
        assert_eq!(
            BlockEntry::parse("news.ycombinator.com:443").unwrap(),
            BlockEntry::Website {
                hostname: "news.ycombinator.com".to_string(),
                port: Some(443),
                mask_len: None,
            }
        );
        assert_eq!(
            BlockEntry::parse("192.168.4.0/24").unwrap(),
            BlockEntry::Website {
                hostname: "192.168.4.0".to_string(),
                port: None,
                mask_len: Some(24),
            }
        );
        assert!(BlockEntry::parse("example.com/24").is_err());
        assert!(BlockEntry::parse("10.0.0.0/33").is_err());
        assert!(BlockEntry::parse("example.com:0").is_err());
    }

    #[test]
    fn parses_app_entries() {
        assert_eq!(
            BlockEntry::parse("app:com.example.Game").unwrap(),
            BlockEntry::app("com.example.Game")
        );
        assert!(BlockEntry::parse("app:").is_err());
    }

    #[test]
    fn blocklist_file_round_trip() {
        let content = "\
# social media
facebook.com
FACEBOOK.com

twitter.com:443
app:com.example.Game
10.0.0.1
";
        let entries = parse_blocklist(content).unwrap();
        // Deduped, websites before apps, text-sorted within kind
        assert_eq!(
            entries,
            vec![
                BlockEntry::parse("10.0.0.1").unwrap(),
                BlockEntry::parse("facebook.com").unwrap(),
                BlockEntry::parse("twitter.com:443").unwrap(),
                BlockEntry::parse("app:com.example.Game").unwrap(),
            ]
        );

        let rendered = render_blocklist(&entries);
        assert_eq!(parse_blocklist(&rendered).unwrap(), entries);
    }

    #[test]
    fn bundle_validation() {
        let mut bundle = BlockBundle::new("Games", COLOR_PURPLE);
        assert!(bundle.validate().is_err(), "no entries yet");

        bundle.entries.push(BlockEntry::app("com.example.Game"));
        assert!(bundle.validate().is_ok());

        bundle.name = "   ".to_string();
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn preset_bundle_is_valid_and_sorted() {
        let bundle = BlockBundle::distracting_sites();
        assert!(bundle.validate().is_ok());
        let mut sorted = bundle.entries.clone();
        sorted.sort();
        assert_eq!(bundle.entries, sorted);
        assert_eq!(bundle.website_entries().count(), bundle.entries.len());
    }
}
