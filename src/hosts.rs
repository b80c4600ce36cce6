use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::channel::EnforcementChannel;
use crate::error::{FenceError, FenceResult};
use crate::models::BlockEntry;

pub const REGION_BEGIN: &str = "# BEGIN FENCE BLOCK";
pub const REGION_END: &str = "# END FENCE BLOCK";

/// Hosts-file channel. Owns exactly the bracketed region between
/// `REGION_BEGIN` and `REGION_END`; everything outside it is preserved
/// byte for byte. Writes are atomic via rename-over.
///
/// Allowlist mode is a no-op here: a hosts file cannot express "only
/// these resolve", so allowlists are enforced by the packet filter alone.
pub struct HostsChannel {
    hosts_path: PathBuf,
    include_www_twins: bool,
}

impl HostsChannel {
    pub fn new(hosts_path: PathBuf, include_www_twins: bool) -> Self {
        Self {
            hosts_path,
            include_www_twins,
        }
    }

    fn read(&self) -> FenceResult<String> {
        std::fs::read_to_string(&self.hosts_path)
            .map_err(|e| FenceError::Enforcement(format!("reading {}: {e}", self.hosts_path.display())))
    }

    fn write_atomic(&self, content: &str) -> FenceResult<()> {
        let dir = self
            .hosts_path
            .parent()
            .ok_or_else(|| FenceError::Enforcement("hosts path has no parent directory".to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| FenceError::Enforcement(format!("creating temp hosts file: {e}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| FenceError::Enforcement(format!("writing hosts file: {e}")))?;
        tmp.persist(&self.hosts_path)
            .map_err(|e| FenceError::Enforcement(format!("replacing hosts file: {e}")))?;
        Ok(())
    }
}

/// The bracketed region for a blocklist: null-route lines for every
/// website hostname. IP entries are skipped (the packet filter covers
/// them); a `www.` twin is added for apex hostnames.
pub fn render_region(blocklist: &[BlockEntry], include_www_twins: bool) -> String {
    let mut lines = vec![REGION_BEGIN.to_string()];
    for entry in blocklist {
        let Some(hostname) = entry.hostname() else {
            continue;
        };
        // Hosts lines only make sense for names, not addresses
        if hostname.parse::<std::net::IpAddr>().is_ok() {
            continue;
        }
        push_host(&mut lines, hostname);
        if include_www_twins && is_apex(hostname) {
            push_host(&mut lines, &format!("www.{hostname}"));
        }
    }
    lines.push(REGION_END.to_string());
    lines.join("\n") + "\n"
}

fn push_host(lines: &mut Vec<String>, hostname: &str) {
    lines.push(format!("127.0.0.1  {hostname}"));
    lines.push(format!("0.0.0.0    {hostname}"));
}

fn is_apex(hostname: &str) -> bool {
    hostname.matches('.').count() == 1
}

/// Replace the bracketed region in `content`, or append one if absent.
pub fn splice_region(content: &str, region: &str) -> String {
    let stripped = remove_region(content);
    let mut out = stripped;
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(region);
    out
}

/// Remove the bracketed region, leaving the rest untouched. Content
/// without a region comes back unchanged.
pub fn remove_region(content: &str) -> String {
    let Some(begin) = content.find(REGION_BEGIN) else {
        return content.to_string();
    };
    let after_begin = &content[begin..];
    let end = match after_begin.find(REGION_END) {
        Some(offset) => {
            let end_abs = begin + offset + REGION_END.len();
            // Swallow the trailing newline of the region
            if content[end_abs..].starts_with('\n') {
                end_abs + 1
            } else {
                end_abs
            }
        }
        // Unterminated region: drop through end of file
        None => content.len(),
    };
    format!("{}{}", &content[..begin], &content[end..])
}

#[async_trait]
impl EnforcementChannel for HostsChannel {
    fn name(&self) -> &'static str {
        "hosts"
    }

    async fn apply(&self, blocklist: &[BlockEntry], is_allowlist: bool) -> FenceResult<()> {
        if is_allowlist {
            debug!("hosts channel inert in allowlist mode");
            return Ok(());
        }
        let content = self.read()?;
        let region = render_region(blocklist, self.include_www_twins);
        let updated = splice_region(&content, &region);
        if updated != content {
            self.write_atomic(&updated)?;
        }
        info!(path = %self.hosts_path.display(), "hosts block written");
        Ok(())
    }

    async fn revert(&self) -> FenceResult<()> {
        let content = self.read()?;
        let updated = remove_region(&content);
        if updated != content {
            self.write_atomic(&updated)?;
            info!(path = %self.hosts_path.display(), "hosts block removed");
        }
        Ok(())
    }

    async fn is_applied(&self) -> bool {
        self.read().map(|c| c.contains(REGION_BEGIN)).unwrap_or(false)
    }
}
