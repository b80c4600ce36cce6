use std::collections::BTreeSet;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::channel::EnforcementChannel;
use crate::error::{FenceError, FenceResult};
use crate::models::BlockEntry;

/// A blocklist entry resolved to a concrete address. `addr` is an IP or
/// `IP/mask` in rule syntax.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolvedPeer {
    pub addr: String,
    pub port: Option<u16>,
}

/// Packet-filter channel. Maintains a named anchor whose rule file
/// mirrors the blocklist. Hostnames are resolved exactly once, at apply;
/// a blocked service that rotates addresses mid-block leaks until the
/// next apply, and the hosts channel still covers the name itself.
pub struct FirewallChannel {
    anchor: String,
    anchor_file: PathBuf,
}

impl FirewallChannel {
    pub fn new(anchor: String, anchor_file: PathBuf) -> Self {
        Self { anchor, anchor_file }
    }

    async fn pfctl(&self, args: &[&str]) -> FenceResult<()> {
        let output = tokio::process::Command::new("pfctl")
            .args(args)
            .output()
            .await
            .map_err(|e| FenceError::Enforcement(format!("spawning pfctl: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FenceError::Enforcement(format!(
                "pfctl {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn write_anchor_file(&self, rules: &str) -> FenceResult<()> {
        let dir = self
            .anchor_file
            .parent()
            .ok_or_else(|| FenceError::Enforcement("anchor file has no parent directory".to_string()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| FenceError::Enforcement(format!("creating anchor directory: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| FenceError::Enforcement(format!("creating temp anchor file: {e}")))?;
        tmp.write_all(rules.as_bytes())
            .map_err(|e| FenceError::Enforcement(format!("writing anchor file: {e}")))?;
        tmp.persist(&self.anchor_file)
            .map_err(|e| FenceError::Enforcement(format!("replacing anchor file: {e}")))?;
        Ok(())
    }
}

/// Resolve website entries to addresses. Resolution happens once here;
/// entries that fail to resolve are logged and skipped rather than
/// failing the whole apply. App entries have no network identity.
pub async fn resolve_entries(blocklist: &[BlockEntry]) -> Vec<ResolvedPeer> {
    let mut peers = BTreeSet::new();
    for entry in blocklist {
        let BlockEntry::Website {
            hostname,
            port,
            mask_len,
        } = entry
        else {
            continue;
        };

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            let addr = match mask_len {
                Some(mask) => format!("{ip}/{mask}"),
                None => ip.to_string(),
            };
            peers.insert(ResolvedPeer { addr, port: *port });
            continue;
        }

        match tokio::net::lookup_host((hostname.as_str(), port.unwrap_or(80))).await {
            Ok(addrs) => {
                for addr in addrs {
                    peers.insert(ResolvedPeer {
                        addr: addr.ip().to_string(),
                        port: *port,
                    });
                }
            }
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "hostname did not resolve, skipping");
            }
        }
    }
    peers.into_iter().collect()
}

/// Render the anchor's rule file. Blocklist mode denies the listed peers;
/// allowlist mode inverts the sense: loopback and listed peers pass,
/// everything else is denied.
pub fn render_rules(peers: &[ResolvedPeer], is_allowlist: bool) -> String {
    let mut lines = Vec::new();
    if is_allowlist {
        lines.push("pass out quick on lo0 all".to_string());
        for peer in peers {
            lines.push(match peer.port {
                Some(port) => format!("pass out quick proto {{ tcp, udp }} from any to {} port = {port}", peer.addr),
                None => format!("pass out quick from any to {}", peer.addr),
            });
        }
        lines.push("block return out quick all".to_string());
    } else {
        for peer in peers {
            lines.push(match peer.port {
                Some(port) => format!(
                    "block return out quick proto {{ tcp, udp }} from any to {} port = {port}",
                    peer.addr
                ),
                None => format!("block return out quick from any to {}", peer.addr),
            });
        }
    }
    lines.join("\n") + "\n"
}

#[async_trait]
impl EnforcementChannel for FirewallChannel {
    fn name(&self) -> &'static str {
        "firewall"
    }

    async fn apply(&self, blocklist: &[BlockEntry], is_allowlist: bool) -> FenceResult<()> {
        let peers = resolve_entries(blocklist).await;
        let rules = render_rules(&peers, is_allowlist);
        self.write_anchor_file(&rules)?;

        self.pfctl(&["-a", &self.anchor, "-f", &self.anchor_file.to_string_lossy()])
            .await?;
        // Enabling an already-enabled pf fails; the anchor load above is
        // what matters.
        if let Err(e) = self.pfctl(&["-e"]).await {
            warn!(error = %e, "pfctl -e failed (pf may already be enabled)");
        }

        info!(anchor = %self.anchor, peers = peers.len(), allowlist = is_allowlist, "firewall anchor loaded");
        Ok(())
    }

    async fn revert(&self) -> FenceResult<()> {
        if !self.anchor_file.exists() {
            return Ok(());
        }
        self.pfctl(&["-a", &self.anchor, "-F", "all"]).await?;
        match std::fs::remove_file(&self.anchor_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FenceError::Enforcement(format!("removing anchor file: {e}"))),
        }
        info!(anchor = %self.anchor, "firewall anchor flushed");
        Ok(())
    }

    async fn is_applied(&self) -> bool {
        self.anchor_file.exists()
    }
}
