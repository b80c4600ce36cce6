use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::schedule::WeekStart;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub fence: FenceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize)]
pub struct FenceConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_week_start")]
    pub week_start: String,
    /// Loopback address the daemon's IPC listener binds.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Control token written by the daemon on first start, read by the
    /// agent and CLI for authorized requests.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_week_start() -> String {
    "monday".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:5733".to_string()
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Where timer-job plists are written.
    #[serde(default)]
    pub launch_agents_dir: Option<PathBuf>,
    /// Where per-segment blocklist files are written.
    #[serde(default)]
    pub schedules_dir: Option<PathBuf>,
    /// Binary the timer jobs invoke. Defaults to the running executable.
    #[serde(default)]
    pub cli_path: Option<PathBuf>,
    /// Quiet period after a schedule change before reconciliation runs.
    #[serde(default = "default_reconcile_debounce")]
    pub reconcile_debounce: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            launch_agents_dir: None,
            schedules_dir: None,
            cli_path: None,
            reconcile_debounce: default_reconcile_debounce(),
        }
    }
}

fn default_reconcile_debounce() -> String {
    "2s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Root-only directory holding the daemon store.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    #[serde(default = "default_pf_anchor")]
    pub pf_anchor: String,
    #[serde(default)]
    pub pf_anchor_file: Option<PathBuf>,
    /// App-killer poll cadence.
    #[serde(default = "default_killer_poll")]
    pub killer_poll: String,
    /// Ticks a process may survive a terminate signal before kill.
    #[serde(default = "default_kill_grace_ticks")]
    pub kill_grace_ticks: u32,
    /// Hard cap on test-block duration.
    #[serde(default = "default_test_block_max")]
    pub test_block_max: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            hosts_file: default_hosts_file(),
            pf_anchor: default_pf_anchor(),
            pf_anchor_file: None,
            killer_poll: default_killer_poll(),
            kill_grace_ticks: default_kill_grace_ticks(),
            test_block_max: default_test_block_max(),
        }
    }
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}
fn default_pf_anchor() -> String {
    "org.fence".to_string()
}
fn default_killer_poll() -> String {
    "500ms".to_string()
}
fn default_kill_grace_ticks() -> u32 {
    2
}
fn default_test_block_max() -> String {
    "5m".to_string()
}

impl Config {
    pub fn agent_db_path(&self) -> PathBuf {
        self.fence.data_dir.join("fence.db")
    }

    pub fn daemon_state_dir(&self) -> PathBuf {
        self.daemon
            .state_dir
            .clone()
            .unwrap_or_else(|| self.fence.data_dir.join("daemon"))
    }

    pub fn daemon_db_path(&self) -> PathBuf {
        self.daemon_state_dir().join("fenced.db")
    }

    pub fn token_file(&self) -> PathBuf {
        self.fence
            .token_file
            .clone()
            .unwrap_or_else(|| self.fence.data_dir.join("control.token"))
    }

    pub fn launch_agents_dir(&self) -> PathBuf {
        self.agent
            .launch_agents_dir
            .clone()
            .unwrap_or_else(|| self.fence.data_dir.join("launch-agents"))
    }

    pub fn schedules_dir(&self) -> PathBuf {
        self.agent
            .schedules_dir
            .clone()
            .unwrap_or_else(|| self.fence.data_dir.join("schedules"))
    }

    pub fn pf_anchor_file(&self) -> PathBuf {
        self.daemon
            .pf_anchor_file
            .clone()
            .unwrap_or_else(|| self.daemon_state_dir().join(format!("{}.anchor", self.daemon.pf_anchor)))
    }

    pub fn timezone(&self) -> Tz {
        // Validated at startup; fall back to UTC if something slips through
        self.fence.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    pub fn week_start(&self) -> WeekStart {
        WeekStart::parse(&self.fence.week_start).unwrap_or(WeekStart::Monday)
    }

    pub fn daemon_url(&self) -> String {
        format!("http://{}", self.fence.listen)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Malformed)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.fence.version != 1 {
        return Err(ConfigError::Invalid(format!(
            "config version {} is not supported; this build reads version 1",
            config.fence.version
        ))
        .into());
    }

    config
        .fence
        .timezone
        .parse::<Tz>()
        .map_err(|_| ConfigError::Invalid(format!("timezone '{}' is not an IANA zone name", config.fence.timezone)))?;

    // Validate week start preference
    WeekStart::parse(&config.fence.week_start)
        .map_err(|_| ConfigError::Invalid(format!("week_start must be 'monday' or 'sunday', got '{}'", config.fence.week_start)))?;

    // The IPC surface must never leave the machine
    let addr: SocketAddr = config
        .fence
        .listen
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", config.fence.listen)))?;
    if !addr.ip().is_loopback() {
        return Err(ConfigError::Invalid(format!(
            "listen address '{}' must be loopback",
            config.fence.listen
        ))
        .into());
    }

    if config.daemon.pf_anchor.trim().is_empty() {
        return Err(ConfigError::Invalid("pf_anchor must not be empty".to_string()).into());
    }

    // Validate durations
    for (name, value) in [
        ("agent.reconcile_debounce", &config.agent.reconcile_debounce),
        ("daemon.killer_poll", &config.daemon.killer_poll),
        ("daemon.test_block_max", &config.daemon.test_block_max),
    ] {
        humantime::parse_duration(value)
            .map_err(|e| ConfigError::Invalid(format!("{name} '{value}': {e}")))?;
    }

    if config.daemon.kill_grace_ticks == 0 {
        return Err(ConfigError::Invalid("daemon.kill_grace_ticks must be at least 1".to_string()).into());
    }

    if let Ok(test_max) = humantime::parse_duration(&config.daemon.test_block_max)
        && test_max > std::time::Duration::from_secs(10 * 60)
    {
        return Err(ConfigError::Invalid(format!(
            "daemon.test_block_max '{}' exceeds the ten minute ceiling",
            config.daemon.test_block_max
        ))
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn minimal_config_validates() {
        let config = parse("[fence]\n");
        validate_config(&config).unwrap();
        assert_eq!(config.fence.listen, "127.0.0.1:5733");
        assert_eq!(config.daemon.hosts_file, PathBuf::from("/etc/hosts"));
        assert_eq!(config.agent_db_path(), PathBuf::from("./data/fence.db"));
    }

    #[test]
    fn rejects_non_loopback_listen() {
        let config = parse("[fence]\nlisten = \"0.0.0.0:5733\"\n");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_bad_timezone_and_week_start() {
        assert!(validate_config(&parse("[fence]\ntimezone = \"Mars/Olympus\"\n")).is_err());
        assert!(validate_config(&parse("[fence]\nweek_start = \"tuesday\"\n")).is_err());
    }

    #[test]
    fn rejects_oversized_test_block() {
        let config = parse("[fence]\n[daemon]\ntest_block_max = \"1h\"\n");
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn derived_paths_follow_data_dir() {
        let config = parse("[fence]\ndata_dir = \"/tmp/fence-test\"\n");
        assert_eq!(config.daemon_db_path(), PathBuf::from("/tmp/fence-test/daemon/fenced.db"));
        assert_eq!(config.token_file(), PathBuf::from("/tmp/fence-test/control.token"));
        assert_eq!(
            config.pf_anchor_file(),
            PathBuf::from("/tmp/fence-test/daemon/org.fence.anchor")
        );
    }
}
