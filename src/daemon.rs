use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{self, EnforcementChannel};
use crate::config::Config;
use crate::error::{FenceError, FenceResult};
use crate::firewall::FirewallChannel;
use crate::hosts::HostsChannel;
use crate::killer::KillerChannel;
use crate::models::{ActiveBlock, ApprovedSchedule, BlockEntry, BlockSettings, BlockStatus, normalize_entries};
use crate::server;

/// Why a stop was requested. Each reason carries its own precondition;
/// there is no free-form stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `now >= end_date`; needs no authorization because the block is over.
    Expired,
    /// Test blocks are stoppable at any time.
    Test,
    /// Debug-build escape hatch, authorized on the IPC surface.
    Debug,
}

pub struct StartRequest {
    pub controlling_uid: u32,
    pub blocklist: Vec<BlockEntry>,
    pub is_allowlist: bool,
    pub end_date: DateTime<Utc>,
    pub settings: BlockSettings,
    pub is_test: bool,
}

/// The daemon's single mutator: every state transition happens through a
/// `&mut` method while the caller holds the surrounding mutex, so
/// transitions are serialized and channel mutation never races.
pub struct DaemonCore {
    pool: SqlitePool,
    channels: Vec<Box<dyn EnforcementChannel>>,
    block: ActiveBlock,
    test_block_max: chrono::Duration,
}

impl DaemonCore {
    pub fn new(pool: SqlitePool, channels: Vec<Box<dyn EnforcementChannel>>, test_block_max: Duration) -> Self {
        Self {
            pool,
            channels,
            block: ActiveBlock::default(),
            test_block_max: chrono::Duration::from_std(test_block_max).unwrap_or(chrono::Duration::minutes(5)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.block.is_running
    }

    pub fn block(&self) -> &ActiveBlock {
        &self.block
    }

    /// Channels enabled by the block's settings, in apply order.
    fn enabled_channels(&self, settings: &BlockSettings) -> Vec<&dyn EnforcementChannel> {
        self.channels
            .iter()
            .filter(|c| match c.name() {
                "hosts" => settings.block_hosts,
                "firewall" => settings.block_firewall,
                "killer" => settings.block_apps,
                _ => true,
            })
            .map(|c| c.as_ref())
            .collect()
    }

    async fn persist(&self) -> FenceResult<()> {
        save_active_block(&self.pool, &self.block).await
    }

    /// Idle -> Active.
    pub async fn start(&mut self, request: StartRequest, now: DateTime<Utc>) -> FenceResult<()> {
        if self.block.is_running {
            let until = self.block.end_date.map(|d| d.to_rfc3339()).unwrap_or_default();
            return Err(FenceError::AlreadyRunning(until));
        }
        if request.blocklist.is_empty() {
            return Err(FenceError::Validation("blocklist must not be empty".to_string()));
        }
        if request.end_date <= now {
            return Err(FenceError::Validation("end date is in the past".to_string()));
        }

        let end_date = if request.is_test {
            request.end_date.min(now + self.test_block_max)
        } else {
            request.end_date
        };

        let blocklist = normalize_entries(request.blocklist);
        channel::apply_all(&self.enabled_channels(&request.settings), &blocklist, request.is_allowlist).await?;

        self.block = ActiveBlock {
            is_running: true,
            is_test: request.is_test,
            end_date: Some(end_date),
            blocklist,
            is_allowlist: request.is_allowlist,
            controlling_uid: request.controlling_uid,
            settings: request.settings,
        };
        self.persist().await?;

        info!(
            end = %end_date,
            entries = self.block.blocklist.len(),
            allowlist = self.block.is_allowlist,
            test = self.block.is_test,
            "block started"
        );
        Ok(())
    }

    /// Additive-only blocklist update while Active. Entries may be added
    /// but never removed before the end date; a running block cannot be
    /// hollowed out from inside.
    pub async fn update_blocklist(&mut self, new_list: Vec<BlockEntry>) -> FenceResult<()> {
        if !self.block.is_running {
            return Err(FenceError::NotFound("no block is running".to_string()));
        }

        let new_list = normalize_entries(new_list);
        if !self.block.is_test {
            let new_set: BTreeSet<&BlockEntry> = new_list.iter().collect();
            if let Some(removed) = self.block.blocklist.iter().find(|e| !new_set.contains(e)) {
                return Err(FenceError::Validation(format!(
                    "cannot remove '{removed}' from a running block"
                )));
            }
        }

        channel::apply_all(
            &self.enabled_channels(&self.block.settings.clone()),
            &new_list,
            self.block.is_allowlist,
        )
        .await?;

        self.block.blocklist = new_list;
        self.persist().await?;
        info!(entries = self.block.blocklist.len(), "blocklist updated");
        Ok(())
    }

    /// Extend-only end-date update while Active. Test blocks may move it
    /// freely (within the test cap).
    pub async fn update_end_date(&mut self, new_end: DateTime<Utc>, now: DateTime<Utc>) -> FenceResult<()> {
        if !self.block.is_running {
            return Err(FenceError::NotFound("no block is running".to_string()));
        }

        let new_end = if self.block.is_test {
            new_end.min(now + self.test_block_max)
        } else {
            match self.block.end_date {
                Some(current) if new_end < current => {
                    return Err(FenceError::Validation(
                        "end date can only move forward on a running block".to_string(),
                    ));
                }
                _ => new_end,
            }
        };

        self.block.end_date = Some(new_end);
        self.persist().await?;
        info!(end = %new_end, "block end date updated");
        Ok(())
    }

    /// Active -> Idle.
    pub async fn stop(&mut self, reason: StopReason, now: DateTime<Utc>) -> FenceResult<()> {
        if !self.block.is_running {
            return Err(FenceError::NotFound("no block is running".to_string()));
        }

        match reason {
            StopReason::Expired => {
                let expired = self.block.end_date.is_some_and(|end| now >= end);
                if !expired {
                    return Err(FenceError::AuthorizationDenied);
                }
            }
            StopReason::Test => {
                if !self.block.is_test {
                    return Err(FenceError::AuthorizationDenied);
                }
            }
            StopReason::Debug => {}
        }

        // Revert everything, not just the settings-enabled subset; a
        // revert of an unapplied channel is a no-op.
        channel::revert_all(&channel::as_refs(&self.channels)).await?;

        self.block = ActiveBlock::default();
        self.persist().await?;
        info!(reason = ?reason, "block stopped");
        Ok(())
    }

    /// Minute tick: expire the block on schedule.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        if self.block.is_running
            && self.block.end_date.is_some_and(|end| now >= end)
            && let Err(e) = self.stop(StopReason::Expired, now).await
        {
            error!(error = %e, "expiry stop failed");
        }
    }

    /// Startup: resume a persisted block or clear a stale one. This is the
    /// sole recovery path for a reboot mid-block.
    pub async fn recover(&mut self, now: DateTime<Utc>) -> FenceResult<()> {
        let persisted = load_active_block(&self.pool).await?;
        if !persisted.is_running {
            return Ok(());
        }

        if persisted.end_date.is_some_and(|end| end > now) {
            info!(end = ?persisted.end_date, "resuming persisted block");
            channel::apply_all(
                &self.enabled_channels(&persisted.settings),
                &persisted.blocklist,
                persisted.is_allowlist,
            )
            .await?;
            self.block = persisted;
        } else {
            info!("persisted block already expired, clearing");
            channel::revert_all(&channel::as_refs(&self.channels)).await?;
            self.block = ActiveBlock::default();
            self.persist().await?;
        }
        Ok(())
    }

    // ── Approved schedules ─────────────────────────────────────────────

    pub async fn register_schedule(&mut self, schedule: ApprovedSchedule) -> FenceResult<()> {
        if schedule.blocklist.is_empty() {
            return Err(FenceError::Validation("schedule blocklist must not be empty".to_string()));
        }
        upsert_approved_schedule(&self.pool, &schedule).await?;
        info!(schedule = %schedule.schedule_id, "schedule registered");
        Ok(())
    }

    pub async fn unregister_schedule(&mut self, schedule_id: &str) -> FenceResult<()> {
        if !delete_approved_schedule(&self.pool, schedule_id).await? {
            return Err(FenceError::NotFound(format!("schedule {schedule_id}")));
        }
        info!(schedule = %schedule_id, "schedule unregistered");
        Ok(())
    }

    /// Fire a pre-registered schedule. No interactive authorization: the
    /// presence of the id in the approved store is the consent. An Active
    /// block with the same blocklist only has its end extended (adjacent
    /// segments); a different live block rejects the trigger.
    pub async fn start_scheduled(
        &mut self,
        schedule_id: &str,
        end_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FenceResult<()> {
        let Some(approved) = get_approved_schedule(&self.pool, schedule_id).await? else {
            return Err(FenceError::NotFound(format!("schedule {schedule_id}")));
        };

        if self.block.is_running {
            if self.block.end_date.is_some_and(|end| now >= end) {
                // Previous segment ended but the tick has not fired yet
                self.stop(StopReason::Expired, now).await?;
            } else if normalize_entries(approved.blocklist.clone()) == self.block.blocklist
                && approved.is_allowlist == self.block.is_allowlist
            {
                let current_end = self.block.end_date.unwrap_or(now);
                if end_date > current_end {
                    self.update_end_date(end_date, now).await?;
                }
                return Ok(());
            } else {
                let until = self.block.end_date.map(|d| d.to_rfc3339()).unwrap_or_default();
                return Err(FenceError::AlreadyRunning(until));
            }
        }

        self.start(
            StartRequest {
                controlling_uid: approved.controlling_uid,
                blocklist: approved.blocklist,
                is_allowlist: approved.is_allowlist,
                end_date,
                settings: approved.settings,
                is_test: false,
            },
            now,
        )
        .await
    }

    /// Remove a stale approved schedule. Honored without authorization
    /// only once the schedule's own expiry has passed.
    pub async fn cleanup_stale_schedule(&mut self, schedule_id: &str, now: DateTime<Utc>) -> FenceResult<()> {
        let Some(approved) = get_approved_schedule(&self.pool, schedule_id).await? else {
            return Err(FenceError::NotFound(format!("schedule {schedule_id}")));
        };
        if approved.expires_at > now {
            return Err(FenceError::AuthorizationDenied);
        }
        delete_approved_schedule(&self.pool, schedule_id).await?;
        info!(schedule = %schedule_id, "stale schedule removed");
        Ok(())
    }

    pub async fn status(&self) -> BlockStatus {
        let mut hosts_active = false;
        let mut firewall_active = false;
        let mut killer_active = false;
        for channel in &self.channels {
            let applied = channel.is_applied().await;
            match channel.name() {
                "hosts" => hosts_active = applied,
                "firewall" => firewall_active = applied,
                "killer" => killer_active = applied,
                _ => {}
            }
        }
        BlockStatus {
            is_running: self.block.is_running,
            is_test: self.block.is_test,
            is_allowlist: self.block.is_allowlist,
            end_date: self.block.end_date,
            entry_count: self.block.blocklist.len(),
            blocklist: self.block.blocklist.clone(),
            firewall_active,
            hosts_active,
            killer_active,
        }
    }
}

// ── Persistence (root-scoped settings keys) ────────────────────────────

async fn get_setting(pool: &SqlitePool, key: &str) -> FenceResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(|e| FenceError::Transient(format!("reading daemon setting: {e}")))?;
    Ok(row.map(|(v,)| v))
}

async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> FenceResult<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .map_err(|e| FenceError::Transient(format!("writing daemon setting: {e}")))?;
    Ok(())
}

pub async fn save_active_block(pool: &SqlitePool, block: &ActiveBlock) -> FenceResult<()> {
    set_setting(pool, "block_is_running", if block.is_running { "true" } else { "false" }).await?;
    set_setting(pool, "is_test_block", if block.is_test { "true" } else { "false" }).await?;
    set_setting(
        pool,
        "block_as_allowlist",
        if block.is_allowlist { "true" } else { "false" },
    )
    .await?;
    set_setting(
        pool,
        "block_end_date",
        &block.end_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
    )
    .await?;
    let blocklist =
        serde_json::to_string(&block.blocklist).map_err(|e| FenceError::Transient(format!("serializing blocklist: {e}")))?;
    set_setting(pool, "blocklist", &blocklist).await?;
    set_setting(pool, "controlling_uid", &block.controlling_uid.to_string()).await?;
    let settings = serde_json::to_string(&block.settings)
        .map_err(|e| FenceError::Transient(format!("serializing block settings: {e}")))?;
    set_setting(pool, "block_settings", &settings).await?;
    Ok(())
}

pub async fn load_active_block(pool: &SqlitePool) -> FenceResult<ActiveBlock> {
    let is_running = get_setting(pool, "block_is_running").await?.as_deref() == Some("true");
    if !is_running {
        return Ok(ActiveBlock::default());
    }

    let end_date = get_setting(pool, "block_end_date")
        .await?
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|d| d.with_timezone(&Utc));
    let blocklist = match get_setting(pool, "blocklist").await? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| FenceError::Transient(format!("parsing persisted blocklist: {e}")))?,
        None => Vec::new(),
    };
    let settings = match get_setting(pool, "block_settings").await? {
        Some(json) => serde_json::from_str(&json).unwrap_or_default(),
        None => BlockSettings::default(),
    };

    Ok(ActiveBlock {
        is_running,
        is_test: get_setting(pool, "is_test_block").await?.as_deref() == Some("true"),
        end_date,
        blocklist,
        is_allowlist: get_setting(pool, "block_as_allowlist").await?.as_deref() == Some("true"),
        controlling_uid: get_setting(pool, "controlling_uid")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        settings,
    })
}

async fn upsert_approved_schedule(pool: &SqlitePool, schedule: &ApprovedSchedule) -> FenceResult<()> {
    let blocklist = serde_json::to_string(&schedule.blocklist)
        .map_err(|e| FenceError::Transient(format!("serializing blocklist: {e}")))?;
    let settings = serde_json::to_string(&schedule.settings)
        .map_err(|e| FenceError::Transient(format!("serializing settings: {e}")))?;
    sqlx::query(
        "INSERT INTO approved_schedules (schedule_id, blocklist, is_allowlist, settings, controlling_uid, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(schedule_id) DO UPDATE SET
           blocklist = excluded.blocklist,
           is_allowlist = excluded.is_allowlist,
           settings = excluded.settings,
           controlling_uid = excluded.controlling_uid,
           expires_at = excluded.expires_at",
    )
    .bind(&schedule.schedule_id)
    .bind(&blocklist)
    .bind(schedule.is_allowlist)
    .bind(&settings)
    .bind(i64::from(schedule.controlling_uid))
    .bind(schedule.expires_at)
    .execute(pool)
    .await
    .map_err(|e| FenceError::Transient(format!("upserting approved schedule: {e}")))?;
    Ok(())
}

async fn get_approved_schedule(pool: &SqlitePool, schedule_id: &str) -> FenceResult<Option<ApprovedSchedule>> {
    let row: Option<(String, String, bool, String, i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT schedule_id, blocklist, is_allowlist, settings, controlling_uid, expires_at
         FROM approved_schedules WHERE schedule_id = ?",
    )
    .bind(schedule_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| FenceError::Transient(format!("querying approved schedule: {e}")))?;

    row.map(|(schedule_id, blocklist, is_allowlist, settings, controlling_uid, expires_at)| {
        Ok(ApprovedSchedule {
            schedule_id,
            blocklist: serde_json::from_str(&blocklist)
                .map_err(|e| FenceError::Transient(format!("parsing approved blocklist: {e}")))?,
            is_allowlist,
            settings: serde_json::from_str(&settings).unwrap_or_default(),
            controlling_uid: controlling_uid as u32,
            expires_at,
        })
    })
    .transpose()
}

async fn delete_approved_schedule(pool: &SqlitePool, schedule_id: &str) -> FenceResult<bool> {
    let result = sqlx::query("DELETE FROM approved_schedules WHERE schedule_id = ?")
        .bind(schedule_id)
        .execute(pool)
        .await
        .map_err(|e| FenceError::Transient(format!("deleting approved schedule: {e}")))?;
    Ok(result.rows_affected() > 0)
}

// ── Daemon runtime ─────────────────────────────────────────────────────

pub type SharedCore = Arc<tokio::sync::Mutex<DaemonCore>>;

/// Run the privileged daemon: recover persisted state, serve IPC, expire
/// blocks on the minute.
pub async fn run(config: Config) -> Result<()> {
    let state_dir = config.daemon_state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating daemon state dir: {}", state_dir.display()))?;
    restrict_permissions(&state_dir);

    let pool = crate::db::create_daemon_pool(&config.daemon_db_path())
        .await
        .context("creating daemon database")?;
    info!(db_path = %config.daemon_db_path().display(), "daemon store ready");

    let control_token = bootstrap_control_token(&config)?;

    let killer_poll = humantime::parse_duration(&config.daemon.killer_poll).unwrap_or(Duration::from_millis(500));
    let test_block_max = humantime::parse_duration(&config.daemon.test_block_max).unwrap_or(Duration::from_secs(300));

    let channels: Vec<Box<dyn EnforcementChannel>> = vec![
        Box::new(HostsChannel::new(config.daemon.hosts_file.clone(), true)),
        Box::new(FirewallChannel::new(
            config.daemon.pf_anchor.clone(),
            config.pf_anchor_file(),
        )),
        Box::new(KillerChannel::new(killer_poll, config.daemon.kill_grace_ticks)),
    ];

    let mut core = DaemonCore::new(pool.clone(), channels, test_block_max);
    if let Err(e) = core.recover(Utc::now()).await {
        // A failed resume must not leave a half-applied block behind
        error!(error = %e, "startup recovery failed");
    }
    let core: SharedCore = Arc::new(tokio::sync::Mutex::new(core));

    let cancel = CancellationToken::new();

    // Minute-resolution expiry task
    let tick_core = core.clone();
    let tick_cancel = cancel.clone();
    let tick_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tick_cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
            tick_core.lock().await.tick(Utc::now()).await;
        }
    });

    // IPC surface
    let router = server::build_router(server::AppState {
        core: core.clone(),
        control_token,
    });
    let listener = tokio::net::TcpListener::bind(&config.fence.listen)
        .await
        .with_context(|| format!("binding to {}", config.fence.listen))?;
    info!(listen = %config.fence.listen, "IPC listener ready");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tick_handle.await;
        let _ = server_handle.await;
    })
    .await;

    // The enforcement state stays persisted: a live block resumes on the
    // next daemon start rather than being silently dropped here.
    pool.close().await;
    info!("daemon shutdown complete");
    Ok(())
}

/// Read the control token, generating and persisting one on first run
/// (0600, root-owned when the daemon runs as root).
fn bootstrap_control_token(config: &Config) -> Result<String> {
    let path = config.token_file();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let token = existing.trim().to_string();
        if !token.is_empty() {
            info!("using stored control token");
            return Ok(token);
        }
    }

    let token = generate_token();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating token directory: {}", parent.display()))?;
    }
    std::fs::write(&path, &token).with_context(|| format!("writing control token: {}", path.display()))?;
    restrict_permissions(&path);
    warn!(path = %path.display(), "control token generated");
    Ok(token)
}

fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mode = if path.is_dir() { 0o700 } else { 0o600 };
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!(path = %path.display(), error = %e, "failed to restrict permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) {}

pub(crate) async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::FakeChannel;
    use crate::db::test_support::memory_daemon_pool;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn entries(items: &[&str]) -> Vec<BlockEntry> {
        items.iter().map(|s| BlockEntry::parse(s).unwrap()).collect()
    }

    async fn core_with_fakes() -> DaemonCore {
        let channels: Vec<Box<dyn EnforcementChannel>> = vec![
            Box::new(FakeChannel::new("hosts")),
            Box::new(FakeChannel::new("firewall")),
            Box::new(FakeChannel::new("killer")),
        ];
        DaemonCore::new(memory_daemon_pool().await, channels, Duration::from_secs(300))
    }

    fn start_request(end: DateTime<Utc>) -> StartRequest {
        StartRequest {
            controlling_uid: 501,
            blocklist: entries(&["example.com", "app:com.example.Game"]),
            is_allowlist: false,
            end_date: end,
            settings: BlockSettings::default(),
            is_test: false,
        }
    }

    #[tokio::test]
    async fn start_applies_channels_and_persists() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");
        core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await.unwrap();

        assert!(core.is_running());
        let status = core.status().await;
        assert!(status.hosts_active && status.firewall_active && status.killer_active);

        let persisted = load_active_block(&core.pool).await.unwrap();
        assert!(persisted.is_running);
        assert_eq!(persisted.end_date, Some(utc("2024-12-23T17:00:00Z")));
        assert_eq!(persisted.blocklist, core.block.blocklist);
    }

    #[tokio::test]
    async fn start_while_active_is_rejected() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");
        core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await.unwrap();

        let result = core.start(start_request(utc("2024-12-23T18:00:00Z")), now).await;
        assert!(matches!(result, Err(FenceError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn start_rejects_empty_blocklist_and_past_end() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");

        let mut request = start_request(utc("2024-12-23T17:00:00Z"));
        request.blocklist.clear();
        assert!(matches!(core.start(request, now).await, Err(FenceError::Validation(_))));

        let request = start_request(utc("2024-12-23T08:00:00Z"));
        assert!(matches!(core.start(request, now).await, Err(FenceError::Validation(_))));
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn blocklist_updates_are_additive_only() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");
        core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await.unwrap();

        // Adding is fine
        core.update_blocklist(entries(&["example.com", "app:com.example.Game", "reddit.com"]))
            .await
            .unwrap();
        assert_eq!(core.block().blocklist.len(), 3);

        // Dropping an entry is self-exfiltration and is rejected
        let result = core.update_blocklist(entries(&["example.com"])).await;
        assert!(matches!(result, Err(FenceError::Validation(_))));
        assert_eq!(core.block().blocklist.len(), 3);
    }

    #[tokio::test]
    async fn end_date_extends_only() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");
        core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await.unwrap();

        core.update_end_date(utc("2024-12-23T18:00:00Z"), now).await.unwrap();
        assert_eq!(core.block().end_date, Some(utc("2024-12-23T18:00:00Z")));

        let result = core.update_end_date(utc("2024-12-23T12:00:00Z"), now).await;
        assert!(matches!(result, Err(FenceError::Validation(_))));
    }

    #[tokio::test]
    async fn stop_paths_enforce_their_preconditions() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");

        // Stop on Idle is NotFound
        assert!(matches!(
            core.stop(StopReason::Expired, now).await,
            Err(FenceError::NotFound(_))
        ));

        core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await.unwrap();

        // Not yet expired and not a test block
        assert!(matches!(
            core.stop(StopReason::Expired, now).await,
            Err(FenceError::AuthorizationDenied)
        ));
        assert!(matches!(
            core.stop(StopReason::Test, now).await,
            Err(FenceError::AuthorizationDenied)
        ));

        // After the end date the unauthorized path succeeds
        let later = utc("2024-12-23T17:00:00Z");
        core.stop(StopReason::Expired, later).await.unwrap();
        assert!(!core.is_running());

        let status = core.status().await;
        assert!(!status.hosts_active && !status.firewall_active && !status.killer_active);
        assert!(!load_active_block(&core.pool).await.unwrap().is_running);
    }

    #[tokio::test]
    async fn tick_expires_the_block() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");
        core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await.unwrap();

        core.tick(utc("2024-12-23T16:59:00Z")).await;
        assert!(core.is_running());

        core.tick(utc("2024-12-23T17:00:00Z")).await;
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn test_blocks_are_capped_and_freely_stoppable() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");

        let mut request = start_request(utc("2024-12-23T17:00:00Z"));
        request.is_test = true;
        core.start(request, now).await.unwrap();

        // Clamped to the five-minute test cap
        assert_eq!(core.block().end_date, Some(utc("2024-12-23T09:05:00Z")));

        core.stop(StopReason::Test, now).await.unwrap();
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn failed_channel_apply_leaves_idle_state() {
        let channels: Vec<Box<dyn EnforcementChannel>> = vec![
            Box::new(FakeChannel::new("hosts")),
            Box::new(FakeChannel::failing("firewall")),
            Box::new(FakeChannel::new("killer")),
        ];
        let mut core = DaemonCore::new(memory_daemon_pool().await, channels, Duration::from_secs(300));
        let now = utc("2024-12-23T09:00:00Z");

        let result = core.start(start_request(utc("2024-12-23T17:00:00Z")), now).await;
        assert!(matches!(result, Err(FenceError::Enforcement(_))));
        assert!(!core.is_running());

        let status = core.status().await;
        assert!(!status.hosts_active, "partial apply rolled back");
        assert!(!load_active_block(&core.pool).await.unwrap().is_running);
    }

    #[tokio::test]
    async fn settings_filter_which_channels_apply() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");

        let mut request = start_request(utc("2024-12-23T17:00:00Z"));
        request.settings.block_firewall = false;
        core.start(request, now).await.unwrap();

        let status = core.status().await;
        assert!(status.hosts_active);
        assert!(!status.firewall_active);
        assert!(status.killer_active);
    }

    #[tokio::test]
    async fn recover_resumes_unexpired_block() {
        let pool = memory_daemon_pool().await;
        let block = ActiveBlock {
            is_running: true,
            is_test: false,
            end_date: Some(utc("2024-12-23T17:00:00Z")),
            blocklist: entries(&["example.com"]),
            is_allowlist: false,
            controlling_uid: 501,
            settings: BlockSettings::default(),
        };
        save_active_block(&pool, &block).await.unwrap();

        let channels: Vec<Box<dyn EnforcementChannel>> = vec![
            Box::new(FakeChannel::new("hosts")),
            Box::new(FakeChannel::new("firewall")),
            Box::new(FakeChannel::new("killer")),
        ];
        let mut core = DaemonCore::new(pool, channels, Duration::from_secs(300));
        core.recover(utc("2024-12-23T16:30:00Z")).await.unwrap();

        assert!(core.is_running());
        assert!(core.status().await.hosts_active);

        // The resumed block still expires on schedule
        core.tick(utc("2024-12-23T17:00:00Z")).await;
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn recover_clears_expired_block() {
        let pool = memory_daemon_pool().await;
        let block = ActiveBlock {
            is_running: true,
            is_test: false,
            end_date: Some(utc("2024-12-23T10:00:00Z")),
            blocklist: entries(&["example.com"]),
            is_allowlist: false,
            controlling_uid: 501,
            settings: BlockSettings::default(),
        };
        save_active_block(&pool, &block).await.unwrap();

        let channels: Vec<Box<dyn EnforcementChannel>> = vec![Box::new(FakeChannel::new("hosts"))];
        let mut core = DaemonCore::new(pool, channels, Duration::from_secs(300));
        core.recover(utc("2024-12-23T12:00:00Z")).await.unwrap();

        assert!(!core.is_running());
        assert!(!load_active_block(&core.pool).await.unwrap().is_running);
    }

    fn approved(id: &str, expires: DateTime<Utc>) -> ApprovedSchedule {
        ApprovedSchedule {
            schedule_id: id.to_string(),
            blocklist: entries(&["example.com", "app:com.example.Game"]),
            is_allowlist: false,
            settings: BlockSettings::default(),
            controlling_uid: 501,
            expires_at: expires,
        }
    }

    #[tokio::test]
    async fn scheduled_start_requires_prior_registration() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");

        assert!(matches!(
            core.start_scheduled("unknown", utc("2024-12-23T17:00:00Z"), now).await,
            Err(FenceError::NotFound(_))
        ));

        core.register_schedule(approved("seg1", utc("2024-12-23T17:00:00Z")))
            .await
            .unwrap();
        core.start_scheduled("seg1", utc("2024-12-23T17:00:00Z"), now).await.unwrap();
        assert!(core.is_running());
        assert_eq!(core.block().controlling_uid, 501);
    }

    #[tokio::test]
    async fn adjacent_segment_extends_matching_block() {
        let mut core = core_with_fakes().await;
        let now = utc("2024-12-23T09:00:00Z");
        core.register_schedule(approved("seg1", utc("2024-12-23T12:00:00Z")))
            .await
            .unwrap();
        core.register_schedule(approved("seg2", utc("2024-12-23T17:00:00Z")))
            .await
            .unwrap();

        core.start_scheduled("seg1", utc("2024-12-23T12:00:00Z"), now).await.unwrap();
        // Same blocklist, later end: extend rather than reject
        core.start_scheduled("seg2", utc("2024-12-23T17:00:00Z"), utc("2024-12-23T11:59:00Z"))
            .await
            .unwrap();
        assert_eq!(core.block().end_date, Some(utc("2024-12-23T17:00:00Z")));
    }

    #[tokio::test]
    async fn stale_schedule_cleanup_is_time_gated() {
        let mut core = core_with_fakes().await;
        core.register_schedule(approved("seg1", utc("2024-12-23T17:00:00Z")))
            .await
            .unwrap();

        assert!(matches!(
            core.cleanup_stale_schedule("seg1", utc("2024-12-23T12:00:00Z")).await,
            Err(FenceError::AuthorizationDenied)
        ));

        core.cleanup_stale_schedule("seg1", utc("2024-12-23T18:00:00Z")).await.unwrap();
        assert!(matches!(
            core.unregister_schedule("seg1").await,
            Err(FenceError::NotFound(_))
        ));
    }
}
