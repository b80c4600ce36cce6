use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::DaemonClient;
use crate::commitment;
use crate::config::Config;
use crate::db;
use crate::reconcile::{Reconciler, reconcile_loop};
use crate::recovery::recover_missed_triggers;
use crate::store::ScheduleStore;
use crate::timerjob::LaunchdTimerService;

/// Run the user agent: owns the schedule store, keeps timer jobs
/// reconciled with the current schedules, cleans up expired commitments,
/// and recovers missed triggers at startup.
pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_agent_pool(&config.agent_db_path())
        .await
        .context("creating agent database")?;
    info!(db_path = %config.agent_db_path().display(), "agent store ready");

    let store = ScheduleStore::new(pool.clone(), config.timezone());
    store
        .set_setting("week_start", &config.fence.week_start)
        .await
        .context("recording week start preference")?;

    let client = Arc::new(DaemonClient::from_config(&config));
    match client.version().await {
        Ok(version) => info!(daemon_version = %version, "daemon reachable"),
        Err(e) => warn!(error = %e, "daemon not reachable yet; scheduled blocks need it running"),
    }

    let timer = Arc::new(LaunchdTimerService::new(config.launch_agents_dir()));
    let cli_path = resolve_cli_path(&config);
    let reconciler = Reconciler::new(
        store.clone(),
        timer,
        client.clone(),
        config.schedules_dir(),
        cli_path,
        current_uid(),
    );

    // First pass registers this week's schedules with the daemon, then
    // recovery can start any window already in progress.
    if let Err(e) = reconciler.run_once().await {
        warn!(error = %e, "initial reconciliation failed");
    }
    if let Err(e) = recover_missed_triggers(&reconciler, &client, Utc::now()).await {
        warn!(error = %e, "missed-trigger recovery failed");
    }

    let cancel = CancellationToken::new();

    let debounce = humantime::parse_duration(&config.agent.reconcile_debounce).unwrap_or(Duration::from_secs(2));
    let reconcile_handle = tokio::spawn(reconcile_loop(reconciler, debounce, cancel.clone()));

    let cleanup_handle = tokio::spawn(commitment::cleanup_loop(store.clone(), cancel.clone()));

    crate::daemon::wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = reconcile_handle.await;
        let _ = cleanup_handle.await;
    })
    .await;

    pool.close().await;
    info!("agent shutdown complete");
    Ok(())
}

fn resolve_cli_path(config: &Config) -> String {
    if let Some(path) = &config.agent.cli_path {
        return path.to_string_lossy().into_owned();
    }
    std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "fence".to_string())
}

/// The uid that owns registered schedules. Read through the process
/// table because the agent has no session services to ask.
#[cfg(unix)]
pub fn current_uid() -> u32 {
    use sysinfo::{ProcessesToUpdate, System};
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .and_then(|process| process.user_id())
        .map(|uid| **uid)
        .unwrap_or(0)
}

#[cfg(not(unix))]
pub fn current_uid() -> u32 {
    0
}
