use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::DaemonClient;
use crate::error::{FenceError, FenceResult};
use crate::materialize::{MergedSegment, merged_segments};
use crate::models::{ApprovedSchedule, BlockSettings, render_blocklist};
use crate::schedule::{WeeklySchedule, week_key_for_offset};
use crate::store::ScheduleStore;
use crate::timerjob::{TimerJob, TimerService, job_for_segment, plan, with_retries};

/// Daemon-side schedule registration, seam-shaped so reconciliation can
/// be tested without a live daemon.
#[async_trait]
pub trait ScheduleRegistrar: Send + Sync {
    async fn register(&self, schedule: &ApprovedSchedule) -> FenceResult<()>;
    async fn unregister(&self, schedule_id: &str) -> FenceResult<()>;
    /// Unauthorized removal path; the daemon only honors it once the
    /// schedule's own expiry has passed.
    async fn cleanup_stale(&self, schedule_id: &str) -> FenceResult<()>;
}

#[async_trait]
impl ScheduleRegistrar for DaemonClient {
    async fn register(&self, schedule: &ApprovedSchedule) -> FenceResult<()> {
        self.register_schedule(schedule).await
    }

    async fn unregister(&self, schedule_id: &str) -> FenceResult<()> {
        self.unregister_schedule(schedule_id).await
    }

    async fn cleanup_stale(&self, schedule_id: &str) -> FenceResult<()> {
        self.cleanup_stale_schedule(schedule_id).await
    }
}

/// Drives the installed timer jobs toward the set implied by the current
/// schedules. Idempotent: running it twice with the same inputs touches
/// nothing the second time.
pub struct Reconciler {
    store: ScheduleStore,
    timer: Arc<dyn TimerService>,
    registrar: Arc<dyn ScheduleRegistrar>,
    schedules_dir: PathBuf,
    cli_path: String,
    controlling_uid: u32,
}

impl Reconciler {
    pub fn new(
        store: ScheduleStore,
        timer: Arc<dyn TimerService>,
        registrar: Arc<dyn ScheduleRegistrar>,
        schedules_dir: PathBuf,
        cli_path: String,
        controlling_uid: u32,
    ) -> Self {
        Self {
            store,
            timer,
            registrar,
            schedules_dir,
            cli_path,
            controlling_uid,
        }
    }

    /// The segments that should currently have timer jobs: this week and
    /// next, materialized fresh from local wall-clock.
    pub async fn desired_segments(&self, now: chrono::DateTime<Utc>) -> FenceResult<Vec<MergedSegment>> {
        let bundles = self.store.list_bundles().await?;
        let tz = self.store.timezone();

        let mut segments = Vec::new();
        for week_offset in [0u8, 1] {
            let week_key = week_key_for_offset(tz, now, week_offset);
            let schedules: HashMap<Uuid, WeeklySchedule> = self.store.schedules_for_week(&week_key).await?;
            segments.extend(merged_segments(&bundles, &schedules, week_offset, tz, now));
        }
        Ok(segments)
    }

    /// One reconciliation pass. Registration happens before the timer job
    /// is installed, so a job can never fire without its consent record.
    pub async fn run_once(&self) -> FenceResult<()> {
        let now = Utc::now();
        let segments = self.desired_segments(now).await?;
        let desired: Vec<(TimerJob, &MergedSegment)> = segments
            .iter()
            .map(|segment| (job_for_segment(segment, &self.cli_path), segment))
            .collect();
        let desired_jobs: Vec<TimerJob> = desired.iter().map(|(job, _)| job.clone()).collect();

        let installed = self.timer.installed_labels().await?;
        let (to_install, to_uninstall) = plan(&installed, &desired_jobs);

        for label in &to_uninstall {
            with_retries("uninstalling timer job", || self.timer.uninstall(label)).await?;
            if let Some(schedule_id) = segment_id_from_label(label) {
                match self.registrar.unregister(&schedule_id).await {
                    Ok(()) | Err(FenceError::NotFound(_)) => {}
                    // Without the control token, fall back to the
                    // expiry-gated cleanup path.
                    Err(FenceError::AuthorizationDenied) => {
                        if let Err(e) = self.registrar.cleanup_stale(&schedule_id).await
                            && !matches!(e, FenceError::NotFound(_))
                        {
                            warn!(schedule = %schedule_id, error = %e, "failed to clean up stale schedule");
                        }
                    }
                    Err(e) => warn!(schedule = %schedule_id, error = %e, "failed to unregister stale schedule"),
                }
                let _ = tokio::fs::remove_file(self.blocklist_path(&schedule_id)).await;
            }
        }

        for (job, segment) in desired.iter().filter(|(job, _)| to_install.contains(job)) {
            self.write_blocklist_file(segment).await?;

            let approved = ApprovedSchedule {
                schedule_id: segment.segment_id.clone(),
                blocklist: segment.blocklist.clone(),
                is_allowlist: false,
                settings: BlockSettings::default(),
                controlling_uid: self.controlling_uid,
                expires_at: segment.end,
            };
            self.registrar.register(&approved).await?;

            with_retries("installing timer job", || self.timer.install(job)).await?;
        }

        if !to_install.is_empty() || !to_uninstall.is_empty() {
            info!(
                installed = to_install.len(),
                removed = to_uninstall.len(),
                "timer jobs reconciled"
            );
        }
        Ok(())
    }

    fn blocklist_path(&self, segment_id: &str) -> PathBuf {
        self.schedules_dir.join(format!("{segment_id}.fence"))
    }

    /// Blocklist file for a segment, consumed by `fence start` when a
    /// block is started by hand during an in-progress window.
    async fn write_blocklist_file(&self, segment: &MergedSegment) -> FenceResult<()> {
        tokio::fs::create_dir_all(&self.schedules_dir)
            .await
            .map_err(|e| FenceError::Transient(format!("creating schedules dir: {e}")))?;
        let content = render_blocklist(&segment.blocklist);
        tokio::fs::write(self.blocklist_path(&segment.segment_id), content)
            .await
            .map_err(|e| FenceError::Transient(format!("writing blocklist file: {e}")))?;
        Ok(())
    }
}

/// Pull the segment id back out of a job label
/// (`org.fence.schedule.<segment_id>.<day>.<start>`).
pub fn segment_id_from_label(label: &str) -> Option<String> {
    let rest = label.strip_prefix(&format!("{}.", crate::timerjob::JOB_LABEL_PREFIX))?;
    let mut parts = rest.rsplitn(3, '.');
    let _start = parts.next()?;
    let _day = parts.next()?;
    parts.next().map(|s| s.to_string())
}

/// Reconcile task: one pass at startup, then one per change notification,
/// debounced so an editing burst produces a single pass.
pub async fn reconcile_loop(reconciler: Reconciler, debounce: Duration, cancel: CancellationToken) {
    info!("reconciler started");
    let mut changes = reconciler.store.subscribe();

    if let Err(e) = reconciler.run_once().await {
        error!(error = %e, "startup reconciliation failed");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reconciler shutting down");
                return;
            }
            received = changes.recv() => {
                match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        }

        // Let an editing burst settle, then drain whatever queued up
        tokio::time::sleep(debounce).await;
        while changes.try_recv().is_ok() {}

        if let Err(e) = reconciler.run_once().await {
            error!(error = %e, "reconciliation failed");
        }
    }
}
