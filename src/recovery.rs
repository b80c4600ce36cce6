use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::client::DaemonClient;
use crate::error::{FenceError, FenceResult};
use crate::materialize::MergedSegment;
use crate::models::BlockStatus;
use crate::reconcile::Reconciler;

/// What startup recovery should do, given the materialized current week
/// and the daemon's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// `now` is inside a window the daemon is not (sufficiently) enforcing.
    StartScheduled {
        segment_id: String,
        end: DateTime<Utc>,
    },
    /// Every window is over but the daemon still reports a finished block.
    ClearExpired,
}

/// Decide the recovery step. Host timer services do not back-fire missed
/// calendar triggers after a reboot or sleep, so this is the only path
/// that starts a block whose trigger already passed.
pub fn recovery_action(segments: &[MergedSegment], status: &BlockStatus, now: DateTime<Utc>) -> RecoveryAction {
    let live = segments.iter().find(|s| s.start <= now && now < s.end);

    match live {
        Some(segment) => {
            let covered = status.is_running && status.end_date.is_some_and(|end| end >= segment.end);
            if covered {
                RecoveryAction::None
            } else {
                RecoveryAction::StartScheduled {
                    segment_id: segment.segment_id.clone(),
                    end: segment.end,
                }
            }
        }
        None => {
            let stale = status.is_running && status.end_date.is_some_and(|end| end <= now);
            if stale {
                RecoveryAction::ClearExpired
            } else {
                RecoveryAction::None
            }
        }
    }
}

/// Run missed-trigger recovery against the live daemon. Called at agent
/// startup, after the first reconciliation pass has registered the
/// current week's schedules.
pub async fn recover_missed_triggers(
    reconciler: &Reconciler,
    client: &DaemonClient,
    now: DateTime<Utc>,
) -> FenceResult<()> {
    let segments = reconciler.desired_segments(now).await?;
    let current_week: Vec<MergedSegment> = segments.into_iter().filter(|s| s.week_offset == 0).collect();
    let status = client.status().await?;

    match recovery_action(&current_week, &status, now) {
        RecoveryAction::None => Ok(()),
        RecoveryAction::StartScheduled { segment_id, end } => {
            info!(segment = %segment_id, end = %end, "starting missed block window late");
            match client.start_scheduled(&segment_id, end).await {
                Ok(()) => Ok(()),
                Err(FenceError::AlreadyRunning(until)) => {
                    warn!(until = %until, "daemon already enforcing a different block");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        RecoveryAction::ClearExpired => {
            info!("clearing expired block left over from before restart");
            client.clear_expired_block().await
        }
    }
}
