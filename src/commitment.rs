use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{FenceError, FenceResult};
use crate::schedule::{ALL_DAYS, DayOfWeek, WeeklySchedule, week_key_for_offset};
use crate::store::ScheduleStore;
use crate::timerange::is_loosening;

/// A one-way ratchet for a single week: until `end_date` passes, the
/// week's schedules may only tighten. The snapshot is kept for audit and
/// for the bundle-removal check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    pub week_key: String,
    pub end_date: DateTime<Utc>,
    pub snapshot: HashMap<Uuid, WeeklySchedule>,
}

/// The first day on which `new` allows a minute `old` blocked, if any.
pub fn first_loosened_day(old: &WeeklySchedule, new: &WeeklySchedule) -> Option<DayOfWeek> {
    ALL_DAYS
        .into_iter()
        .find(|day| is_loosening(old.day(*day), new.day(*day)))
}

pub fn ensure_not_loosening(old: &WeeklySchedule, new: &WeeklySchedule) -> FenceResult<()> {
    match first_loosened_day(old, new) {
        Some(day) => Err(FenceError::CommitmentViolation(format!(
            "schedule change loosens {}",
            day.display_name()
        ))),
        None => Ok(()),
    }
}

/// Commit to a week: snapshot its schedules and store the commitment.
/// Re-committing an already committed week may only extend the end date.
pub async fn commit(
    store: &ScheduleStore,
    week_offset: u8,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> FenceResult<Commitment> {
    if end_date <= now {
        return Err(FenceError::Validation("commitment end date is in the past".to_string()));
    }

    let week_key = week_key_for_offset(store.timezone(), now, week_offset);

    if let Some(existing) = store.get_commitment(&week_key).await?
        && existing.end_date > now
    {
        if end_date < existing.end_date {
            return Err(FenceError::CommitmentViolation(format!(
                "commitment for {week_key} already runs to {}",
                existing.end_date
            )));
        }
        let extended = Commitment {
            end_date,
            ..existing
        };
        store.upsert_commitment(&extended).await?;
        info!(week = %week_key, end = %end_date, "extended commitment");
        return Ok(extended);
    }

    let snapshot = store.schedules_for_week(&week_key).await?;
    if snapshot.is_empty() {
        return Err(FenceError::Validation(format!(
            "no schedules stored for week {week_key}; nothing to commit to"
        )));
    }

    let commitment = Commitment {
        week_key: week_key.clone(),
        end_date,
        snapshot,
    };
    store.upsert_commitment(&commitment).await?;
    info!(week = %week_key, end = %end_date, "committed week");
    Ok(commitment)
}

/// Delete commitments whose end date has passed. Returns the removed week
/// keys; the store's change broadcast kicks the reconciler, which then
/// uninstalls any timer jobs the expired weeks left behind.
pub async fn cleanup_expired(store: &ScheduleStore, now: DateTime<Utc>) -> FenceResult<Vec<String>> {
    let mut removed = Vec::new();
    for commitment in store.list_commitments().await? {
        if commitment.end_date < now {
            store.delete_commitment(&commitment.week_key).await?;
            info!(week = %commitment.week_key, "removed expired commitment");
            removed.push(commitment.week_key);
        }
    }
    Ok(removed)
}

/// Burn one emergency unlock credit to delete the current week's
/// commitment. Returns the credits remaining after the unlock.
pub async fn emergency_unlock(store: &ScheduleStore, now: DateTime<Utc>) -> FenceResult<i64> {
    let credits = store.unlock_credits().await?;
    if credits <= 0 {
        return Err(FenceError::AuthorizationDenied);
    }

    let week_key = week_key_for_offset(store.timezone(), now, 0);
    if !store.delete_commitment(&week_key).await? {
        return Err(FenceError::NotFound(format!("no commitment for week {week_key}")));
    }

    let remaining = credits - 1;
    store.set_unlock_credits(remaining).await?;
    info!(week = %week_key, remaining, "emergency unlock used");
    Ok(remaining)
}

/// Commitment expiry sweep. Runs once immediately, then every ten minutes.
pub async fn cleanup_loop(store: ScheduleStore, cancel: CancellationToken) {
    info!("commitment cleanup started");

    loop {
        match cleanup_expired(&store, Utc::now()).await {
            Ok(removed) if !removed.is_empty() => {
                info!(count = removed.len(), "expired commitments cleaned up");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "commitment cleanup failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("commitment cleanup shutting down");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(600)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_agent_pool;
    use crate::models::{BlockBundle, BlockEntry, COLOR_GREEN};
    use crate::timerange::{DaySchedule, TimeRange};

    fn noon() -> DateTime<Utc> {
        // Wednesday
        "2024-12-25T12:00:00Z".parse().unwrap()
    }

    fn sunday_night() -> DateTime<Utc> {
        "2024-12-29T23:59:00Z".parse().unwrap()
    }

    async fn store_with_bundle() -> (ScheduleStore, BlockBundle) {
        let store = ScheduleStore::new(memory_agent_pool().await, chrono_tz::UTC);
        let mut bundle = BlockBundle::new("Focus", COLOR_GREEN);
        bundle.entries.push(BlockEntry::website("example.com"));
        store.add_bundle(&bundle).await.unwrap();
        (store, bundle)
    }

    fn monday_window(bundle_id: Uuid, start: &str, end: &str) -> WeeklySchedule {
        let mut schedule = WeeklySchedule::empty(bundle_id);
        schedule
            .set_day(
                DayOfWeek::Monday,
                DaySchedule::from_ranges(vec![TimeRange::from_times(start, end).unwrap()]).unwrap(),
            );
        schedule
    }

    #[tokio::test]
    async fn commit_then_loosen_rejected_tighten_accepted() {
        let (store, bundle) = store_with_bundle().await;
        let now = noon();

        let original = monday_window(bundle.id, "09:00", "17:00");
        store.update_schedule(&original, 0, now).await.unwrap();

        commit(&store, 0, sunday_night(), now).await.unwrap();

        // Widening Monday to 08:00-18:00 is loosening
        let wider = monday_window(bundle.id, "08:00", "18:00");
        assert!(matches!(
            store.update_schedule(&wider, 0, now).await,
            Err(FenceError::CommitmentViolation(_))
        ));
        // The stored schedule is untouched
        assert_eq!(store.get_schedule(bundle.id, 0, now).await.unwrap(), Some(original));

        // Narrowing to 10:00-16:00 is tightening and goes through
        let narrower = monday_window(bundle.id, "10:00", "16:00");
        store.update_schedule(&narrower, 0, now).await.unwrap();

        // The ratchet steps: loosening back toward the original is rejected
        let back = monday_window(bundle.id, "09:30", "16:30");
        assert!(store.update_schedule(&back, 0, now).await.is_err());
    }

    #[tokio::test]
    async fn new_bundle_schedule_allowed_during_commitment() {
        let (store, bundle) = store_with_bundle().await;
        let now = noon();
        store
            .update_schedule(&monday_window(bundle.id, "09:00", "17:00"), 0, now)
            .await
            .unwrap();
        commit(&store, 0, sunday_night(), now).await.unwrap();

        // A second bundle gets its first schedule mid-commitment: its
        // baseline is unrestricted, so any schedule only adds blocking.
        let mut other = BlockBundle::new("Games", COLOR_GREEN);
        other.entries.push(BlockEntry::app("com.example.Game"));
        store.add_bundle(&other).await.unwrap();
        store
            .update_schedule(&monday_window(other.id, "12:00", "13:00"), 0, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removing_committed_bundle_rejected() {
        let (store, bundle) = store_with_bundle().await;
        let now = noon();
        store
            .update_schedule(&monday_window(bundle.id, "09:00", "17:00"), 0, now)
            .await
            .unwrap();
        commit(&store, 0, sunday_night(), now).await.unwrap();

        assert!(matches!(
            store.remove_bundle(bundle.id, now).await,
            Err(FenceError::CommitmentViolation(_))
        ));

        // After expiry the removal goes through
        let later: DateTime<Utc> = "2024-12-30T12:00:00Z".parse().unwrap();
        cleanup_expired(&store, later).await.unwrap();
        store.remove_bundle(bundle.id, later).await.unwrap();
    }

    #[tokio::test]
    async fn recommit_extends_only() {
        let (store, bundle) = store_with_bundle().await;
        let now = noon();
        store
            .update_schedule(&monday_window(bundle.id, "09:00", "17:00"), 0, now)
            .await
            .unwrap();

        commit(&store, 0, sunday_night(), now).await.unwrap();

        // Shrinking the commitment window is loosening it
        let earlier: DateTime<Utc> = "2024-12-27T00:00:00Z".parse().unwrap();
        assert!(matches!(
            commit(&store, 0, earlier, now).await,
            Err(FenceError::CommitmentViolation(_))
        ));

        // Extending is fine and keeps the original snapshot
        let later = sunday_night() + chrono::Duration::minutes(1);
        let extended = commit(&store, 0, later, now).await.unwrap();
        assert_eq!(extended.end_date, later);
        assert!(extended.snapshot.contains_key(&bundle.id));
    }

    #[tokio::test]
    async fn commit_requires_schedules() {
        let (store, _) = store_with_bundle().await;
        assert!(matches!(
            commit(&store, 0, sunday_night(), noon()).await,
            Err(FenceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let (store, bundle) = store_with_bundle().await;
        let now = noon();
        store
            .update_schedule(&monday_window(bundle.id, "09:00", "17:00"), 0, now)
            .await
            .unwrap();
        store
            .update_schedule(&monday_window(bundle.id, "09:00", "17:00"), 1, now)
            .await
            .unwrap();

        commit(&store, 0, sunday_night(), now).await.unwrap();
        let next_sunday: DateTime<Utc> = "2025-01-05T23:59:00Z".parse().unwrap();
        commit(&store, 1, next_sunday, now).await.unwrap();

        let after_first: DateTime<Utc> = "2024-12-30T12:00:00Z".parse().unwrap();
        let removed = cleanup_expired(&store, after_first).await.unwrap();
        assert_eq!(removed, vec!["2024-12-23".to_string()]);
        assert_eq!(store.list_commitments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn emergency_unlock_burns_credits() {
        let (store, bundle) = store_with_bundle().await;
        let now = noon();
        store
            .update_schedule(&monday_window(bundle.id, "09:00", "17:00"), 0, now)
            .await
            .unwrap();
        commit(&store, 0, sunday_night(), now).await.unwrap();

        let remaining = emergency_unlock(&store, now).await.unwrap();
        assert_eq!(remaining, crate::store::DEFAULT_UNLOCK_CREDITS - 1);
        assert!(store.get_commitment("2024-12-23").await.unwrap().is_none());

        // No commitment left to unlock
        assert!(matches!(
            emergency_unlock(&store, now).await,
            Err(FenceError::NotFound(_))
        ));

        // Credits exhausted refuses before looking anything up
        store.set_unlock_credits(0).await.unwrap();
        assert!(matches!(
            emergency_unlock(&store, now).await,
            Err(FenceError::AuthorizationDenied)
        ));
    }
}
