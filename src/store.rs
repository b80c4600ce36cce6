use std::collections::HashMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::commitment::{self, Commitment};
use crate::error::{FenceError, FenceResult};
use crate::models::BlockBundle;
use crate::schedule::{WeeklySchedule, week_key_for_offset};
use crate::timerange::{DaySchedule, TimeRange};

pub const DEFAULT_UNLOCK_CREDITS: i64 = 5;

/// Emitted after every successful mutation; the agent's reconciler is the
/// subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DidChange {
    Bundles,
    Schedules,
    Commitments,
}

/// The agent-owned store: bundles, per-week schedules, commitments, and
/// user settings. All mutations pass the commitment guard before touching
/// the database.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
    tz: Tz,
    changes: broadcast::Sender<DidChange>,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool, tz: Tz) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self { pool, tz, changes }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DidChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: DidChange) {
        // No receivers is fine (CLI one-shot paths)
        let _ = self.changes.send(change);
    }

    // ── Bundles ────────────────────────────────────────────────────────

    pub async fn list_bundles(&self) -> FenceResult<Vec<BlockBundle>> {
        let rows: Vec<(String, String, String, String, bool, i64)> = sqlx::query_as(
            "SELECT id, name, color, entries, enabled, display_order
             FROM bundles ORDER BY display_order, name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(transient("listing bundles"))?;

        rows.into_iter().map(bundle_from_row).collect()
    }

    pub async fn get_bundle(&self, id: Uuid) -> FenceResult<Option<BlockBundle>> {
        let row: Option<(String, String, String, String, bool, i64)> = sqlx::query_as(
            "SELECT id, name, color, entries, enabled, display_order
             FROM bundles WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient("querying bundle"))?;

        row.map(bundle_from_row).transpose()
    }

    pub async fn add_bundle(&self, bundle: &BlockBundle) -> FenceResult<()> {
        bundle.validate()?;
        let entries = serde_json::to_string(&bundle.entries).map_err(invalid("serializing entries"))?;
        sqlx::query(
            "INSERT INTO bundles (id, name, color, entries, enabled, display_order)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(bundle.id.to_string())
        .bind(&bundle.name)
        .bind(&bundle.color)
        .bind(&entries)
        .bind(bundle.enabled)
        .bind(bundle.display_order)
        .execute(&self.pool)
        .await
        .map_err(transient("inserting bundle"))?;

        debug!(bundle = %bundle.name, id = %bundle.id, "created bundle");
        self.notify(DidChange::Bundles);
        Ok(())
    }

    pub async fn update_bundle(&self, bundle: &BlockBundle) -> FenceResult<()> {
        bundle.validate()?;
        let entries = serde_json::to_string(&bundle.entries).map_err(invalid("serializing entries"))?;
        let result = sqlx::query(
            "UPDATE bundles SET name = ?, color = ?, entries = ?, enabled = ?, display_order = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(&bundle.name)
        .bind(&bundle.color)
        .bind(&entries)
        .bind(bundle.enabled)
        .bind(bundle.display_order)
        .bind(bundle.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(transient("updating bundle"))?;

        if result.rows_affected() == 0 {
            return Err(FenceError::NotFound(format!("bundle {}", bundle.id)));
        }

        debug!(bundle = %bundle.name, id = %bundle.id, "updated bundle");
        self.notify(DidChange::Bundles);
        Ok(())
    }

    /// Removing a bundle removes its blocking, so while a commitment that
    /// covers the bundle is in force this is loosening and is rejected.
    pub async fn remove_bundle(&self, id: Uuid, now: DateTime<Utc>) -> FenceResult<()> {
        for commitment in self.unexpired_commitments(now).await? {
            if commitment.snapshot.contains_key(&id) {
                return Err(FenceError::CommitmentViolation(format!(
                    "bundle is part of the committed week {}",
                    commitment.week_key
                )));
            }
        }

        let result = sqlx::query("DELETE FROM bundles WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(transient("deleting bundle"))?;

        if result.rows_affected() == 0 {
            return Err(FenceError::NotFound(format!("bundle {id}")));
        }

        debug!(id = %id, "removed bundle");
        self.notify(DidChange::Bundles);
        Ok(())
    }

    pub async fn reorder_bundles(&self, ordered_ids: &[Uuid]) -> FenceResult<()> {
        for (order, id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE bundles SET display_order = ? WHERE id = ?")
                .bind(order as i64)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(transient("reordering bundles"))?;
        }
        self.notify(DidChange::Bundles);
        Ok(())
    }

    // ── Schedules ──────────────────────────────────────────────────────

    pub async fn get_schedule(
        &self,
        bundle_id: Uuid,
        week_offset: u8,
        now: DateTime<Utc>,
    ) -> FenceResult<Option<WeeklySchedule>> {
        let week_key = week_key_for_offset(self.tz, now, week_offset);
        self.get_schedule_for_week(bundle_id, &week_key).await
    }

    pub async fn get_schedule_for_week(&self, bundle_id: Uuid, week_key: &str) -> FenceResult<Option<WeeklySchedule>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT days FROM schedules WHERE week_key = ? AND bundle_id = ?")
            .bind(week_key)
            .bind(bundle_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(transient("querying schedule"))?;

        row.map(|(days,)| serde_json::from_str(&days).map_err(invalid("parsing stored schedule")))
            .transpose()
    }

    /// All schedules stored for a week, keyed by bundle.
    pub async fn schedules_for_week(&self, week_key: &str) -> FenceResult<HashMap<Uuid, WeeklySchedule>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT bundle_id, days FROM schedules WHERE week_key = ?")
            .bind(week_key)
            .fetch_all(&self.pool)
            .await
            .map_err(transient("querying week schedules"))?;

        let mut map = HashMap::with_capacity(rows.len());
        for (bundle_id, days) in rows {
            let id: Uuid = bundle_id.parse().map_err(invalid("parsing bundle id"))?;
            let schedule: WeeklySchedule = serde_json::from_str(&days).map_err(invalid("parsing stored schedule"))?;
            map.insert(id, schedule);
        }
        Ok(map)
    }

    /// Upsert a bundle's schedule for a week. While that week's commitment
    /// is in force, any change that loosens a day is rejected.
    pub async fn update_schedule(
        &self,
        schedule: &WeeklySchedule,
        week_offset: u8,
        now: DateTime<Utc>,
    ) -> FenceResult<()> {
        if self.get_bundle(schedule.bundle_id).await?.is_none() {
            return Err(FenceError::NotFound(format!("bundle {}", schedule.bundle_id)));
        }

        let week_key = week_key_for_offset(self.tz, now, week_offset);

        if let Some(commitment) = self.get_commitment(&week_key).await?
            && commitment.end_date > now
        {
            // A bundle with no stored schedule blocks nothing, so the
            // baseline for the ratchet is the fully-allowed week.
            let old = match self.get_schedule_for_week(schedule.bundle_id, &week_key).await? {
                Some(existing) => existing,
                None => unrestricted_week(schedule.bundle_id),
            };
            commitment::ensure_not_loosening(&old, schedule)?;
        }

        let days = serde_json::to_string(schedule).map_err(invalid("serializing schedule"))?;
        sqlx::query(
            "INSERT INTO schedules (week_key, bundle_id, days) VALUES (?, ?, ?)
             ON CONFLICT(week_key, bundle_id) DO UPDATE SET
               days = excluded.days,
               updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
        )
        .bind(&week_key)
        .bind(schedule.bundle_id.to_string())
        .bind(&days)
        .execute(&self.pool)
        .await
        .map_err(transient("upserting schedule"))?;

        debug!(bundle = %schedule.bundle_id, week = %week_key, "updated schedule");
        self.notify(DidChange::Schedules);
        Ok(())
    }

    // ── Commitments ────────────────────────────────────────────────────

    pub async fn get_commitment(&self, week_key: &str) -> FenceResult<Option<Commitment>> {
        let row: Option<(String, DateTime<Utc>, String)> =
            sqlx::query_as("SELECT week_key, end_date, snapshot FROM commitments WHERE week_key = ?")
                .bind(week_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(transient("querying commitment"))?;

        row.map(commitment_from_row).transpose()
    }

    pub async fn list_commitments(&self) -> FenceResult<Vec<Commitment>> {
        let rows: Vec<(String, DateTime<Utc>, String)> =
            sqlx::query_as("SELECT week_key, end_date, snapshot FROM commitments ORDER BY week_key")
                .fetch_all(&self.pool)
                .await
                .map_err(transient("listing commitments"))?;

        rows.into_iter().map(commitment_from_row).collect()
    }

    pub async fn unexpired_commitments(&self, now: DateTime<Utc>) -> FenceResult<Vec<Commitment>> {
        Ok(self
            .list_commitments()
            .await?
            .into_iter()
            .filter(|c| c.end_date > now)
            .collect())
    }

    pub(crate) async fn upsert_commitment(&self, commitment: &Commitment) -> FenceResult<()> {
        let snapshot = serde_json::to_string(&commitment.snapshot).map_err(invalid("serializing snapshot"))?;
        sqlx::query(
            "INSERT INTO commitments (week_key, end_date, snapshot) VALUES (?, ?, ?)
             ON CONFLICT(week_key) DO UPDATE SET end_date = excluded.end_date",
        )
        .bind(&commitment.week_key)
        .bind(commitment.end_date)
        .bind(&snapshot)
        .execute(&self.pool)
        .await
        .map_err(transient("upserting commitment"))?;

        self.notify(DidChange::Commitments);
        Ok(())
    }

    pub(crate) async fn delete_commitment(&self, week_key: &str) -> FenceResult<bool> {
        let result = sqlx::query("DELETE FROM commitments WHERE week_key = ?")
            .bind(week_key)
            .execute(&self.pool)
            .await
            .map_err(transient("deleting commitment"))?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify(DidChange::Commitments);
        }
        Ok(deleted)
    }

    // ── Settings ───────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> FenceResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient("reading setting"))?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> FenceResult<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(transient("upserting setting"))?;
        Ok(())
    }

    pub async fn unlock_credits(&self) -> FenceResult<i64> {
        Ok(self
            .get_setting("emergency_unlock_credits")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_UNLOCK_CREDITS))
    }

    pub(crate) async fn set_unlock_credits(&self, credits: i64) -> FenceResult<()> {
        self.set_setting("emergency_unlock_credits", &credits.to_string()).await
    }
}

/// The ratchet baseline for a bundle with no stored schedule: every minute
/// of every day allowed, i.e. nothing blocked.
fn unrestricted_week(bundle_id: Uuid) -> WeeklySchedule {
    let mut week = WeeklySchedule::empty(bundle_id);
    let all_day = DaySchedule::from_ranges(vec![TimeRange::all_day()]).unwrap_or_default();
    for day in crate::schedule::ALL_DAYS {
        week.set_day(day, all_day.clone());
    }
    week
}

fn bundle_from_row(row: (String, String, String, String, bool, i64)) -> FenceResult<BlockBundle> {
    let (id, name, color, entries, enabled, display_order) = row;
    Ok(BlockBundle {
        id: id.parse().map_err(invalid("parsing bundle id"))?,
        name,
        color,
        entries: serde_json::from_str(&entries).map_err(invalid("parsing bundle entries"))?,
        enabled,
        display_order,
    })
}

fn commitment_from_row(row: (String, DateTime<Utc>, String)) -> FenceResult<Commitment> {
    let (week_key, end_date, snapshot) = row;
    Ok(Commitment {
        week_key,
        end_date,
        snapshot: serde_json::from_str(&snapshot).map_err(invalid("parsing commitment snapshot"))?,
    })
}

fn transient<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> FenceError {
    move |e| FenceError::Transient(format!("{what}: {e}"))
}

fn invalid<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> FenceError {
    move |e| FenceError::Validation(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_agent_pool;
    use crate::models::BlockEntry;
    use crate::schedule::DayOfWeek;

    const TZ: Tz = chrono_tz::UTC;

    fn wednesday_noon() -> DateTime<Utc> {
        "2024-12-25T12:00:00Z".parse().unwrap()
    }

    fn bundle_with_entry(name: &str) -> BlockBundle {
        let mut bundle = BlockBundle::new(name, crate::models::COLOR_BLUE);
        bundle.entries.push(BlockEntry::website("example.com"));
        bundle
    }

    async fn store() -> ScheduleStore {
        ScheduleStore::new(memory_agent_pool().await, TZ)
    }

    #[tokio::test]
    async fn bundle_crud_round_trip() {
        let store = store().await;
        let mut bundle = bundle_with_entry("Social");
        store.add_bundle(&bundle).await.unwrap();

        let listed = store.list_bundles().await.unwrap();
        assert_eq!(listed, vec![bundle.clone()]);

        bundle.name = "Social Media".to_string();
        bundle.entries.push(BlockEntry::app("com.example.Game"));
        store.update_bundle(&bundle).await.unwrap();
        assert_eq!(store.get_bundle(bundle.id).await.unwrap().unwrap().name, "Social Media");

        store.remove_bundle(bundle.id, wednesday_noon()).await.unwrap();
        assert!(store.list_bundles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_bundle_rejected_without_mutation() {
        let store = store().await;
        let bundle = BlockBundle::new("Empty", crate::models::COLOR_RED);
        assert!(matches!(
            store.add_bundle(&bundle).await,
            Err(FenceError::Validation(_))
        ));
        assert!(store.list_bundles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_missing_bundle_is_not_found() {
        let store = store().await;
        let bundle = bundle_with_entry("Ghost");
        assert!(matches!(
            store.update_bundle(&bundle).await,
            Err(FenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn schedules_are_week_scoped() {
        let store = store().await;
        let now = wednesday_noon();
        let bundle = bundle_with_entry("Work");
        store.add_bundle(&bundle).await.unwrap();

        let mut this_week = WeeklySchedule::empty(bundle.id);
        this_week
            .add_window(DayOfWeek::Monday, TimeRange::work_hours())
            .unwrap();
        store.update_schedule(&this_week, 0, now).await.unwrap();

        let mut next_week = WeeklySchedule::empty(bundle.id);
        next_week
            .add_window(DayOfWeek::Friday, TimeRange::waking_hours())
            .unwrap();
        store.update_schedule(&next_week, 1, now).await.unwrap();

        assert_eq!(store.get_schedule(bundle.id, 0, now).await.unwrap(), Some(this_week));
        assert_eq!(store.get_schedule(bundle.id, 1, now).await.unwrap(), Some(next_week.clone()));

        // After the calendar rolls into next Monday, offset 0 resolves to
        // what was stored as offset 1.
        let next_monday: DateTime<Utc> = "2024-12-30T08:00:00Z".parse().unwrap();
        assert_eq!(
            store.get_schedule(bundle.id, 0, next_monday).await.unwrap(),
            Some(next_week)
        );
        assert_eq!(store.get_schedule(bundle.id, 1, next_monday).await.unwrap(), None);
    }

    #[tokio::test]
    async fn did_change_fires_on_mutation() {
        let store = store().await;
        let mut rx = store.subscribe();
        store.add_bundle(&bundle_with_entry("A")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), DidChange::Bundles);
    }

    #[tokio::test]
    async fn unlock_credits_default() {
        let store = store().await;
        assert_eq!(store.unlock_credits().await.unwrap(), DEFAULT_UNLOCK_CREDITS);
        store.set_unlock_credits(2).await.unwrap();
        assert_eq!(store.unlock_credits().await.unwrap(), 2);
    }
}
