use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{BlockBundle, BlockEntry, normalize_entries};
use crate::schedule::{
    ALL_DAYS, DayOfWeek, WeeklySchedule, datetime_at, start_of_week_for_offset, week_key,
};
use crate::timerange::DaySchedule;

/// One absolute block interval for a single bundle. Produced by inverting
/// the day's allowed windows; `end > start` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWindow {
    pub bundle_id: Uuid,
    pub day: DayOfWeek,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Nominal start as minutes from local midnight, before any clipping.
    pub start_minutes: u16,
    pub week_offset: u8,
}

impl BlockWindow {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// A block interval contributed to by one or more bundles, enforced as a
/// single timer job whose blocklist is the union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedSegment {
    pub segment_id: String,
    pub bundle_ids: Vec<Uuid>,
    pub day: DayOfWeek,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub start_minutes: u16,
    pub week_offset: u8,
    pub blocklist: Vec<BlockEntry>,
}

/// Calendar date of `day` within the week starting at `monday`.
fn date_of_day(monday: NaiveDate, day: DayOfWeek) -> NaiveDate {
    // Monday anchors the week; Sunday is its last day.
    let offset = (day.index() + 6) % 7;
    monday + Duration::days(offset as i64)
}

/// Materialize one bundle's absolute block windows for a week.
///
/// Windows entirely in the past are dropped; a window already in progress
/// is clipped to `(now, end)` so recovery can start the remainder
/// immediately. Anchors are recomputed from local wall-clock on every
/// call, so a timezone change takes effect at the next materialization.
pub fn block_windows(
    schedule: &WeeklySchedule,
    week_offset: u8,
    tz: Tz,
    now: DateTime<Utc>,
) -> Vec<BlockWindow> {
    let monday = start_of_week_for_offset(tz, now, week_offset);
    let mut windows = Vec::new();

    for day in ALL_DAYS {
        let date = date_of_day(monday, day);
        for blocked in schedule.day(day).invert().ranges() {
            let Some(start) = datetime_at(tz, date, blocked.start_minute) else {
                continue;
            };
            let Some(end) = datetime_at(tz, date, blocked.end_minute) else {
                continue;
            };
            if end <= now {
                continue;
            }
            let clipped_start = if start < now { now } else { start };
            if clipped_start >= end {
                continue;
            }
            windows.push(BlockWindow {
                bundle_id: schedule.bundle_id,
                day,
                start: clipped_start,
                end,
                start_minutes: blocked.start_minute,
                week_offset,
            });
        }
    }

    windows.sort_by_key(|w| (w.start, w.end));
    windows
}

/// Merge all bundles' block windows for a week into the minimal set of
/// per-day segments whose union covers exactly the per-bundle union of
/// blocked minutes. Merging never changes which minutes are blocked; it
/// only collapses overlapping windows into one job.
pub fn merged_segments(
    bundles: &[BlockBundle],
    schedules: &HashMap<Uuid, WeeklySchedule>,
    week_offset: u8,
    tz: Tz,
    now: DateTime<Utc>,
) -> Vec<MergedSegment> {
    let monday = start_of_week_for_offset(tz, now, week_offset);
    let week = week_key(monday);

    let active: Vec<&BlockBundle> = bundles
        .iter()
        .filter(|b| b.enabled && b.validate().is_ok() && schedules.contains_key(&b.id))
        .collect();

    let mut segments = Vec::new();

    for day in ALL_DAYS {
        // Union of every bundle's blocked set for this day.
        let mut blocked_union = DaySchedule::empty();
        let mut per_bundle: Vec<(&BlockBundle, DaySchedule)> = Vec::new();
        for bundle in &active {
            let blocked = schedules[&bundle.id].day(day).invert();
            if !blocked.is_empty() {
                blocked_union = blocked_union.union(&blocked);
                per_bundle.push((bundle, blocked));
            }
        }

        let date = date_of_day(monday, day);
        for interval in blocked_union.ranges() {
            // Which bundles contribute any minute of this interval?
            let single = DaySchedule::from_ranges(vec![*interval]).unwrap_or_default();
            let mut contributors: Vec<&BlockBundle> = per_bundle
                .iter()
                .filter(|(_, blocked)| !blocked.intersect(&single).is_empty())
                .map(|(bundle, _)| *bundle)
                .collect();
            contributors.sort_by_key(|b| b.id);

            let Some(start) = datetime_at(tz, date, interval.start_minute) else {
                continue;
            };
            let Some(end) = datetime_at(tz, date, interval.end_minute) else {
                continue;
            };
            if end <= now {
                continue;
            }
            let clipped_start = if start < now { now } else { start };
            if clipped_start >= end {
                continue;
            }

            let bundle_ids: Vec<Uuid> = contributors.iter().map(|b| b.id).collect();
            let blocklist = normalize_entries(
                contributors
                    .iter()
                    .flat_map(|b| b.entries.iter().cloned())
                    .collect(),
            );

            segments.push(MergedSegment {
                segment_id: segment_id(&week, day, interval.start_minute, &bundle_ids),
                bundle_ids,
                day,
                start: clipped_start,
                end,
                start_minutes: interval.start_minute,
                week_offset,
                blocklist,
            });
        }
    }

    segments.sort_by(|a, b| {
        (a.start, a.end, &a.segment_id).cmp(&(b.start, b.end, &b.segment_id))
    });
    segments
}

/// Deterministic segment id: identical inputs produce identical ids across
/// runs, which keeps timer-job reconciliation idempotent.
fn segment_id(week_key: &str, day: DayOfWeek, start_minutes: u16, bundle_ids: &[Uuid]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(week_key.as_bytes());
    hasher.update([day.index() as u8]);
    hasher.update(start_minutes.to_be_bytes());
    for id in bundle_ids {
        hasher.update(id.as_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}
