use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FenceError, FenceResult};
use crate::timerange::{DaySchedule, MINUTES_PER_DAY, TimeRange};

/// Day of week, 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Sunday = 0,
    Monday = 1,
    Tuesday = 2,
    Wednesday = 3,
    Thursday = 4,
    Friday = 5,
    Saturday = 6,
}

pub const ALL_DAYS: [DayOfWeek; 7] = [
    DayOfWeek::Sunday,
    DayOfWeek::Monday,
    DayOfWeek::Tuesday,
    DayOfWeek::Wednesday,
    DayOfWeek::Thursday,
    DayOfWeek::Friday,
    DayOfWeek::Saturday,
];

impl DayOfWeek {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> FenceResult<Self> {
        ALL_DAYS
            .get(index)
            .copied()
            .ok_or_else(|| FenceError::Validation(format!("day index {index} out of range")))
    }

    pub fn key(self) -> &'static str {
        match self {
            DayOfWeek::Sunday => "sunday",
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            DayOfWeek::Sunday => "Sunday",
            DayOfWeek::Monday => "Monday",
            DayOfWeek::Tuesday => "Tuesday",
            DayOfWeek::Wednesday => "Wednesday",
            DayOfWeek::Thursday => "Thursday",
            DayOfWeek::Friday => "Friday",
            DayOfWeek::Saturday => "Saturday",
        }
    }

    pub fn short_name(self) -> &'static str {
        &self.display_name()[..3]
    }

    pub fn is_weekday(self) -> bool {
        !matches!(self, DayOfWeek::Saturday | DayOfWeek::Sunday)
    }

    pub fn from_weekday(weekday: Weekday) -> Self {
        ALL_DAYS[weekday.num_days_from_sunday() as usize]
    }
}

/// Which day the UI treats as the start of the week. Display ordering
/// only: week keys stay Monday-anchored regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    Monday,
    Sunday,
}

impl WeekStart {
    pub fn parse(s: &str) -> FenceResult<Self> {
        match s {
            "monday" => Ok(WeekStart::Monday),
            "sunday" => Ok(WeekStart::Sunday),
            other => Err(FenceError::Validation(format!("unknown week start '{other}'"))),
        }
    }

    pub fn ordered_days(self) -> [DayOfWeek; 7] {
        match self {
            WeekStart::Monday => [
                DayOfWeek::Monday,
                DayOfWeek::Tuesday,
                DayOfWeek::Wednesday,
                DayOfWeek::Thursday,
                DayOfWeek::Friday,
                DayOfWeek::Saturday,
                DayOfWeek::Sunday,
            ],
            WeekStart::Sunday => ALL_DAYS,
        }
    }
}

/// One bundle's weekly allow-schedule: seven day schedules, day 0 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub bundle_id: Uuid,
    days: [DaySchedule; 7],
}

impl WeeklySchedule {
    /// Fully blocked every day.
    pub fn empty(bundle_id: Uuid) -> Self {
        Self {
            bundle_id,
            days: Default::default(),
        }
    }

    pub fn day(&self, day: DayOfWeek) -> &DaySchedule {
        &self.days[day.index()]
    }

    pub fn set_day(&mut self, day: DayOfWeek, schedule: DaySchedule) {
        self.days[day.index()] = schedule;
    }

    pub fn add_window(&mut self, day: DayOfWeek, range: TimeRange) -> FenceResult<()> {
        self.days[day.index()].add(range)
    }

    pub fn clear_day(&mut self, day: DayOfWeek) {
        self.days[day.index()].clear();
    }

    pub fn copy_day(&mut self, from: DayOfWeek, to: DayOfWeek) {
        self.days[to.index()] = self.days[from.index()].clone();
    }

    pub fn apply_to_weekdays(&mut self, schedule: &DaySchedule) {
        for day in ALL_DAYS.iter().filter(|d| d.is_weekday()) {
            self.days[day.index()] = schedule.clone();
        }
    }

    pub fn apply_to_weekend(&mut self, schedule: &DaySchedule) {
        self.days[DayOfWeek::Saturday.index()] = schedule.clone();
        self.days[DayOfWeek::Sunday.index()] = schedule.clone();
    }

    pub fn has_allowed_windows(&self, day: DayOfWeek) -> bool {
        !self.days[day.index()].is_empty()
    }

    pub fn total_allowed_minutes(&self, day: DayOfWeek) -> u16 {
        self.days[day.index()].total_allowed_minutes()
    }

    pub fn is_allowed_at(&self, day: DayOfWeek, minute: u16) -> bool {
        self.days[day.index()].is_allowed(minute)
    }

    pub fn is_allowed_now(&self, tz: Tz, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&tz);
        let day = DayOfWeek::from_weekday(local.weekday());
        self.is_allowed_at(day, minutes_from_midnight(&local))
    }

    /// The next instant at which the allowed/blocked state flips, within
    /// the coming week. Every boundary of a normalized day schedule is a
    /// genuine flip.
    pub fn next_state_change(&self, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_now = now.with_timezone(&tz);
        let today = local_now.date_naive();
        for day_offset in 0..8i64 {
            let date = today + Duration::days(day_offset);
            let day = DayOfWeek::from_weekday(date.weekday());
            for range in self.day(day).ranges() {
                for boundary in [range.start_minute, range.end_minute] {
                    if let Some(candidate) = datetime_at(tz, date, boundary)
                        && candidate > now
                    {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    /// Human-readable status, e.g. "Allowed until 17:00" or "Blocked until 09:00".
    pub fn status_string(&self, tz: Tz, now: DateTime<Utc>) -> String {
        let allowed = self.is_allowed_now(tz, now);
        let state = if allowed { "Allowed" } else { "Blocked" };
        match self.next_state_change(tz, now) {
            Some(change) => {
                let local = change.with_timezone(&tz);
                format!("{state} until {}", local.format("%a %H:%M"))
            }
            None => {
                if allowed {
                    "Allowed all week".to_string()
                } else {
                    "Blocked all week".to_string()
                }
            }
        }
    }
}

pub fn minutes_from_midnight<T: TimeZone>(dt: &DateTime<T>) -> u16 {
    let time = dt.time();
    (time.hour() * 60 + time.minute()) as u16
}

/// Local wall-clock instant for `date` at `minutes` from midnight.
/// Minute 1440 maps to the next day's midnight. A time swallowed by a
/// spring-forward gap resolves to the end of the gap: the top of the next
/// representable hour.
pub fn datetime_at(tz: Tz, date: NaiveDate, minutes: u16) -> Option<DateTime<Utc>> {
    let (date, minutes) = if minutes >= MINUTES_PER_DAY {
        (date + Duration::days(1), 0)
    } else {
        (date, minutes)
    };
    let nominal = date.and_time(NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)?);
    if let Some(resolved) = tz.from_local_datetime(&nominal).earliest() {
        return Some(resolved.with_timezone(&Utc));
    }
    let top_of_hour = nominal.with_minute(0)?;
    for hours in 1..=3i64 {
        let candidate = top_of_hour + Duration::hours(hours);
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            return Some(resolved.with_timezone(&Utc));
        }
    }
    None
}

/// The Monday of the week containing `date`.
pub fn start_of_week_containing(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

pub fn start_of_week_for_offset(tz: Tz, now: DateTime<Utc>, week_offset: u8) -> NaiveDate {
    let today = now.with_timezone(&tz).date_naive();
    start_of_week_containing(today) + Duration::weeks(i64::from(week_offset))
}

/// Week key: ISO date of the Monday anchoring the week, e.g. "2024-12-23".
pub fn week_key(monday: NaiveDate) -> String {
    monday.format("%Y-%m-%d").to_string()
}

pub fn week_key_for_offset(tz: Tz, now: DateTime<Utc>, week_offset: u8) -> String {
    week_key(start_of_week_for_offset(tz, now, week_offset))
}

/// Derive the offset of a stored week key relative to the current week.
/// Returns `None` for past weeks and weeks beyond next week.
pub fn offset_for_week_key(tz: Tz, now: DateTime<Utc>, key: &str) -> Option<u8> {
    let monday = NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()?;
    let current = start_of_week_for_offset(tz, now, 0);
    match (monday - current).num_days() {
        0 => Some(0),
        7 => Some(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TZ: Tz = chrono_tz::America::New_York;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn schedule_with(day: DayOfWeek, ranges: Vec<TimeRange>) -> WeeklySchedule {
        let mut s = WeeklySchedule::empty(Uuid::new_v4());
        s.set_day(day, DaySchedule::from_ranges(ranges).unwrap());
        s
    }

    #[test]
    fn day_indexing_round_trips() {
        for (i, day) in ALL_DAYS.iter().enumerate() {
            assert_eq!(day.index(), i);
            assert_eq!(DayOfWeek::from_index(i).unwrap(), *day);
        }
        assert!(DayOfWeek::from_index(7).is_err());
        assert_eq!(DayOfWeek::from_weekday(Weekday::Sun), DayOfWeek::Sunday);
        assert_eq!(DayOfWeek::from_weekday(Weekday::Sat), DayOfWeek::Saturday);
    }

    #[test]
    fn week_anchor_is_monday() {
        // 2024-12-25 is a Wednesday
        let wed = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        let monday = start_of_week_containing(wed);
        assert_eq!(monday, NaiveDate::from_ymd_opt(2024, 12, 23).unwrap());
        assert_eq!(week_key(monday), "2024-12-23");

        // A Monday anchors itself
        assert_eq!(start_of_week_containing(monday), monday);
        // Sunday belongs to the week of the preceding Monday
        let sun = NaiveDate::from_ymd_opt(2024, 12, 29).unwrap();
        assert_eq!(start_of_week_containing(sun), monday);
    }

    #[test]
    fn week_key_offsets_resolve_dynamically() {
        // Wednesday Dec 25 2024, 12:00 local
        let now = utc("2024-12-25T17:00:00Z");
        assert_eq!(week_key_for_offset(TZ, now, 0), "2024-12-23");
        assert_eq!(week_key_for_offset(TZ, now, 1), "2024-12-30");

        assert_eq!(offset_for_week_key(TZ, now, "2024-12-23"), Some(0));
        assert_eq!(offset_for_week_key(TZ, now, "2024-12-30"), Some(1));
        // Last week and the week after next resolve to no offset
        assert_eq!(offset_for_week_key(TZ, now, "2024-12-16"), None);
        assert_eq!(offset_for_week_key(TZ, now, "2025-01-06"), None);

        // Crossing into the next Monday shifts everything by one week
        let next_monday = utc("2024-12-30T06:00:00Z");
        assert_eq!(week_key_for_offset(TZ, next_monday, 0), "2024-12-30");
        assert_eq!(offset_for_week_key(TZ, next_monday, "2024-12-23"), None);
        assert_eq!(offset_for_week_key(TZ, next_monday, "2024-12-30"), Some(0));
    }

    #[test]
    fn allowed_now_respects_local_wallclock() {
        // Monday 14:00 UTC = Monday 09:00 in New York (EST)
        let now = utc("2024-12-23T14:00:00Z");
        let schedule = schedule_with(DayOfWeek::Monday, vec![TimeRange::work_hours()]);
        assert!(schedule.is_allowed_now(TZ, now));

        // Monday 13:59 UTC = 08:59 local, one minute before the window
        assert!(!schedule.is_allowed_now(TZ, utc("2024-12-23T13:59:00Z")));
    }

    #[test]
    fn next_state_change_finds_window_edges() {
        let schedule = schedule_with(DayOfWeek::Monday, vec![TimeRange::work_hours()]);

        // Sunday noon local: next change is Monday 09:00 local (14:00 UTC)
        let sunday_noon = utc("2024-12-22T17:00:00Z");
        assert_eq!(
            schedule.next_state_change(TZ, sunday_noon).unwrap(),
            utc("2024-12-23T14:00:00Z")
        );

        // Inside the window: next change is the 17:00 close
        let monday_noon = utc("2024-12-23T17:00:00Z");
        assert_eq!(
            schedule.next_state_change(TZ, monday_noon).unwrap(),
            utc("2024-12-23T22:00:00Z")
        );

        // A schedule with no windows never changes state
        let empty = WeeklySchedule::empty(Uuid::new_v4());
        assert!(empty.next_state_change(TZ, sunday_noon).is_none());
        assert_eq!(empty.status_string(TZ, sunday_noon), "Blocked all week");
    }

    #[test]
    fn bulk_editing_helpers() {
        let mut schedule = WeeklySchedule::empty(Uuid::new_v4());
        let work = DaySchedule::from_ranges(vec![TimeRange::work_hours()]).unwrap();
        schedule.apply_to_weekdays(&work);
        assert!(schedule.has_allowed_windows(DayOfWeek::Monday));
        assert!(schedule.has_allowed_windows(DayOfWeek::Friday));
        assert!(!schedule.has_allowed_windows(DayOfWeek::Saturday));

        let waking = DaySchedule::from_ranges(vec![TimeRange::waking_hours()]).unwrap();
        schedule.apply_to_weekend(&waking);
        assert_eq!(schedule.total_allowed_minutes(DayOfWeek::Sunday), 16 * 60);

        schedule.copy_day(DayOfWeek::Monday, DayOfWeek::Saturday);
        assert_eq!(schedule.day(DayOfWeek::Saturday), &work);

        schedule.clear_day(DayOfWeek::Monday);
        assert!(!schedule.has_allowed_windows(DayOfWeek::Monday));
    }

    #[test]
    fn serde_round_trip() {
        let mut schedule = WeeklySchedule::empty(Uuid::new_v4());
        schedule
            .add_window(DayOfWeek::Tuesday, TimeRange::from_times("10:15", "12:45").unwrap())
            .unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let back: WeeklySchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn dst_gap_resolves_forward() {
        // US spring-forward 2025-03-09: 02:30 local does not exist
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let resolved = datetime_at(TZ, date, 150).unwrap();
        // 02:30 EST would be 07:30Z; the gap pushes to 03:00 EDT = 07:00Z
        assert_eq!(resolved, utc("2025-03-09T07:00:00Z"));
    }

    #[test]
    fn minute_1440_is_next_midnight() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 23).unwrap();
        let end = datetime_at(TZ, date, 1440).unwrap();
        let next_midnight = datetime_at(TZ, date + Duration::days(1), 0).unwrap();
        assert_eq!(end, next_midnight);
    }
}
