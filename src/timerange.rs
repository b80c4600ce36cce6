use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FenceError, FenceResult};

pub const MINUTES_PER_DAY: u16 = 1440;

/// A half-open interval of minutes-from-midnight, `[start_minute, end_minute)`.
/// 1440 is the exclusive end-of-day marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl TimeRange {
    pub fn new(start_minute: u16, end_minute: u16) -> FenceResult<Self> {
        let range = Self {
            start_minute,
            end_minute,
        };
        range.validate()?;
        Ok(range)
    }

    /// Parse "HH:MM" into minutes from midnight.
    pub fn parse_minutes(time: &str) -> FenceResult<u16> {
        let (h, m) = time
            .split_once(':')
            .ok_or_else(|| FenceError::Validation(format!("invalid time '{time}': expected HH:MM")))?;
        let hour: u16 = h
            .parse()
            .map_err(|_| FenceError::Validation(format!("invalid hour in '{time}'")))?;
        let minute: u16 = m
            .parse()
            .map_err(|_| FenceError::Validation(format!("invalid minute in '{time}'")))?;
        if hour > 23 {
            return Err(FenceError::Validation(format!("hour {hour} out of range in '{time}'")));
        }
        if minute > 59 {
            return Err(FenceError::Validation(format!(
                "minute {minute} out of range in '{time}'"
            )));
        }
        Ok(hour * 60 + minute)
    }

    /// Build a range from "HH:MM" start/end strings.
    pub fn from_times(start: &str, end: &str) -> FenceResult<Self> {
        Self::new(Self::parse_minutes(start)?, Self::parse_minutes(end)?)
    }

    pub fn validate(&self) -> FenceResult<()> {
        if self.end_minute > MINUTES_PER_DAY {
            return Err(FenceError::Validation(format!(
                "end minute {} past end of day",
                self.end_minute
            )));
        }
        if self.start_minute >= self.end_minute {
            return Err(FenceError::Validation(format!(
                "time range start {} must be before end {}",
                self.start_minute, self.end_minute
            )));
        }
        Ok(())
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end_minute - self.start_minute
    }

    pub fn contains(&self, minute: u16) -> bool {
        minute >= self.start_minute && minute < self.end_minute
    }

    // Common presets.
    pub fn work_hours() -> Self {
        Self {
            start_minute: 9 * 60,
            end_minute: 17 * 60,
        }
    }

    pub fn extended_work() -> Self {
        Self {
            start_minute: 8 * 60,
            end_minute: 20 * 60,
        }
    }

    pub fn waking_hours() -> Self {
        Self {
            start_minute: 7 * 60,
            end_minute: 23 * 60,
        }
    }

    pub fn all_day() -> Self {
        Self {
            start_minute: 0,
            end_minute: MINUTES_PER_DAY,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60
        )
    }
}

/// The allowed intervals of one day. Always sorted by start and pairwise
/// disjoint; adjacent ranges are coalesced. An empty schedule means the
/// whole day is blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaySchedule {
    ranges: Vec<TimeRange>,
}

impl DaySchedule {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from arbitrary ranges; overlapping and adjacent inputs coalesce.
    pub fn from_ranges(ranges: Vec<TimeRange>) -> FenceResult<Self> {
        for r in &ranges {
            r.validate()?;
        }
        let mut day = Self { ranges };
        day.normalize();
        Ok(day)
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn add(&mut self, range: TimeRange) -> FenceResult<()> {
        range.validate()?;
        self.ranges.push(range);
        self.normalize();
        Ok(())
    }

    pub fn remove(&mut self, range: &TimeRange) {
        self.ranges.retain(|r| r != range);
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Sort by start and merge overlapping or touching ranges. Restores the
    /// structural invariant after any mutation.
    fn normalize(&mut self) {
        self.ranges.sort_by_key(|r| (r.start_minute, r.end_minute));
        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start_minute <= last.end_minute => {
                    last.end_minute = last.end_minute.max(r.end_minute);
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    /// Is this minute inside an allowed interval?
    pub fn is_allowed(&self, minute: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(minute))
    }

    pub fn total_allowed_minutes(&self) -> u16 {
        self.ranges.iter().map(|r| r.duration_minutes()).sum()
    }

    /// Complement within `[0, 1440)`: the blocked intervals. Zero-length
    /// segments are dropped.
    pub fn invert(&self) -> DaySchedule {
        let mut blocked = Vec::new();
        let mut cursor = 0u16;
        for r in &self.ranges {
            if r.start_minute > cursor {
                blocked.push(TimeRange {
                    start_minute: cursor,
                    end_minute: r.start_minute,
                });
            }
            cursor = cursor.max(r.end_minute);
        }
        if cursor < MINUTES_PER_DAY {
            blocked.push(TimeRange {
                start_minute: cursor,
                end_minute: MINUTES_PER_DAY,
            });
        }
        DaySchedule { ranges: blocked }
    }

    /// Union of two days' allowed intervals.
    pub fn union(&self, other: &DaySchedule) -> DaySchedule {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().copied());
        let mut day = DaySchedule { ranges };
        day.normalize();
        day
    }

    /// Intersection of two days' allowed intervals.
    pub fn intersect(&self, other: &DaySchedule) -> DaySchedule {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                let start = a.start_minute.max(b.start_minute);
                let end = a.end_minute.min(b.end_minute);
                if start < end {
                    out.push(TimeRange {
                        start_minute: start,
                        end_minute: end,
                    });
                }
            }
        }
        let mut day = DaySchedule { ranges: out };
        day.normalize();
        day
    }
}

/// Monotonicity primitive: does `new` allow any minute that `old` blocked?
///
/// Equivalent to `new ⊇ old_blocked` failing, i.e. the blocked set shrank.
/// Tightening (blocking more) is never loosening.
pub fn is_loosening(old: &DaySchedule, new: &DaySchedule) -> bool {
    let newly_allowed = new.intersect(&old.invert());
    !newly_allowed.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, end: u16) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    #[test]
    fn rejects_invalid_ranges() {
        assert!(TimeRange::new(540, 540).is_err());
        assert!(TimeRange::new(600, 540).is_err());
        assert!(TimeRange::new(0, 1441).is_err());
        assert!(TimeRange::new(0, 1440).is_ok());
    }

    #[test]
    fn parses_times() {
        assert_eq!(TimeRange::parse_minutes("09:00").unwrap(), 540);
        assert_eq!(TimeRange::parse_minutes("23:59").unwrap(), 1439);
        assert!(TimeRange::parse_minutes("24:00").is_err());
        assert!(TimeRange::parse_minutes("9am").is_err());
    }

    #[test]
    fn normalizes_sorted_and_disjoint() {
        let day = DaySchedule::from_ranges(vec![range(600, 720), range(540, 660), range(900, 960)]).unwrap();
        assert_eq!(day.ranges(), &[range(540, 720), range(900, 960)]);

        // Adjacent ranges coalesce
        let day = DaySchedule::from_ranges(vec![range(540, 600), range(600, 660)]).unwrap();
        assert_eq!(day.ranges(), &[range(540, 660)]);
    }

    #[test]
    fn mutation_keeps_invariant() {
        let mut day = DaySchedule::empty();
        day.add(range(900, 960)).unwrap();
        day.add(range(540, 600)).unwrap();
        day.add(range(580, 920)).unwrap();
        assert_eq!(day.ranges(), &[range(540, 960)]);
    }

    #[test]
    fn invert_empty_day_blocks_everything() {
        let day = DaySchedule::empty();
        assert_eq!(day.invert().ranges(), &[range(0, 1440)]);
    }

    #[test]
    fn invert_work_hours() {
        let day = DaySchedule::from_ranges(vec![TimeRange::work_hours()]).unwrap();
        assert_eq!(day.invert().ranges(), &[range(0, 540), range(1020, 1440)]);
    }

    #[test]
    fn invert_drops_zero_length_segments() {
        // Allowed window touching both midnight boundaries
        let day = DaySchedule::from_ranges(vec![range(0, 1440)]).unwrap();
        assert!(day.invert().is_empty());
    }

    #[test]
    fn double_invert_is_identity() {
        let cases = vec![
            DaySchedule::empty(),
            DaySchedule::from_ranges(vec![range(540, 1020)]).unwrap(),
            DaySchedule::from_ranges(vec![range(0, 60), range(540, 1020), range(1380, 1440)]).unwrap(),
        ];
        for day in cases {
            assert_eq!(day.invert().invert(), day);
        }
    }

    #[test]
    fn union_and_intersect() {
        let a = DaySchedule::from_ranges(vec![range(540, 720)]).unwrap();
        let b = DaySchedule::from_ranges(vec![range(600, 840)]).unwrap();
        assert_eq!(a.union(&b).ranges(), &[range(540, 840)]);
        assert_eq!(a.intersect(&b).ranges(), &[range(600, 720)]);

        let disjoint = DaySchedule::from_ranges(vec![range(1200, 1260)]).unwrap();
        assert!(a.intersect(&disjoint).is_empty());
    }

    #[test]
    fn loosening_detected_when_blocked_minute_becomes_allowed() {
        let old = DaySchedule::from_ranges(vec![range(540, 1020)]).unwrap();

        // Widening the window on either side is loosening
        let wider = DaySchedule::from_ranges(vec![range(480, 1080)]).unwrap();
        assert!(is_loosening(&old, &wider));

        // Shrinking it is not
        let narrower = DaySchedule::from_ranges(vec![range(600, 960)]).unwrap();
        assert!(!is_loosening(&old, &narrower));

        // Identical schedule is not
        assert!(!is_loosening(&old, &old.clone()));

        // Clearing all allowed time is maximal tightening
        assert!(!is_loosening(&old, &DaySchedule::empty()));

        // Going from fully blocked to anything allowed is loosening
        assert!(is_loosening(&DaySchedule::empty(), &narrower));
    }

    #[test]
    fn loosening_matches_minute_by_minute_definition() {
        let old = DaySchedule::from_ranges(vec![range(100, 200), range(300, 400)]).unwrap();
        let new = DaySchedule::from_ranges(vec![range(150, 250)]).unwrap();

        let brute = (0..MINUTES_PER_DAY).any(|m| !old.is_allowed(m) && new.is_allowed(m));
        assert_eq!(is_loosening(&old, &new), brute);
        assert!(brute, "minute 200..250 was blocked and is now allowed");
    }

    #[test]
    fn display_formats() {
        assert_eq!(TimeRange::work_hours().to_string(), "09:00-17:00");
        assert_eq!(range(0, 1440).to_string(), "00:00-24:00");
    }
}
