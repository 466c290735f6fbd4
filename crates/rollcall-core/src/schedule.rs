//! Daily attendance window and the arrival classification rule.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use thiserror::Error;

use crate::types::AttendanceStatus;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Error, Debug, PartialEq)]
pub enum ScheduleError {
    #[error("start time {0} is not a minute of the day")]
    StartOutOfRange(u32),
    #[error("late threshold ({late} min) exceeds absent threshold ({absent} min)")]
    ThresholdOrder { late: u32, absent: u32 },
    #[error("max absences before drop must be at least 1")]
    ZeroMaxAbsences,
    #[error("utc offset {0}s is out of range")]
    OffsetOutOfRange(i32),
}

/// Attendance window relative to local midnight.
///
/// `delta = minutes_since_midnight - start`:
/// present when `delta <= late`, late up to and including `absent`,
/// absent beyond that.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendanceSchedule {
    start_minutes: u32,
    late_threshold_minutes: u32,
    absent_threshold_minutes: u32,
    max_absences_before_drop: u32,
    offset: FixedOffset,
}

impl Default for AttendanceSchedule {
    fn default() -> Self {
        Self {
            start_minutes: 8 * 60,
            late_threshold_minutes: 15,
            absent_threshold_minutes: 30,
            max_absences_before_drop: 3,
            offset: Utc.fix(),
        }
    }
}

impl AttendanceSchedule {
    pub fn new(
        start_minutes: u32,
        late_threshold_minutes: u32,
        absent_threshold_minutes: u32,
        max_absences_before_drop: u32,
        utc_offset_secs: i32,
    ) -> Result<Self, ScheduleError> {
        if start_minutes >= MINUTES_PER_DAY {
            return Err(ScheduleError::StartOutOfRange(start_minutes));
        }
        if late_threshold_minutes > absent_threshold_minutes {
            return Err(ScheduleError::ThresholdOrder {
                late: late_threshold_minutes,
                absent: absent_threshold_minutes,
            });
        }
        if max_absences_before_drop == 0 {
            return Err(ScheduleError::ZeroMaxAbsences);
        }
        let offset = FixedOffset::east_opt(utc_offset_secs)
            .ok_or(ScheduleError::OffsetOutOfRange(utc_offset_secs))?;

        Ok(Self {
            start_minutes,
            late_threshold_minutes,
            absent_threshold_minutes,
            max_absences_before_drop,
            offset,
        })
    }

    pub fn start_minutes(&self) -> u32 {
        self.start_minutes
    }

    pub fn late_threshold_minutes(&self) -> u32 {
        self.late_threshold_minutes
    }

    pub fn absent_threshold_minutes(&self) -> u32 {
        self.absent_threshold_minutes
    }

    pub fn max_absences_before_drop(&self) -> u32 {
        self.max_absences_before_drop
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Calendar day of `at` in device-local time.
    pub fn local_day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Whole minutes since local midnight.
    pub fn minutes_since_midnight(&self, at: DateTime<Utc>) -> u32 {
        let local = at.with_timezone(&self.offset);
        local.hour() * 60 + local.minute()
    }

    fn delta(&self, at: DateTime<Utc>) -> i64 {
        i64::from(self.minutes_since_midnight(at)) - i64::from(self.start_minutes)
    }

    /// Status of an arrival at `at`.
    pub fn classify(&self, at: DateTime<Utc>) -> AttendanceStatus {
        let delta = self.delta(at);
        if delta <= i64::from(self.late_threshold_minutes) {
            AttendanceStatus::Present
        } else if delta <= i64::from(self.absent_threshold_minutes) {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Absent
        }
    }

    /// Whether the day's absence threshold has passed at `now`.
    pub fn absence_window_closed(&self, now: DateTime<Utc>) -> bool {
        self.delta(now) > i64::from(self.absent_threshold_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_scenario_classification() {
        let s = AttendanceSchedule::new(480, 15, 30, 3, 0).unwrap();
        assert_eq!(s.classify(at(8, 10)), AttendanceStatus::Present);
        assert_eq!(s.classify(at(8, 20)), AttendanceStatus::Late);
        assert_eq!(s.classify(at(8, 35)), AttendanceStatus::Absent);
    }

    #[test]
    fn test_boundaries() {
        let s = AttendanceSchedule::default();
        assert_eq!(s.classify(at(8, 15)), AttendanceStatus::Present);
        assert_eq!(s.classify(at(8, 16)), AttendanceStatus::Late);
        assert_eq!(s.classify(at(8, 30)), AttendanceStatus::Late);
        assert_eq!(s.classify(at(8, 31)), AttendanceStatus::Absent);
    }

    #[test]
    fn test_seconds_do_not_push_over_boundary() {
        let s = AttendanceSchedule::default();
        let t = Utc.with_ymd_and_hms(2024, 3, 4, 8, 15, 59).unwrap();
        assert_eq!(s.classify(t), AttendanceStatus::Present);
    }

    #[test]
    fn test_early_arrival_is_present() {
        let s = AttendanceSchedule::default();
        assert_eq!(s.classify(at(6, 0)), AttendanceStatus::Present);
    }

    #[test]
    fn test_window_closed() {
        let s = AttendanceSchedule::default();
        assert!(!s.absence_window_closed(at(8, 30)));
        assert!(s.absence_window_closed(at(8, 31)));
    }

    #[test]
    fn test_local_day_uses_offset() {
        // 23:30 UTC is already the next day at UTC+2.
        let s = AttendanceSchedule::new(480, 15, 30, 3, 2 * 3600).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 4, 23, 30, 0).unwrap();
        assert_eq!(s.local_day(t), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(s.minutes_since_midnight(t), 90);
    }

    #[test]
    fn test_offset_shifts_classification() {
        // 06:10 UTC is 08:10 at UTC+2.
        let s = AttendanceSchedule::new(480, 15, 30, 3, 2 * 3600).unwrap();
        assert_eq!(s.classify(at(6, 10)), AttendanceStatus::Present);
        assert_eq!(s.classify(at(6, 35)), AttendanceStatus::Absent);
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        assert_eq!(
            AttendanceSchedule::new(480, 40, 30, 3, 0),
            Err(ScheduleError::ThresholdOrder { late: 40, absent: 30 })
        );
        assert_eq!(
            AttendanceSchedule::new(1440, 15, 30, 3, 0),
            Err(ScheduleError::StartOutOfRange(1440))
        );
        assert_eq!(AttendanceSchedule::new(480, 15, 30, 0, 0), Err(ScheduleError::ZeroMaxAbsences));
        assert_eq!(
            AttendanceSchedule::new(480, 15, 30, 3, 200_000),
            Err(ScheduleError::OffsetOutOfRange(200_000))
        );
    }
}
