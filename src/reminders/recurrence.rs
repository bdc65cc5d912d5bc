//! Next-occurrence arithmetic for repeating reminders.
//!
//! Fixed units add an exact duration. Months and years move along the calendar; when the
//! anchor's day does not exist in the target month the result is clamped to that month's last
//! day (Jan 31 + 1 month = Feb 28, or Feb 29 in leap years). The time of day is preserved.

use chrono::{DateTime, Duration, Months, Utc};

use crate::error::{ReminderSyncError, Result};
use crate::reminders::model::{RepeatSpec, RepeatUnit};

pub fn next_occurrence(anchor: i64, unit: RepeatUnit, count: u32) -> Result<i64> {
    if count == 0 {
        return Err(ReminderSyncError::Runtime(
            "repeat count must be positive".to_string(),
        ));
    }
    let anchor_dt = DateTime::<Utc>::from_timestamp(anchor, 0).ok_or_else(|| {
        ReminderSyncError::Runtime(format!("anchor {anchor} is out of range"))
    })?;
    let count_i64 = i64::from(count);

    let next = match unit {
        RepeatUnit::Seconds => anchor_dt.checked_add_signed(Duration::seconds(count_i64)),
        RepeatUnit::Minutes => anchor_dt.checked_add_signed(Duration::minutes(count_i64)),
        RepeatUnit::Hours => anchor_dt.checked_add_signed(Duration::hours(count_i64)),
        RepeatUnit::Days => anchor_dt.checked_add_signed(Duration::days(count_i64)),
        RepeatUnit::Weeks => anchor_dt.checked_add_signed(Duration::weeks(count_i64)),
        RepeatUnit::Months => anchor_dt.checked_add_months(Months::new(count)),
        RepeatUnit::Years => count
            .checked_mul(12)
            .and_then(|months| anchor_dt.checked_add_months(Months::new(months))),
    };

    next.map(|dt| dt.timestamp()).ok_or_else(|| {
        ReminderSyncError::Runtime(format!(
            "next occurrence overflows: anchor={anchor} unit={unit} count={count}"
        ))
    })
}

pub fn next_for_spec(anchor: i64, spec: RepeatSpec) -> Result<i64> {
    next_occurrence(anchor, spec.unit, spec.count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> i64 {
        DateTime::parse_from_rfc3339(raw)
            .expect("valid timestamp")
            .with_timezone(&Utc)
            .timestamp()
    }

    #[test]
    fn fixed_units_add_exact_durations() {
        let anchor = ts("2025-01-01T00:00:00Z");
        assert_eq!(
            next_occurrence(anchor, RepeatUnit::Hours, 2).expect("hours"),
            ts("2025-01-01T02:00:00Z")
        );
        assert_eq!(
            next_occurrence(anchor, RepeatUnit::Seconds, 90).expect("seconds"),
            ts("2025-01-01T00:01:30Z")
        );
        assert_eq!(
            next_occurrence(anchor, RepeatUnit::Minutes, 45).expect("minutes"),
            ts("2025-01-01T00:45:00Z")
        );
        assert_eq!(
            next_occurrence(anchor, RepeatUnit::Days, 3).expect("days"),
            ts("2025-01-04T00:00:00Z")
        );
        assert_eq!(
            next_occurrence(anchor, RepeatUnit::Weeks, 2).expect("weeks"),
            ts("2025-01-15T00:00:00Z")
        );
    }

    #[test]
    fn month_end_is_clamped_to_last_day() {
        assert_eq!(
            next_occurrence(ts("2025-01-31T00:00:00Z"), RepeatUnit::Months, 1).expect("months"),
            ts("2025-02-28T00:00:00Z")
        );
        assert_eq!(
            next_occurrence(ts("2024-01-31T08:15:00Z"), RepeatUnit::Months, 1).expect("leap"),
            ts("2024-02-29T08:15:00Z")
        );
        assert_eq!(
            next_occurrence(ts("2025-03-31T00:00:00Z"), RepeatUnit::Months, 3).expect("quarter"),
            ts("2025-06-30T00:00:00Z")
        );
    }

    #[test]
    fn years_follow_the_calendar() {
        assert_eq!(
            next_occurrence(ts("2024-02-29T12:00:00Z"), RepeatUnit::Years, 1).expect("years"),
            ts("2025-02-28T12:00:00Z")
        );
        assert_eq!(
            next_for_spec(
                ts("2025-06-01T00:00:00Z"),
                RepeatSpec::new(RepeatUnit::Years, 2)
            )
            .expect("spec"),
            ts("2027-06-01T00:00:00Z")
        );
    }

    #[test]
    fn zero_count_is_rejected() {
        assert!(next_occurrence(0, RepeatUnit::Days, 0).is_err());
    }
}
