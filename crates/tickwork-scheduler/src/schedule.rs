//! Pure fire-time arithmetic. No I/O, no clock: callers pass "now".

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use tickwork_core::model::Schedule;

use crate::error::{Result, SchedulerError};

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("cron {expression:?}: {e}")))
}

fn interval(every_ms: u64) -> Result<Duration> {
    if every_ms == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "fixed interval must be > 0".to_string(),
        ));
    }
    Ok(Duration::milliseconds(every_ms as i64))
}

/// Check that `schedule` can produce fire times at all.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
        Schedule::FixedInterval { every_ms } => interval(*every_ms).map(|_| ()),
        Schedule::Once { .. } => Ok(()),
    }
}

/// The occurrence following `after`, strictly later.
///
/// For a fixed interval `after` is the previous occurrence, so successive
/// calls walk the grid `anchor + k * every`. `None` means exhausted.
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Cron { expression } => Ok(parse_cron(expression)?.after(&after).next()),
        Schedule::FixedInterval { every_ms } => Ok(Some(after + interval(*every_ms)?)),
        Schedule::Once { at } => Ok((*at > after).then_some(*at)),
    }
}

/// First occurrence of a new (or re-enabled) trigger.
///
/// Nothing fires before `start_at` or after `end_at`. A fixed interval with a
/// future `start_at` fires exactly at `start_at`; otherwise one interval after
/// `now`. A `once` schedule keeps its instant even if it is already past, so
/// the misfire policy decides what happens to it.
pub fn first_fire(
    schedule: &Schedule,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let base = start_at.map_or(now, |s| s.max(now));
    let first = match schedule {
        Schedule::Cron { expression } => {
            // Include `base` itself when it lands on a cron point.
            parse_cron(expression)?
                .after(&(base - Duration::milliseconds(1)))
                .next()
        }
        Schedule::FixedInterval { every_ms } => {
            let every = interval(*every_ms)?;
            match start_at {
                Some(start) if start >= now => Some(start),
                _ => Some(now + every),
            }
        }
        Schedule::Once { at } => Some(*at),
    };
    Ok(within_window(first, end_at))
}

/// Where a trigger continues after a misfire: the first occurrence strictly
/// after `now`. Fixed intervals stay aligned to the grid of `last_scheduled`.
pub fn resume_after(
    schedule: &Schedule,
    last_scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Cron { .. } => next_after(schedule, now),
        Schedule::FixedInterval { every_ms } => {
            let every = interval(*every_ms)?.num_milliseconds();
            let behind = (now - last_scheduled).num_milliseconds();
            if behind < 0 {
                return Ok(Some(last_scheduled));
            }
            let steps = behind / every + 1;
            Ok(Some(last_scheduled + Duration::milliseconds(steps * every)))
        }
        Schedule::Once { .. } => Ok(None),
    }
}

/// Drop `at` if it falls after the trigger's end.
pub fn within_window(
    at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (at, end_at) {
        (Some(t), Some(end)) if t > end => None,
        (t, _) => t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    fn every(ms: u64) -> Schedule {
        Schedule::FixedInterval { every_ms: ms }
    }

    fn cron(expr: &str) -> Schedule {
        Schedule::Cron {
            expression: expr.to_string(),
        }
    }

    #[test]
    fn fixed_interval_steps_from_previous_occurrence() {
        let next = next_after(&every(1_000), t(12, 0, 0)).unwrap();
        assert_eq!(next, Some(t(12, 0, 1)));
    }

    #[test]
    fn cron_next_is_strictly_after() {
        let s = cron("0 */5 * * * *");
        assert_eq!(next_after(&s, t(12, 0, 0)).unwrap(), Some(t(12, 5, 0)));
        assert_eq!(next_after(&s, t(12, 3, 7)).unwrap(), Some(t(12, 5, 0)));
    }

    #[test]
    fn malformed_cron_is_invalid_schedule() {
        let err = next_after(&cron("not a cron"), t(12, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(validate(&cron("not a cron")).is_err());
        assert!(validate(&every(0)).is_err());
    }

    #[test]
    fn once_is_exhausted_after_its_instant() {
        let s = Schedule::Once { at: t(12, 0, 0) };
        assert_eq!(next_after(&s, t(11, 0, 0)).unwrap(), Some(t(12, 0, 0)));
        assert_eq!(next_after(&s, t(12, 0, 0)).unwrap(), None);
    }

    #[test]
    fn first_fire_honours_start_and_end() {
        let now = t(12, 0, 0);
        assert_eq!(
            first_fire(&every(60_000), None, None, now).unwrap(),
            Some(t(12, 1, 0))
        );
        assert_eq!(
            first_fire(&every(60_000), Some(t(13, 0, 0)), None, now).unwrap(),
            Some(t(13, 0, 0))
        );
        assert_eq!(
            first_fire(&every(60_000), None, Some(t(12, 0, 30)), now).unwrap(),
            None
        );
        assert_eq!(
            first_fire(&cron("0 0 * * * *"), Some(t(13, 0, 0)), None, now).unwrap(),
            Some(t(13, 0, 0))
        );
    }

    #[test]
    fn resume_stays_on_interval_grid() {
        // Grid 12:00:00 + k*10s; now is 12:00:35 -> 12:00:40.
        let next = resume_after(&every(10_000), t(12, 0, 0), t(12, 0, 35)).unwrap();
        assert_eq!(next, Some(t(12, 0, 40)));
        // Exactly on a grid point resumes strictly after it.
        let next = resume_after(&every(10_000), t(12, 0, 0), t(12, 0, 30)).unwrap();
        assert_eq!(next, Some(t(12, 0, 40)));
    }

    #[test]
    fn resume_cron_skips_to_after_now() {
        let next = resume_after(&cron("0 * * * * *"), t(11, 0, 0), t(12, 0, 30)).unwrap();
        assert_eq!(next, Some(t(12, 1, 0)));
    }

    #[test]
    fn successive_occurrences_are_monotonic() {
        let s = cron("*/7 * * * * *");
        let mut at = t(12, 0, 0);
        for _ in 0..50 {
            let next = next_after(&s, at).unwrap().unwrap();
            assert!(next > at);
            at = next;
        }
    }
}
