use chrono::{DateTime, Duration, Months, Utc};

use crate::error::{Result, SchedulerError};
use crate::time::truncate_to_seconds;

/// An offset from a reference instant.
///
/// Calendar units (`Months`, `Years`) follow chrono's month arithmetic: the
/// day is clamped to the last day of the target month (Jan 31 + 1 month =
/// Feb 28/29).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Seconds(i64),
    Minutes(i64),
    Hours(i64),
    Days(i64),
    Weeks(i64),
    Months(u32),
    Years(u32),
    Exact(Duration),
}

impl Delay {
    /// `from + self`, or `None` when the result is out of chrono's range.
    pub fn after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Delay::Seconds(n) => from.checked_add_signed(Duration::try_seconds(n)?),
            Delay::Minutes(n) => from.checked_add_signed(Duration::try_minutes(n)?),
            Delay::Hours(n) => from.checked_add_signed(Duration::try_hours(n)?),
            Delay::Days(n) => from.checked_add_signed(Duration::try_days(n)?),
            Delay::Weeks(n) => from.checked_add_signed(Duration::try_weeks(n)?),
            Delay::Months(n) => from.checked_add_months(Months::new(n)),
            Delay::Years(n) => from.checked_add_months(Months::new(n.checked_mul(12)?)),
            Delay::Exact(d) => from.checked_add_signed(d),
        }
    }
}

impl From<Duration> for Delay {
    fn from(d: Duration) -> Self {
        Delay::Exact(d)
    }
}

impl From<std::time::Duration> for Delay {
    fn from(d: std::time::Duration) -> Self {
        // Saturate: anything beyond chrono's range is "never" in practice.
        let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        match Duration::try_seconds(secs) {
            Some(whole) => Delay::Exact(whole + Duration::nanoseconds(d.subsec_nanos() as i64)),
            None => Delay::Seconds(secs),
        }
    }
}

/// When a new job becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Due on the next tick.
    #[default]
    Now,
    /// Due once the delay has elapsed, measured from enqueue time.
    In(Delay),
    /// Due at an absolute instant. Past instants are overdue, not errors.
    At(DateTime<Utc>),
}

impl Schedule {
    /// Resolve to the whole-second instant stored as `scheduled_time`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let at = match self {
            Schedule::Now => now,
            Schedule::In(delay) => delay.after(now).ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("{delay:?} overflows from {now}"))
            })?,
            Schedule::At(at) => *at,
        };
        Ok(truncate_to_seconds(at))
    }
}
