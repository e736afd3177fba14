//! Timestamp formatting and the gateway's monotonic write clock.
//!
//! Two representations are stored:
//! - `scheduled_time` as naive UTC `YYYY-MM-DD HH:MM:SS`. Fixed width, so
//!   SQLite compares it correctly as text, and whole seconds so a job created
//!   "now" is due within the same second.
//! - `created_at` / `updated_at` / `started_at` / `completed_at` as RFC 3339
//!   with microseconds and a `Z` suffix, also fixed width.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Timelike, Utc};

pub const SCHEDULED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Drop sub-second precision.
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}

pub fn format_scheduled(t: DateTime<Utc>) -> String {
    t.format(SCHEDULED_FORMAT).to_string()
}

/// Parse a `scheduled_time` column.
///
/// Accepts the canonical naive form and, for rows written by other tools,
/// anything RFC 3339 (offset applied, then truncated).
pub fn parse_scheduled(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, SCHEDULED_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| truncate_to_seconds(dt.with_timezone(&Utc)))
}

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Wall clock that never hands out the same instant twice.
///
/// Every write through one gateway takes its `updated_at` from here, so
/// successive transitions of a job always carry strictly increasing stamps
/// even when they land inside the same microsecond.
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if wall > *last {
            wall
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        // Round down to the stored precision; bump again if that collides.
        let next = next
            .with_nanosecond(next.nanosecond() / 1_000 * 1_000)
            .unwrap_or(next);
        let next = if next > *last {
            next
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }

    pub fn timestamp(&self) -> String {
        format_timestamp(self.now())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
