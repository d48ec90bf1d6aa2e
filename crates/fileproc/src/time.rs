//! Conversions from configured periods to durations and cutoffs.
//!
//! Settings carry periods as unsigned counts of seconds, hours or days. All
//! conversions here saturate instead of overflowing.

use std::time::Duration;

use chrono::{DateTime, Utc};

const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

pub fn hours(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(SECS_PER_HOUR))
}

pub fn days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(SECS_PER_DAY))
}

/// The instant `period` before `now`. Periods reaching past the earliest
/// representable timestamp clamp to it, so nothing is older than the cutoff.
pub fn cutoff(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(period)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
