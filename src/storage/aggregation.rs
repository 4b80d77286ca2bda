//! Granularity rules for range and comparison queries.
//!
//! The SQL in [`super::sqlite_manager`] does the grouping; these functions
//! pick its parameters. [`bucket_start`] is the reference the SQL bucket key
//! is checked against.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

use crate::utils::error::StoreError;

/// Number of calendar days covered by `start..=end`.
pub fn inclusive_day_count(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

/// Bucket width in minutes for a span of `days` inclusive days.
pub fn bucket_minutes_for_days(days: i64) -> u32 {
    match days {
        d if d <= 1 => 5,
        d if d <= 7 => 30,
        _ => 60,
    }
}

pub fn bucket_minutes(start: NaiveDate, end: NaiveDate) -> u32 {
    bucket_minutes_for_days(inclusive_day_count(start, end))
}

/// Floors `ts` to a multiple of `width` minutes within its hour.
pub fn bucket_start(ts: NaiveDateTime, width_minutes: u32) -> NaiveDateTime {
    let width = width_minutes.clamp(1, 60);
    let minute = (ts.minute() / width) * width;
    ts.date()
        .and_hms_opt(ts.hour(), minute, 0)
        .unwrap_or(ts)
}

/// Half-open `[start 00:00:00, end + 1 day 00:00:00)` bounds for a date range.
pub fn range_bounds(start: NaiveDate, end: NaiveDate) -> Result<(NaiveDateTime, NaiveDateTime), StoreError> {
    if end < start {
        return Err(StoreError::InvalidRange(format!(
            "end date {} is before start date {}",
            end, start
        )));
    }
    let exclusive_end = end
        .checked_add_signed(Duration::days(1))
        .ok_or_else(|| StoreError::InvalidRange(format!("end date {} out of range", end)))?;
    Ok((midnight(start)?, midnight(exclusive_end)?))
}

fn midnight(date: NaiveDate) -> Result<NaiveDateTime, StoreError> {
    date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| StoreError::InvalidRange(format!("no midnight on {}", date)))
}

/// Row skip rate for the two-series comparison view.
pub fn skip_for_span(start: NaiveDate, end: NaiveDate) -> u32 {
    match (end - start).num_days() {
        d if d >= 7 => 300,
        d if d >= 3 => 60,
        d if d >= 1 => 5,
        _ => 1,
    }
}
