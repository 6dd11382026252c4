//! Wall-clock and calendar helpers. Everything is expressed in `Ms`; local
//! dates and times only exist at the edges, against a fixed UTC offset.

use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike};

use crate::model::{MINUTE_MS, Ms, Span};

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Absolute instant of `date` at `time` in the given offset.
pub fn local_to_instant(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<Ms> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.timestamp_millis())
}

/// Local calendar date and minute-of-day of an instant.
pub fn local_parts(instant: Ms, offset: FixedOffset) -> Option<(NaiveDate, u32)> {
    let dt = offset.timestamp_millis_opt(instant).single()?;
    let minute = dt.hour() * 60 + dt.minute();
    Some((dt.date_naive(), minute))
}

/// True if the instant falls on a whole minute boundary that is a multiple
/// of `step_minutes` in local time.
pub fn on_grid(instant: Ms, step_minutes: i64, offset: FixedOffset) -> bool {
    if instant.rem_euclid(MINUTE_MS) != 0 {
        return false;
    }
    let local_minutes = instant.div_euclid(MINUTE_MS) + i64::from(offset.local_minus_utc() / 60);
    local_minutes.rem_euclid(step_minutes) == 0
}

/// Slot length in whole minutes, rounded to the nearest minute.
pub fn duration_minutes(span: &Span) -> i64 {
    (span.duration_ms() + MINUTE_MS / 2).div_euclid(MINUTE_MS)
}

/// Deadline after which an unpaid reservation created at `created_at`
/// may be reclaimed.
pub fn expiry_deadline(created_at: Ms, grace: Duration) -> Ms {
    created_at + grace.as_millis() as Ms
}

pub fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes * 60)
}

/// RFC 3339 rendering in the given offset; raw milliseconds if out of range.
pub fn format_instant(instant: Ms, offset: FixedOffset) -> String {
    offset
        .timestamp_millis_opt(instant)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| instant.to_string())
}
