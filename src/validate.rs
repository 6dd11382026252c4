//! Booking window rules: 30-minute grid, one local day, operating hours,
//! bounded duration. Runs before the engine touches the store.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};

use crate::clock;
use crate::limits::*;
use crate::model::{MINUTE_MS, Ms, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Minute of day the courts open.
    pub open_minute: u32,
    /// Minute of day the courts close; a window may end exactly here.
    pub close_minute: u32,
    pub slot_minutes: i64,
    pub min_duration_minutes: i64,
    pub max_duration_minutes: i64,
    pub utc_offset: FixedOffset,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            open_minute: DEFAULT_OPEN_MINUTE,
            close_minute: DEFAULT_CLOSE_MINUTE,
            slot_minutes: DEFAULT_SLOT_MINUTES,
            min_duration_minutes: DEFAULT_MIN_DURATION_MINUTES,
            max_duration_minutes: DEFAULT_MAX_DURATION_MINUTES,
            utc_offset: clock::offset_from_minutes(DEFAULT_UTC_OFFSET_MINUTES)
                .expect("default offset is in range"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    NotOrdered,
    OutOfRange,
    OffGrid { slot_minutes: i64 },
    SpansDays,
    OutsideHours { open_minute: u32, close_minute: u32 },
    TooShort { min_minutes: i64 },
    TooLong { max_minutes: i64 },
    BadDate(String),
    BadTime(String),
    BadInstant(String),
}

fn hhmm(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

impl std::fmt::Display for WindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowError::NotOrdered => write!(f, "start must be before end"),
            WindowError::OutOfRange => write!(f, "timestamp out of range"),
            WindowError::OffGrid { slot_minutes } => {
                write!(f, "times must fall on a {slot_minutes}-minute step")
            }
            WindowError::SpansDays => write!(f, "window must start and end on the same day"),
            WindowError::OutsideHours {
                open_minute,
                close_minute,
            } => write!(
                f,
                "window must lie within {}-{}",
                hhmm(*open_minute),
                hhmm(*close_minute)
            ),
            WindowError::TooShort { min_minutes } => {
                write!(f, "duration must be at least {min_minutes} minutes")
            }
            WindowError::TooLong { max_minutes } => {
                write!(f, "duration must be at most {max_minutes} minutes")
            }
            WindowError::BadDate(s) => write!(f, "invalid date: {s}"),
            WindowError::BadTime(s) => write!(f, "invalid time: {s}"),
            WindowError::BadInstant(s) => write!(f, "invalid timestamp: {s}"),
        }
    }
}

impl std::error::Error for WindowError {}

/// Check a `[start, end)` window against the policy.
pub fn check_window(span: &Span, policy: &WindowPolicy) -> Result<(), WindowError> {
    if span.start >= span.end {
        return Err(WindowError::NotOrdered);
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(WindowError::OutOfRange);
    }
    let offset = policy.utc_offset;
    if !clock::on_grid(span.start, policy.slot_minutes, offset)
        || !clock::on_grid(span.end, policy.slot_minutes, offset)
    {
        return Err(WindowError::OffGrid {
            slot_minutes: policy.slot_minutes,
        });
    }

    let (start_date, start_minute) =
        clock::local_parts(span.start, offset).ok_or(WindowError::OutOfRange)?;
    let (end_date, end_minute) =
        clock::local_parts(span.end, offset).ok_or(WindowError::OutOfRange)?;
    if start_date != end_date {
        return Err(WindowError::SpansDays);
    }
    if start_minute < policy.open_minute || end_minute > policy.close_minute {
        return Err(WindowError::OutsideHours {
            open_minute: policy.open_minute,
            close_minute: policy.close_minute,
        });
    }

    let minutes = span.duration_ms() / MINUTE_MS;
    if minutes < policy.min_duration_minutes {
        return Err(WindowError::TooShort {
            min_minutes: policy.min_duration_minutes,
        });
    }
    if minutes > policy.max_duration_minutes {
        return Err(WindowError::TooLong {
            max_minutes: policy.max_duration_minutes,
        });
    }
    Ok(())
}

pub fn parse_date(s: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| WindowError::BadDate(s.to_string()))
}

pub fn parse_time(s: &str) -> Result<NaiveTime, WindowError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| WindowError::BadTime(s.to_string()))
}

/// Build a window from a local date and two `HH:MM` times, then check it.
pub fn window_from_local(
    date: &str,
    start_time: &str,
    end_time: &str,
    policy: &WindowPolicy,
) -> Result<Span, WindowError> {
    let date = parse_date(date)?;
    let start = clock::local_to_instant(date, parse_time(start_time)?, policy.utc_offset)
        .ok_or(WindowError::OutOfRange)?;
    let end = clock::local_to_instant(date, parse_time(end_time)?, policy.utc_offset)
        .ok_or(WindowError::OutOfRange)?;
    if start >= end {
        return Err(WindowError::NotOrdered);
    }
    let span = Span::new(start, end);
    check_window(&span, policy)?;
    Ok(span)
}

/// Accepts RFC 3339 (`2024-01-01T06:00:00+07:00`) or Unix milliseconds.
pub fn parse_instant(s: &str) -> Result<Ms, WindowError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| WindowError::BadInstant(s.to_string()))
}
