//! Hard limits and business defaults. `Config` may override the business
//! values; the hard limits are fixed.

use crate::model::{MINUTE_MS, Ms};

// ── Business defaults ───────────────────────────────────────────

pub const DEFAULT_GRACE_MINUTES: i64 = 15;
pub const DEFAULT_OPEN_MINUTE: u32 = 6 * 60;
pub const DEFAULT_CLOSE_MINUTE: u32 = 23 * 60;
pub const DEFAULT_SLOT_MINUTES: i64 = 30;
pub const DEFAULT_MIN_DURATION_MINUTES: i64 = 60;
pub const DEFAULT_MAX_DURATION_MINUTES: i64 = 180;
/// +07:00
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 7 * 60;

pub const DEFAULT_ENQUEUE_ATTEMPTS: u32 = 3;
pub const DEFAULT_ENQUEUE_BACKOFF_MS: u64 = 5_000;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Booking attempts one principal may make per rate-limit window.
pub const DEFAULT_BOOKING_RATE_LIMIT: u32 = 5;
pub const DEFAULT_BOOKING_RATE_WINDOW_SECS: u64 = 15 * 60;

// ── Hard limits ─────────────────────────────────────────────────

pub const MAX_COURTS: usize = 10_000;
pub const MAX_RESERVATIONS_PER_COURT: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PRINCIPAL_LEN: usize = 256;
pub const MAX_UNIT_PRICE: i64 = 1_000_000_000_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_GRACE_MS: Ms = 24 * 60 * MINUTE_MS;
