use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtside_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtside_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "courtside_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (appends per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "courtside_journal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations created.
pub const BOOKINGS_CREATED_TOTAL: &str = "courtside_bookings_created_total";

/// Counter: bookings refused because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "courtside_booking_conflicts_total";

/// Counter: booking attempts refused by the per-principal rate limit.
pub const BOOKINGS_RATE_LIMITED_TOTAL: &str = "courtside_bookings_rate_limited_total";

pub const AVAILABILITY_SEARCHES_TOTAL: &str = "courtside_availability_searches_total";

/// Counter: availability searches that found no court.
pub const AVAILABILITY_EMPTY_TOTAL: &str = "courtside_availability_empty_total";

pub const AVAILABILITY_DURATION_SECONDS: &str = "courtside_availability_duration_seconds";

/// Counter: expiry jobs that could not be enqueued after all retries.
pub const EXPIRY_ENQUEUE_FAILURES_TOTAL: &str = "courtside_expiry_enqueue_failures_total";

/// Counter: reservations moved to EXPIRED. Labels: source (job, sweep, payment).
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "courtside_reservations_expired_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertCourt { .. } => "upsert_court",
        Command::DeactivateCourt { .. } => "deactivate_court",
        Command::SelectCourts => "select_courts",
        Command::SelectAvailableCourts { .. } => "select_available_courts",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::ConfirmPayment { .. } => "confirm_payment",
        Command::CancelBooking { .. } => "cancel_booking",
    }
}
