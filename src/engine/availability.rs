use tracing::info;

use crate::clock;
use crate::model::*;
use crate::observability;
use crate::pricing;
use crate::validate;

use super::{BookingEngine, BookingError};

/// What a window would cost on a given court.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub duration_minutes: i64,
    pub total_price: i64,
}

impl BookingEngine {
    /// Active courts with no occupying reservation intersecting `span`,
    /// ordered by name then id. Read-only; the answer may be stale by the
    /// time the caller books.
    pub async fn query_availability(&self, span: Span) -> Result<Vec<Court>, BookingError> {
        let started = std::time::Instant::now();
        metrics::counter!(observability::AVAILABILITY_SEARCHES_TOTAL).increment(1);
        validate::check_window(&span, &self.policy().window)?;

        let mut available = Vec::new();
        for court in self.list_courts().await? {
            if !self.store.has_occupying_overlap(court.id, span).await? {
                available.push(court);
            }
        }

        if available.is_empty() {
            metrics::counter!(observability::AVAILABILITY_EMPTY_TOTAL).increment(1);
        }
        metrics::histogram!(observability::AVAILABILITY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(
            start = span.start,
            end = span.end,
            result_count = available.len(),
            "available courts search"
        );
        Ok(available)
    }

    /// Price of `span` on `court` at its current unit price.
    pub fn quote(&self, court: &Court, span: &Span) -> Quote {
        let duration_minutes = clock::duration_minutes(span);
        Quote {
            duration_minutes,
            total_price: pricing::total_price(court.unit_price, duration_minutes),
        }
    }
}
