use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use ulid::Ulid;

use crate::clock;
use crate::model::*;
use crate::observability;
use crate::pricing;
use crate::queue::{self, DeferredQueue, ExpiryJob, RetryPolicy, Scheduled};
use crate::store::StoreError;
use crate::validate;

use super::{BookingEngine, BookingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Authenticated caller; stored verbatim on the reservation.
    pub principal: String,
    pub court_id: Ulid,
    pub span: Span,
}

impl BookingEngine {
    /// Reserve `span` on a court for the caller. The reservation starts as
    /// `PENDING_PAYMENT` and is reclaimed if not paid within the grace period.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Reservation, BookingError> {
        self.create_booking_at(request, clock::now_ms()).await
    }

    /// `create_booking` with an explicit creation instant.
    pub async fn create_booking_at(
        &self,
        request: BookingRequest,
        now: Ms,
    ) -> Result<Reservation, BookingError> {
        let result = self.admit(&request, now).await;
        match &result {
            Ok(r) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                info!(
                    reservation_id = %r.id,
                    court_id = %r.court_id,
                    principal = %r.principal,
                    start = r.span.start,
                    end = r.span.end,
                    total_price = r.total_price,
                    "booking created"
                );
                self.schedule_expiry(r, now);
            }
            Err(BookingError::SlotConflict { .. }) => {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                info!(court_id = %request.court_id, "booking rejected: slot taken");
            }
            Err(e) => warn!(court_id = %request.court_id, "booking rejected: {e}"),
        }
        result
    }

    /// Validate, then check and insert under the court's write lock.
    async fn admit(&self, request: &BookingRequest, now: Ms) -> Result<Reservation, BookingError> {
        let policy = self.policy();
        validate::check_window(&request.span, &policy.window)?;

        let court_id = request.court_id;
        let mut tx = self
            .store
            .begin(court_id)
            .await?
            .ok_or(BookingError::CourtNotFound(court_id))?;
        let court = tx.court().clone();
        if !court.active {
            return Err(BookingError::CourtNotFound(court_id));
        }

        let conflict = BookingError::SlotConflict {
            court_id,
            span: request.span,
        };
        if tx.has_occupying_overlap(&request.span) {
            return Err(conflict);
        }

        let duration_minutes = clock::duration_minutes(&request.span);
        let new = NewReservation {
            id: Ulid::new(),
            principal: request.principal.clone(),
            court_id,
            span: request.span,
            duration_minutes,
            unit_price: court.unit_price,
            total_price: pricing::total_price(court.unit_price, duration_minutes),
            expires_at: clock::expiry_deadline(now, policy.grace),
            created_at: now,
        };
        let reservation = match tx.insert_reservation(new) {
            Ok(r) => r,
            Err(StoreError::ExclusionViolation { .. }) => return Err(conflict),
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;
        Ok(reservation)
    }

    /// Hand the expiry job to the queue on a detached task. Never fails the
    /// booking; the periodic sweep covers jobs that could not be enqueued.
    pub(super) fn schedule_expiry(&self, reservation: &Reservation, now: Ms) {
        spawn_expiry_job(
            self.queue.clone(),
            reservation.id,
            reservation.expires_at,
            now,
            self.policy().retry,
        );
    }
}

pub(super) fn spawn_expiry_job(
    queue: Arc<dyn DeferredQueue>,
    reservation_id: Ulid,
    expires_at: Ms,
    now: Ms,
    retry: RetryPolicy,
) {
    let fire_after = Duration::from_millis(expires_at.saturating_sub(now).max(0) as u64);
    tokio::spawn(async move {
        let job = ExpiryJob::new(reservation_id);
        match queue::schedule_with_retry(queue.as_ref(), job, fire_after, retry).await {
            Ok(Scheduled::New) => {
                info!(%reservation_id, delay_ms = fire_after.as_millis() as u64, "expiry job enqueued")
            }
            Ok(Scheduled::Duplicate) => {
                tracing::debug!(%reservation_id, "expiry job already scheduled")
            }
            Err(e) => {
                metrics::counter!(observability::EXPIRY_ENQUEUE_FAILURES_TOTAL).increment(1);
                error!(%reservation_id, "enqueue expiry job failed: {e}");
            }
        }
    });
}
