use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::Caller;
use crate::clock;
use crate::model::*;
use crate::observability;

use super::admission::spawn_expiry_job;
use super::{BookingEngine, BookingError, ReclaimOutcome};

impl BookingEngine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, BookingError> {
        self.store
            .find_reservation(id)
            .await?
            .ok_or(BookingError::ReservationNotFound(id))
    }

    /// The reservation if `caller` may see it. Someone else's reservation is
    /// reported as not found.
    pub async fn reservation_for(&self, caller: &Caller, id: Ulid) -> Result<Reservation, BookingError> {
        let reservation = self.get_reservation(id).await?;
        if !caller.can_access(&reservation) {
            warn!(reservation_id = %id, principal = %caller.principal, "access to foreign reservation refused");
            return Err(BookingError::ReservationNotFound(id));
        }
        Ok(reservation)
    }

    /// Reservations on the court visible to `caller`, any status, ordered by
    /// start.
    pub async fn court_reservations(
        &self,
        caller: &Caller,
        court_id: Ulid,
    ) -> Result<Vec<Reservation>, BookingError> {
        let mut reservations = self.store.court_reservations(court_id).await?;
        reservations.retain(|r| caller.can_access(r));
        Ok(reservations)
    }

    pub async fn confirm_payment(&self, caller: &Caller, id: Ulid) -> Result<Reservation, BookingError> {
        self.confirm_payment_at(caller, id, clock::now_ms()).await
    }

    /// `PENDING_PAYMENT → PAID`. A payment at or past the deadline is refused
    /// and the reservation reclaimed on the spot.
    pub async fn confirm_payment_at(
        &self,
        caller: &Caller,
        id: Ulid,
        now: Ms,
    ) -> Result<Reservation, BookingError> {
        let current = self.reservation_for(caller, id).await?;
        if current.status == ReservationStatus::PendingPayment && now >= current.expires_at {
            let outcome = self.reclaimer().reclaim_at(id, now).await;
            if outcome == ReclaimOutcome::Expired {
                metrics::counter!(observability::RESERVATIONS_EXPIRED_TOTAL, "source" => "payment")
                    .increment(1);
            }
            warn!(reservation_id = %id, "payment refused: reservation expired");
            return Err(BookingError::Expired(id));
        }

        let changed = self
            .store
            .conditional_update_status(
                id,
                ReservationStatus::PendingPayment,
                ReservationStatus::Paid,
                now,
            )
            .await?;
        let after = self.get_reservation(id).await?;
        if !changed {
            if after.status == ReservationStatus::Expired {
                return Err(BookingError::Expired(id));
            }
            return Err(BookingError::InvalidTransition {
                id,
                from: after.status,
                to: ReservationStatus::Paid,
            });
        }
        info!(reservation_id = %id, "payment confirmed");
        Ok(after)
    }

    pub async fn cancel_booking(&self, caller: &Caller, id: Ulid) -> Result<Reservation, BookingError> {
        self.cancel_booking_at(caller, id, clock::now_ms()).await
    }

    /// `PENDING_PAYMENT → CANCELLED`, or `PAID → CANCELLED`.
    pub async fn cancel_booking_at(
        &self,
        caller: &Caller,
        id: Ulid,
        now: Ms,
    ) -> Result<Reservation, BookingError> {
        self.reservation_for(caller, id).await?;
        for from in [ReservationStatus::PendingPayment, ReservationStatus::Paid] {
            let changed = self
                .store
                .conditional_update_status(id, from, ReservationStatus::Cancelled, now)
                .await?;
            if changed {
                info!(reservation_id = %id, %from, "booking cancelled");
                return self.get_reservation(id).await;
            }
        }
        let current = self.get_reservation(id).await?;
        Err(BookingError::InvalidTransition {
            id,
            from: current.status,
            to: ReservationStatus::Cancelled,
        })
    }

    /// Schedule an expiry job for every reservation still pending payment.
    /// Run once at startup: the local queue does not survive restarts.
    pub async fn rehydrate_expiry_jobs(&self) -> Result<usize, BookingError> {
        let pending = self.store.pending_expiries().await?;
        let now = clock::now_ms();
        for &(id, expires_at) in &pending {
            spawn_expiry_job(self.queue.clone(), id, expires_at, now, self.policy().retry);
        }
        info!(count = pending.len(), "expiry jobs rehydrated");
        Ok(pending.len())
    }
}
