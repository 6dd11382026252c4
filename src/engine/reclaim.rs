use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::clock;
use crate::model::*;
use crate::observability;
use crate::queue::{ExpiryHandler, ExpiryJob};
use crate::store::Store;

/// Result of one reclaim attempt. Every variant except `Expired` is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Expired,
    Missing,
    NotPending(ReservationStatus),
    NotYetDue,
    /// Another path changed the status between the read and the update.
    LostRace,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
}

/// Moves overdue `PENDING_PAYMENT` reservations to `EXPIRED`. Safe to run
/// any number of times, in any order, concurrently with payment.
#[derive(Clone)]
pub struct Reclaimer {
    store: Arc<dyn Store>,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn reclaim(&self, id: Ulid) -> ReclaimOutcome {
        self.reclaim_at(id, clock::now_ms()).await
    }

    pub async fn reclaim_at(&self, id: Ulid, now: Ms) -> ReclaimOutcome {
        let outcome = self.try_reclaim(id, now).await;
        match outcome {
            ReclaimOutcome::Expired => info!(reservation_id = %id, "reservation expired"),
            ReclaimOutcome::Failed => {}
            other => debug!(reservation_id = %id, ?other, "reclaim skipped"),
        }
        outcome
    }

    async fn try_reclaim(&self, id: Ulid, now: Ms) -> ReclaimOutcome {
        let reservation = match self.store.find_reservation(id).await {
            Ok(Some(r)) => r,
            Ok(None) => return ReclaimOutcome::Missing,
            Err(e) => {
                error!(reservation_id = %id, "reclaim lookup failed: {e}");
                return ReclaimOutcome::Failed;
            }
        };
        if reservation.status != ReservationStatus::PendingPayment {
            return ReclaimOutcome::NotPending(reservation.status);
        }
        if now < reservation.expires_at {
            return ReclaimOutcome::NotYetDue;
        }
        match self
            .store
            .conditional_update_status(
                id,
                ReservationStatus::PendingPayment,
                ReservationStatus::Expired,
                now,
            )
            .await
        {
            Ok(true) => ReclaimOutcome::Expired,
            Ok(false) => ReclaimOutcome::LostRace,
            Err(e) => {
                error!(reservation_id = %id, "reclaim update failed: {e}");
                ReclaimOutcome::Failed
            }
        }
    }

    /// Reclaim every pending reservation whose deadline is at or before `now`.
    pub async fn sweep(&self, now: Ms) -> SweepReport {
        let pending = match self.store.pending_expiries().await {
            Ok(p) => p,
            Err(e) => {
                error!("expiry sweep scan failed: {e}");
                return SweepReport::default();
            }
        };
        let mut report = SweepReport {
            scanned: pending.len(),
            expired: 0,
        };
        for (id, expires_at) in pending {
            if expires_at > now {
                continue;
            }
            if self.reclaim_at(id, now).await == ReclaimOutcome::Expired {
                metrics::counter!(observability::RESERVATIONS_EXPIRED_TOTAL, "source" => "sweep")
                    .increment(1);
                report.expired += 1;
            }
        }
        report
    }
}

#[async_trait]
impl ExpiryHandler for Reclaimer {
    async fn on_fire(&self, job: ExpiryJob) {
        if self.reclaim(job.reservation_id).await == ReclaimOutcome::Expired {
            metrics::counter!(observability::RESERVATIONS_EXPIRED_TOTAL, "source" => "job")
                .increment(1);
        }
    }
}
