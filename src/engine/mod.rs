mod admission;
mod availability;
mod error;
mod lifecycle;
mod reclaim;

pub use admission::BookingRequest;
pub use availability::Quote;
pub use error::BookingError;
pub use reclaim::{ReclaimOutcome, Reclaimer, SweepReport};

use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::auth::Caller;
use crate::limits::DEFAULT_GRACE_MINUTES;
use crate::model::*;
use crate::queue::{DeferredQueue, RetryPolicy};
use crate::store::Store;
use crate::validate::WindowPolicy;

/// Effective business settings for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub window: WindowPolicy,
    /// Time an unpaid reservation holds its slot.
    pub grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            window: WindowPolicy::default(),
            grace: Duration::from_secs(DEFAULT_GRACE_MINUTES as u64 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Fields an admin may change on a court. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourtPatch {
    pub name: Option<String>,
    pub kind: Option<CourtKind>,
    pub unit_price: Option<i64>,
    pub active: Option<bool>,
}

/// Admission, availability and lifecycle of court reservations over an
/// explicitly provided store and deferred queue.
pub struct BookingEngine {
    store: Arc<dyn Store>,
    queue: Arc<dyn DeferredQueue>,
    policy: Policy,
}

impl BookingEngine {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn DeferredQueue>, policy: Policy) -> Self {
        Self {
            store,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Reclaimer sharing this engine's store; register it with the queue.
    pub fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(self.store.clone())
    }

    // ── Court administration ─────────────────────────────────

    fn require_admin(caller: &Caller, what: &'static str) -> Result<(), BookingError> {
        if caller.is_admin() {
            return Ok(());
        }
        tracing::warn!(principal = %caller.principal, "refused: {what}");
        Err(BookingError::Forbidden(what))
    }

    pub async fn create_court(&self, caller: &Caller, court: Court) -> Result<Court, BookingError> {
        Self::require_admin(caller, "only admins may create courts")?;
        self.store.insert_court(court.clone()).await?;
        tracing::info!(court_id = %court.id, name = %court.name, "court created");
        Ok(court)
    }

    pub async fn update_court(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: CourtPatch,
    ) -> Result<Court, BookingError> {
        Self::require_admin(caller, "only admins may change courts")?;
        let mut court = self
            .store
            .find_court(id)
            .await?
            .ok_or(BookingError::CourtNotFound(id))?;
        if let Some(name) = patch.name {
            court.name = name;
        }
        if let Some(kind) = patch.kind {
            court.kind = kind;
        }
        if let Some(unit_price) = patch.unit_price {
            court.unit_price = unit_price;
        }
        if let Some(active) = patch.active {
            court.active = active;
        }
        self.store.update_court(court.clone()).await?;
        tracing::info!(court_id = %id, "court updated");
        Ok(court)
    }

    pub async fn get_court(&self, id: Ulid) -> Result<Court, BookingError> {
        self.store
            .find_court(id)
            .await?
            .ok_or(BookingError::CourtNotFound(id))
    }

    /// Active courts ordered by name, then id.
    pub async fn list_courts(&self) -> Result<Vec<Court>, BookingError> {
        let mut courts = self.store.active_courts().await?;
        courts.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(courts)
    }
}
