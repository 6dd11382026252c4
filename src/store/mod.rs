mod journaled;

pub use journaled::JournaledStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    /// An occupying reservation already covers part of the window.
    ExclusionViolation {
        court_id: Ulid,
        conflicting: Ulid,
    },
    DuplicateId(Ulid),
    CourtNotFound(Ulid),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::ExclusionViolation {
                court_id,
                conflicting,
            } => write!(
                f,
                "exclusion violation on court {court_id}: overlaps reservation {conflicting}"
            ),
            StoreError::DuplicateId(id) => write!(f, "already exists: {id}"),
            StoreError::CourtNotFound(id) => write!(f, "court not found: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Persistence for courts and reservations.
///
/// Implementations must make `begin` exclusive per court: while a
/// `CourtTx` for a court is alive, no other transaction or status update
/// on that court can proceed.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_court(&self, id: Ulid) -> Result<Option<Court>, StoreError>;

    async fn active_courts(&self) -> Result<Vec<Court>, StoreError>;

    /// Snapshot read outside any transaction; may be stale by the time the
    /// caller acts on it.
    async fn has_occupying_overlap(&self, court_id: Ulid, span: Span) -> Result<bool, StoreError>;

    /// Lock the court for writing. `Ok(None)` if the court does not exist.
    async fn begin(&self, court_id: Ulid) -> Result<Option<Box<dyn CourtTx>>, StoreError>;

    async fn find_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Set `new` only if the current status is `expected`. Returns whether
    /// the row changed. An unknown id returns `false`.
    async fn conditional_update_status(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        new: ReservationStatus,
        now: Ms,
    ) -> Result<bool, StoreError>;

    /// `(reservation id, expires_at)` of every reservation still pending payment.
    async fn pending_expiries(&self) -> Result<Vec<(Ulid, Ms)>, StoreError>;

    async fn court_reservations(&self, court_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    async fn insert_court(&self, court: Court) -> Result<(), StoreError>;

    async fn update_court(&self, court: Court) -> Result<(), StoreError>;
}

/// Exclusive write transaction on one court.
///
/// Dropping it without `commit` discards every staged insert.
#[async_trait]
pub trait CourtTx: Send {
    fn court(&self) -> &Court;

    /// Considers committed rows and rows staged in this transaction.
    fn has_occupying_overlap(&self, span: &Span) -> bool;

    /// Stage a `PENDING_PAYMENT` row. Re-checks the exclusion and reports
    /// `ExclusionViolation` instead of staging an overlapping row.
    fn insert_reservation(&mut self, new: NewReservation) -> Result<Reservation, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}
