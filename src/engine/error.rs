use ulid::Ulid;

use crate::model::{ReservationStatus, Span};
use crate::store::StoreError;
use crate::validate::WindowError;

#[derive(Debug)]
pub enum BookingError {
    CourtNotFound(Ulid),
    SlotConflict {
        court_id: Ulid,
        span: Span,
    },
    InvalidWindow(WindowError),
    StoreUnavailable(String),
    ReservationNotFound(Ulid),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// Payment arrived after the grace period; the reservation is gone.
    Expired(Ulid),
    LimitExceeded(&'static str),
    AlreadyExists(Ulid),
    /// The caller's role does not allow the operation.
    Forbidden(&'static str),
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::CourtNotFound(id) => write!(f, "court not found: {id}"),
            BookingError::SlotConflict { court_id, span } => write!(
                f,
                "court {court_id} is already booked within [{}, {})",
                span.start, span.end
            ),
            BookingError::InvalidWindow(e) => write!(f, "invalid booking window: {e}"),
            BookingError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            BookingError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            BookingError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot move from {from} to {to}")
            }
            BookingError::Expired(id) => write!(f, "reservation {id} has expired"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            BookingError::Forbidden(what) => write!(f, "permission denied: {what}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<WindowError> for BookingError {
    fn from(e: WindowError) -> Self {
        BookingError::InvalidWindow(e)
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => BookingError::StoreUnavailable(msg),
            StoreError::CourtNotFound(id) => BookingError::CourtNotFound(id),
            StoreError::LimitExceeded(msg) => BookingError::LimitExceeded(msg),
            StoreError::DuplicateId(id) => BookingError::AlreadyExists(id),
            // admission remaps this itself, with the requested span
            e @ StoreError::ExclusionViolation { .. } => BookingError::StoreUnavailable(e.to_string()),
        }
    }
}
