use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Open-interval intersection: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourtKind {
    Single,
    Double,
}

impl CourtKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourtKind::Single => "SINGLE",
            CourtKind::Double => "DOUBLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SINGLE" => Some(CourtKind::Single),
            "DOUBLE" => Some(CourtKind::Double),
            _ => None,
        }
    }
}

/// A bookable court. `unit_price` is integer currency units per hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub name: String,
    pub kind: CourtKind,
    pub unit_price: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    PendingPayment,
    Paid,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    /// Statuses that hold the slot against other bookings.
    pub fn is_occupying(&self) -> bool {
        matches!(self, ReservationStatus::PendingPayment | ReservationStatus::Paid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::PendingPayment => "PENDING_PAYMENT",
            ReservationStatus::Paid => "PAID",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING_PAYMENT" => Some(ReservationStatus::PendingPayment),
            "PAID" => Some(ReservationStatus::Paid),
            "EXPIRED" => Some(ReservationStatus::Expired),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub principal: String,
    pub court_id: Ulid,
    pub span: Span,
    pub duration_minutes: i64,
    /// Court price at creation time; later price changes never reach it.
    pub unit_price: i64,
    pub total_price: i64,
    pub status: ReservationStatus,
    pub expires_at: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Fields for a reservation row about to be inserted. Status is always
/// `PENDING_PAYMENT` on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub principal: String,
    pub court_id: Ulid,
    pub span: Span,
    pub duration_minutes: i64,
    pub unit_price: i64,
    pub total_price: i64,
    pub expires_at: Ms,
    pub created_at: Ms,
}

impl NewReservation {
    pub fn into_reservation(self) -> Reservation {
        Reservation {
            id: self.id,
            principal: self.principal,
            court_id: self.court_id,
            span: self.span,
            duration_minutes: self.duration_minutes,
            unit_price: self.unit_price,
            total_price: self.total_price,
            status: ReservationStatus::PendingPayment,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// A court plus every reservation ever made on it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub court: Court,
    pub reservations: Vec<Reservation>,
}

impl CourtState {
    pub fn new(court: Court) -> Self {
        Self {
            court,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// First occupying reservation intersecting `query`, if any.
    pub fn occupying_conflict(&self, query: &Span) -> Option<&Reservation> {
        self.overlapping(query).find(|r| r.status.is_occupying())
    }
}

/// Journal record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtCreated {
        court: Court,
    },
    CourtUpdated {
        court: Court,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    StatusChanged {
        id: Ulid,
        court_id: Ulid,
        status: ReservationStatus,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn court() -> Court {
        Court {
            id: Ulid::new(),
            name: "Court A".into(),
            kind: CourtKind::Single,
            unit_price: 120_000,
            active: true,
        }
    }

    fn reservation(court_id: Ulid, start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            principal: "alice".into(),
            court_id,
            span: Span::new(start, end),
            duration_minutes: (end - start) / MINUTE_MS,
            unit_price: 120_000,
            total_price: 0,
            status,
            expires_at: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_duration() {
        assert_eq!(Span::new(100, 200).duration_ms(), 100);
    }

    #[test]
    fn occupying_statuses() {
        assert!(ReservationStatus::PendingPayment.is_occupying());
        assert!(ReservationStatus::Paid.is_occupying());
        assert!(!ReservationStatus::Expired.is_occupying());
        assert!(!ReservationStatus::Cancelled.is_occupying());
    }

    #[test]
    fn status_text_roundtrip() {
        for status in [
            ReservationStatus::PendingPayment,
            ReservationStatus::Paid,
            ReservationStatus::Expired,
            ReservationStatus::Cancelled,
        ] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("paid"), Some(ReservationStatus::Paid));
        assert_eq!(ReservationStatus::parse("refunded"), None);
    }

    #[test]
    fn reservations_stay_sorted() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_reservation(reservation(c.id, 300, 400, ReservationStatus::Paid));
        cs.insert_reservation(reservation(c.id, 100, 200, ReservationStatus::Paid));
        cs.insert_reservation(reservation(c.id, 200, 300, ReservationStatus::Paid));
        let starts: Vec<Ms> = cs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_reservation(reservation(c.id, 100, 200, ReservationStatus::Paid));
        cs.insert_reservation(reservation(c.id, 450, 600, ReservationStatus::Paid));
        cs.insert_reservation(reservation(c.id, 1000, 1100, ReservationStatus::Paid));

        let hits: Vec<_> = cs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn occupying_conflict_ignores_freed_slots() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_reservation(reservation(c.id, 100, 200, ReservationStatus::Expired));
        cs.insert_reservation(reservation(c.id, 100, 200, ReservationStatus::Cancelled));
        assert!(cs.occupying_conflict(&Span::new(100, 200)).is_none());

        let pending = reservation(c.id, 150, 250, ReservationStatus::PendingPayment);
        let pending_id = pending.id;
        cs.insert_reservation(pending);
        assert_eq!(
            cs.occupying_conflict(&Span::new(100, 200)).map(|r| r.id),
            Some(pending_id)
        );
        // back-to-back is fine
        assert!(cs.occupying_conflict(&Span::new(250, 300)).is_none());
    }

    #[test]
    fn new_reservation_starts_pending() {
        let new = NewReservation {
            id: Ulid::new(),
            principal: "bob".into(),
            court_id: Ulid::new(),
            span: Span::new(0, 60 * MINUTE_MS),
            duration_minutes: 60,
            unit_price: 100,
            total_price: 100,
            expires_at: 15 * MINUTE_MS,
            created_at: 0,
        };
        let r = new.into_reservation();
        assert_eq!(r.status, ReservationStatus::PendingPayment);
        assert_eq!(r.updated_at, r.created_at);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::CourtCreated { court: court() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
