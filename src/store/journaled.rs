use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::journal::{Journal, JournalHandle};
use crate::limits::*;
use crate::model::*;

use super::{CourtTx, Store, StoreError};

type SharedCourtState = Arc<RwLock<CourtState>>;

struct Shared {
    courts: DashMap<Ulid, SharedCourtState>,
    /// Reverse lookup: reservation id → court id.
    reservation_index: DashMap<Ulid, Ulid>,
    journal: JournalHandle,
    /// Held by court creation/update and compaction. Taken before any court lock.
    admin: Mutex<()>,
}

/// In-memory tables backed by the append-only journal. Every mutation is
/// journaled (fsync) before it becomes visible.
#[derive(Clone)]
pub struct JournaledStore {
    shared: Arc<Shared>,
}

/// Apply a per-court event. `CourtCreated` is handled at the map level.
fn apply_to_court(cs: &mut CourtState, event: &Event) {
    match event {
        Event::CourtUpdated { court } => cs.court = court.clone(),
        Event::ReservationCreated { reservation } => cs.insert_reservation(reservation.clone()),
        Event::StatusChanged { id, status, at, .. } => {
            if let Some(r) = cs.reservation_mut(id) {
                r.status = *status;
                r.updated_at = *at;
            }
        }
        Event::CourtCreated { .. } => {}
    }
}

fn event_court_id(event: &Event) -> Ulid {
    match event {
        Event::CourtCreated { court } | Event::CourtUpdated { court } => court.id,
        Event::ReservationCreated { reservation } => reservation.court_id,
        Event::StatusChanged { court_id, .. } => *court_id,
    }
}

fn check_court(court: &Court) -> Result<(), StoreError> {
    if court.name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("court name too long"));
    }
    if !(0..=MAX_UNIT_PRICE).contains(&court.unit_price) {
        return Err(StoreError::LimitExceeded("unit price out of range"));
    }
    Ok(())
}

impl JournaledStore {
    /// Replay the journal at `path` and start its writer task. Must be
    /// called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (journal, events) = Journal::recover(path)?;
        let journal = JournalHandle::spawn(journal);

        let mut courts: HashMap<Ulid, CourtState> = HashMap::new();
        let reservation_index = DashMap::new();
        for event in &events {
            if let Event::CourtCreated { court } = event {
                courts.insert(court.id, CourtState::new(court.clone()));
                continue;
            }
            let Some(cs) = courts.get_mut(&event_court_id(event)) else {
                continue;
            };
            if let Event::ReservationCreated { reservation } = event {
                if reservation.status.is_occupying()
                    && let Some(existing) = cs.occupying_conflict(&reservation.span)
                {
                    warn!(
                        reservation = %reservation.id,
                        conflicting = %existing.id,
                        court = %reservation.court_id,
                        "skipping journaled reservation that overlaps an occupying one"
                    );
                    continue;
                }
                reservation_index.insert(reservation.id, reservation.court_id);
            }
            apply_to_court(cs, event);
        }

        info!(
            events = events.len(),
            courts = courts.len(),
            reservations = reservation_index.len(),
            "journal replayed from {}",
            path.display()
        );

        let shared = Shared {
            courts: courts
                .into_iter()
                .map(|(id, cs)| (id, Arc::new(RwLock::new(cs))))
                .collect(),
            reservation_index,
            journal,
            admin: Mutex::new(()),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    fn court_state(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.shared.courts.get(id).map(|e| e.value().clone())
    }

    fn all_court_states(&self) -> Vec<(Ulid, SharedCourtState)> {
        self.shared
            .courts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.shared.journal.appends_since_compact().await
    }

    /// Rewrite the journal as current state: one `CourtCreated` per court and
    /// one `ReservationCreated` (current status) per reservation.
    ///
    /// Every court is write-locked, in id order, while the snapshot is taken
    /// and written, so no append can slip between snapshot and rewrite.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _admin = self.shared.admin.lock().await;
        let mut states = self.all_court_states();
        states.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(states.len());
        for (_, cs) in states {
            guards.push(cs.write_owned().await);
        }

        let mut events = Vec::new();
        for cs in &guards {
            events.push(Event::CourtCreated {
                court: cs.court.clone(),
            });
            events.extend(cs.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        let count = events.len();
        self.shared.journal.compact(events).await?;
        info!(events = count, "journal compacted");
        Ok(())
    }
}

#[async_trait]
impl Store for JournaledStore {
    async fn find_court(&self, id: Ulid) -> Result<Option<Court>, StoreError> {
        let Some(cs) = self.court_state(&id) else {
            return Ok(None);
        };
        let guard = cs.read().await;
        Ok(Some(guard.court.clone()))
    }

    async fn active_courts(&self) -> Result<Vec<Court>, StoreError> {
        let mut out = Vec::new();
        for (_, cs) in self.all_court_states() {
            let guard = cs.read().await;
            if guard.court.active {
                out.push(guard.court.clone());
            }
        }
        Ok(out)
    }

    async fn has_occupying_overlap(&self, court_id: Ulid, span: Span) -> Result<bool, StoreError> {
        let cs = self
            .court_state(&court_id)
            .ok_or(StoreError::CourtNotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard.occupying_conflict(&span).is_some())
    }

    async fn begin(&self, court_id: Ulid) -> Result<Option<Box<dyn CourtTx>>, StoreError> {
        let Some(cs) = self.court_state(&court_id) else {
            return Ok(None);
        };
        let guard = cs.write_owned().await;
        Ok(Some(Box::new(JournaledTx {
            shared: self.shared.clone(),
            guard,
            staged: Vec::new(),
        })))
    }

    async fn find_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(court_id) = self.shared.reservation_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(cs) = self.court_state(&court_id) else {
            return Ok(None);
        };
        let guard = cs.read().await;
        Ok(guard.reservation(&id).cloned())
    }

    async fn conditional_update_status(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        new: ReservationStatus,
        now: Ms,
    ) -> Result<bool, StoreError> {
        let Some(court_id) = self.shared.reservation_index.get(&id).map(|e| *e.value()) else {
            return Ok(false);
        };
        let Some(cs) = self.court_state(&court_id) else {
            return Ok(false);
        };
        let mut guard = cs.write().await;
        if guard.reservation(&id).map(|r| r.status) != Some(expected) {
            return Ok(false);
        }
        let event = Event::StatusChanged {
            id,
            court_id,
            status: new,
            at: now,
        };
        self.shared.journal.append(vec![event.clone()]).await?;
        apply_to_court(&mut guard, &event);
        Ok(true)
    }

    async fn pending_expiries(&self) -> Result<Vec<(Ulid, Ms)>, StoreError> {
        let mut out = Vec::new();
        for (_, cs) in self.all_court_states() {
            let guard = cs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.status == ReservationStatus::PendingPayment)
                    .map(|r| (r.id, r.expires_at)),
            );
        }
        out.sort_by_key(|&(id, expires_at)| (expires_at, id));
        Ok(out)
    }

    async fn court_reservations(&self, court_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        let cs = self
            .court_state(&court_id)
            .ok_or(StoreError::CourtNotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard.reservations.clone())
    }

    async fn insert_court(&self, court: Court) -> Result<(), StoreError> {
        check_court(&court)?;
        let _admin = self.shared.admin.lock().await;
        if self.shared.courts.contains_key(&court.id) {
            return Err(StoreError::DuplicateId(court.id));
        }
        if self.shared.courts.len() >= MAX_COURTS {
            return Err(StoreError::LimitExceeded("too many courts"));
        }
        self.shared
            .journal
            .append(vec![Event::CourtCreated {
                court: court.clone(),
            }])
            .await?;
        self.shared
            .courts
            .insert(court.id, Arc::new(RwLock::new(CourtState::new(court))));
        Ok(())
    }

    async fn update_court(&self, court: Court) -> Result<(), StoreError> {
        check_court(&court)?;
        let _admin = self.shared.admin.lock().await;
        let cs = self
            .court_state(&court.id)
            .ok_or(StoreError::CourtNotFound(court.id))?;
        let mut guard = cs.write().await;
        let event = Event::CourtUpdated { court };
        self.shared.journal.append(vec![event.clone()]).await?;
        apply_to_court(&mut guard, &event);
        Ok(())
    }
}

struct JournaledTx {
    shared: Arc<Shared>,
    guard: OwnedRwLockWriteGuard<CourtState>,
    staged: Vec<Reservation>,
}

impl JournaledTx {
    fn staged_conflict(&self, span: &Span) -> Option<&Reservation> {
        self.guard
            .occupying_conflict(span)
            .or_else(|| self.staged.iter().find(|r| r.span.overlaps(span)))
    }
}

#[async_trait]
impl CourtTx for JournaledTx {
    fn court(&self) -> &Court {
        &self.guard.court
    }

    fn has_occupying_overlap(&self, span: &Span) -> bool {
        self.staged_conflict(span).is_some()
    }

    fn insert_reservation(&mut self, new: NewReservation) -> Result<Reservation, StoreError> {
        let court_id = self.guard.court.id;
        if new.court_id != court_id {
            return Err(StoreError::CourtNotFound(new.court_id));
        }
        if let Some(existing) = self.staged_conflict(&new.span) {
            return Err(StoreError::ExclusionViolation {
                court_id,
                conflicting: existing.id,
            });
        }
        if self.shared.reservation_index.contains_key(&new.id)
            || self.staged.iter().any(|r| r.id == new.id)
        {
            return Err(StoreError::DuplicateId(new.id));
        }
        if self.guard.reservations.len() + self.staged.len() >= MAX_RESERVATIONS_PER_COURT {
            return Err(StoreError::LimitExceeded("too many reservations on court"));
        }
        if new.principal.len() > MAX_PRINCIPAL_LEN {
            return Err(StoreError::LimitExceeded("principal too long"));
        }
        let reservation = new.into_reservation();
        self.staged.push(reservation.clone());
        Ok(reservation)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let events = self
            .staged
            .iter()
            .map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            })
            .collect();
        self.shared.journal.append(events).await?;
        for reservation in self.staged.drain(..) {
            self.shared
                .reservation_index
                .insert(reservation.id, reservation.court_id);
            self.guard.insert_reservation(reservation);
        }
        Ok(())
    }
}
