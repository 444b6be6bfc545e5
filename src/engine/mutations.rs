use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::admission::{self, is_student_id, now_ms, ParticipantPolicy};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_user(
        &self,
        id: UserId,
        student_id: String,
        name: String,
    ) -> Result<(), EngineError> {
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if !is_student_id(&student_id) {
            return Err(EngineError::BadParticipantId(student_id));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.student_index.get(&student_id) {
            return Err(EngineError::AlreadyExists(*existing.value()));
        }

        let event = Event::UserRegistered {
            id,
            student_id: student_id.clone(),
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.student_index.insert(student_id.clone(), id);
        self.users.insert(id, User { id, student_id, name });
        Ok(())
    }

    pub async fn create_room(
        &self,
        id: RoomId,
        name: String,
        location: Option<String>,
        capacity: u32,
        features: RoomFeatures,
    ) -> Result<(), EngineError> {
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if capacity == 0 {
            return Err(EngineError::LimitExceeded("room capacity must be positive"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            name: name.clone(),
            location: location.clone(),
            capacity,
            features,
        };
        self.wal_append(&event).await?;
        let room = RoomState::new(id, name, location, capacity, features);
        self.rooms.insert(id, Arc::new(RwLock::new(room)));
        Ok(())
    }

    pub async fn update_room(
        &self,
        id: RoomId,
        name: String,
        location: Option<String>,
        capacity: u32,
        features: RoomFeatures,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if capacity == 0 {
            return Err(EngineError::LimitExceeded("room capacity must be positive"));
        }
        let room_arc = self.get_room(&id).ok_or(EngineError::RoomNotFound(id))?;
        let mut room = room_arc.write_owned().await;

        let event = Event::RoomUpdated {
            id,
            name,
            location,
            capacity,
            features,
        };
        self.persist_and_apply(&mut room, &event).await
    }

    /// Rooms with active reservations cannot be deleted. Waitlist entries
    /// for the room disappear with it.
    pub async fn delete_room(&self, id: RoomId) -> Result<(), EngineError> {
        let room_arc = self.get_room(&id).ok_or(EngineError::RoomNotFound(id))?;
        let room = room_arc.write_owned().await;
        if !room.reservations.is_empty() {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        for entry in &room.waitlist {
            self.waitlist_rooms.remove(&entry.id);
        }
        self.rooms.remove(&id);
        self.notify.remove(&id);
        Ok(())
    }

    /// Resolve raw student ids to internal user ids. The owner is filtered
    /// out, duplicates collapse, and unknown ids follow the configured policy.
    pub(super) fn resolve_participants(
        &self,
        raw: &[String],
        owner: UserId,
    ) -> Result<Vec<UserId>, EngineError> {
        if raw.len() > MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        let mut resolved = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();
        for sid in raw {
            if !is_student_id(sid) {
                return Err(EngineError::BadParticipantId(sid.clone()));
            }
            match self.student_index.get(sid) {
                Some(uid) => {
                    let uid = *uid.value();
                    if uid != owner && seen.insert(uid) {
                        resolved.push(uid);
                    }
                }
                None => match self.participant_policy {
                    ParticipantPolicy::Drop => {}
                    ParticipantPolicy::Strict => {
                        return Err(EngineError::UnknownParticipant(sid.clone()));
                    }
                },
            }
        }
        Ok(resolved)
    }

    /// Admit a reservation. All checks run in one critical section: the room
    /// write lock plus the quota ledgers of everyone in the party, acquired
    /// in ascending user-id order.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        room_id: RoomId,
        user_id: UserId,
        span: Span,
        participants: &[String],
    ) -> Result<ReservationSnapshot, EngineError> {
        let now = now_ms();
        admission::validate_slot(&span)?;
        admission::check_window(&span, now)?;
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::UserNotFound(user_id));
        }
        let resolved = self.resolve_participants(participants, user_id)?;

        let room_arc = self
            .get_room(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let mut room = room_arc.write_owned().await;
        if room.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations in room"));
        }
        admission::check_capacity(&room, 1 + resolved.len() as u32)?;

        let mut holders: Vec<UserId> = resolved.clone();
        holders.push(user_id);
        holders.sort_unstable();
        holders.dedup();
        let mut ledgers = self.lock_ledgers(&holders).await;

        let owner_idx = holders
            .binary_search(&user_id)
            .expect("owner is in the holder set");
        if ledgers[owner_idx].at_quota(now) {
            return Err(EngineError::QuotaExceeded(user_id));
        }
        admission::check_overlap(&room, &span)?;
        for (i, uid) in holders.iter().enumerate() {
            if *uid == user_id {
                continue;
            }
            if ledgers[i].at_quota(now) {
                let sid = self
                    .users
                    .get(uid)
                    .map(|u| u.student_id.clone())
                    .unwrap_or_default();
                return Err(EngineError::ParticipantQuotaExceeded(sid));
            }
        }

        let event = Event::ReservationCreated {
            id,
            room_id,
            user_id,
            span,
            participants: resolved.clone(),
            created_at: now,
        };
        self.persist_and_apply(&mut room, &event).await?;
        for ledger in ledgers.iter_mut() {
            ledger.insert(id, span.end);
        }

        let reservation = Reservation {
            id,
            room_id,
            user_id,
            span,
            participants: resolved,
            created_at: now,
        };
        let snap = self.snapshot(&room, &reservation);
        self.notify
            .send(room_id, &Notice::ReservationCreated(snap.clone()));
        Ok(snap)
    }

    /// Cancel a reservation and hand the freed slot to the waitlist.
    /// Returns the ids of any promoted waitlist entries.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        acting: UserId,
    ) -> Result<Vec<Ulid>, EngineError> {
        let room_id = self
            .room_of_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let room_arc = self.get_room(&room_id).ok_or(EngineError::NotFound(id))?;
        let mut room = room_arc.write_owned().await;
        let reservation = room
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if reservation.user_id != acting {
            return Err(EngineError::Forbidden);
        }

        let event = Event::ReservationCancelled { id, room_id };
        self.persist_and_apply(&mut room, &event).await?;
        self.release_holders(&reservation).await;
        self.notify.send(
            room_id,
            &Notice::ReservationCancelled {
                id,
                room_id,
                span: reservation.span,
            },
        );
        drop(room);

        self.reassign_freed(room_id, reservation.span).await
    }

    /// Remove a reservation from the quota ledgers of everyone in its party.
    pub(super) async fn release_holders(&self, reservation: &Reservation) {
        let mut holders = reservation.participants.clone();
        holders.push(reservation.user_id);
        holders.sort_unstable();
        holders.dedup();
        let mut ledgers = self.lock_ledgers(&holders).await;
        for ledger in ledgers.iter_mut() {
            ledger.remove(&reservation.id);
        }
    }

    /// Reservations whose end time has passed, for the maintenance sweep.
    pub fn collect_finished(&self, now: Ms) -> Vec<(Ulid, RoomId)> {
        let mut finished = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().clone();
            if let Ok(guard) = room.try_read() {
                for r in &guard.reservations {
                    if r.span.end <= now {
                        finished.push((r.id, guard.id));
                    }
                }
            }
        }
        finished
    }

    /// Flip a past-end reservation to done. No waitlist reassignment: the
    /// freed time is already in the past. Returns false if the reservation
    /// vanished or is still running.
    pub async fn finish_reservation(&self, id: Ulid, room_id: RoomId) -> Result<bool, EngineError> {
        let room_arc = match self.get_room(&room_id) {
            Some(r) => r,
            None => return Ok(false),
        };
        let mut room = room_arc.write_owned().await;
        let reservation = match room.reservations.iter().find(|r| r.id == id) {
            Some(r) if r.span.end <= now_ms() => r.clone(),
            _ => return Ok(false),
        };

        let event = Event::ReservationDone { id, room_id };
        self.persist_and_apply(&mut room, &event).await?;
        self.release_holders(&reservation).await;
        self.notify.send(
            room_id,
            &Notice::ReservationCancelled {
                id,
                room_id,
                span: reservation.span,
            },
        );
        Ok(true)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let mut user_ids: Vec<UserId> = self.users.iter().map(|e| *e.key()).collect();
        user_ids.sort_unstable();
        for uid in user_ids {
            if let Some(user) = self.users.get(&uid) {
                events.push(Event::UserRegistered {
                    id: user.id,
                    student_id: user.student_id.clone(),
                    name: user.name.clone(),
                });
            }
        }

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort_unstable();
        for rid in room_ids {
            let room_arc = match self.get_room(&rid) {
                Some(r) => r,
                None => continue,
            };
            let room = room_arc.read().await;
            events.push(Event::RoomCreated {
                id: room.id,
                name: room.name.clone(),
                location: room.location.clone(),
                capacity: room.capacity,
                features: room.features,
            });
            for r in &room.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    room_id: room.id,
                    user_id: r.user_id,
                    span: r.span,
                    participants: r.participants.clone(),
                    created_at: r.created_at,
                });
            }
            // The full waitlist history is re-emitted so queue positions
            // survive compaction.
            for entry in &room.waitlist {
                events.push(Event::WaitlistJoined {
                    id: entry.id,
                    room_id: room.id,
                    user_id: entry.user_id,
                    span: entry.span,
                    participants: entry.participants.clone(),
                    position: entry.position,
                    submitted_at: entry.submitted_at,
                });
                match entry.status {
                    WaitlistStatus::Waiting => {}
                    WaitlistStatus::Assigned => events.push(Event::WaitlistAssigned {
                        id: entry.id,
                        room_id: room.id,
                        reservation_id: entry.assigned_reservation.unwrap_or_default(),
                    }),
                    WaitlistStatus::Cancelled => events.push(Event::WaitlistCancelled {
                        id: entry.id,
                        room_id: room.id,
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
