use std::collections::HashSet;

use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::admission::{self, is_student_id, now_ms};
use super::{Engine, EngineError};

impl Engine {
    /// Queue for an exact slot. Participants are kept as submitted and only
    /// resolved at promotion time.
    pub async fn join_waitlist(
        &self,
        id: Ulid,
        room_id: RoomId,
        user_id: UserId,
        span: Span,
        participants: Vec<String>,
    ) -> Result<WaitlistInfo, EngineError> {
        let now = now_ms();
        admission::validate_slot(&span)?;
        admission::check_window(&span, now)?;
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::UserNotFound(user_id));
        }
        if participants.len() > MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        for sid in &participants {
            if !is_student_id(sid) {
                return Err(EngineError::BadParticipantId(sid.clone()));
            }
        }

        let room_arc = self
            .get_room(&room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let mut room = room_arc.write_owned().await;
        if room.waitlist.len() >= MAX_WAITLIST_PER_ROOM {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        // The raw id count is an upper bound on the party: a party that
        // cannot fit even before unresolvables drop can never promote.
        admission::check_capacity(&room, 1 + participants.len() as u32)?;
        let duplicate = room.waitlist.iter().any(|e| {
            e.status == WaitlistStatus::Waiting && e.user_id == user_id && e.span == span
        });
        if duplicate {
            return Err(EngineError::DuplicateWaitlist);
        }
        // Room lock first, then the ledger, same order as admission.
        let ledger = self.ledger_handle(user_id);
        if ledger.read().await.at_quota(now) {
            return Err(EngineError::QuotaExceeded(user_id));
        }

        let position = room.next_queue_position(&span);
        let event = Event::WaitlistJoined {
            id,
            room_id,
            user_id,
            span,
            participants,
            position,
            submitted_at: now,
        };
        self.persist_and_apply(&mut room, &event).await?;

        Ok(WaitlistInfo {
            id,
            room_id,
            room_name: room.name.clone(),
            user_id,
            span,
            position,
            submitted_at: now,
        })
    }

    /// Withdraw a waiting entry. Its queue position is never handed out again.
    pub async fn cancel_waitlist(&self, id: Ulid, acting: UserId) -> Result<(), EngineError> {
        let room_id = self.room_of_entry(&id).ok_or(EngineError::NotFound(id))?;
        let room_arc = self.get_room(&room_id).ok_or(EngineError::NotFound(id))?;
        let mut room = room_arc.write_owned().await;
        let entry = room.find_entry(id).ok_or(EngineError::NotFound(id))?;
        if entry.user_id != acting {
            return Err(EngineError::Forbidden);
        }
        if entry.status != WaitlistStatus::Waiting {
            return Err(EngineError::NotWaiting(id));
        }

        let event = Event::WaitlistCancelled { id, room_id };
        self.persist_and_apply(&mut room, &event).await
    }

    /// Offer a freed span to the waitlist. Candidates are every waiting entry
    /// whose slot fits inside the span, oldest submission first (position
    /// breaks ties). The working occupied set starts from whatever still
    /// overlaps the span and grows with each promotion, so several disjoint
    /// entries can fill one wide cancellation.
    ///
    /// Returns the ids of the promoted entries. Safe to call twice with the
    /// same span: already-promoted entries are no longer waiting.
    pub async fn reassign_freed(
        &self,
        room_id: RoomId,
        freed: Span,
    ) -> Result<Vec<Ulid>, EngineError> {
        let room_arc = match self.get_room(&room_id) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };

        // Snapshot candidates and current occupancy, then release the lock.
        // Promotions re-validate under their own critical section.
        let (candidates, mut occupied) = {
            let room = room_arc.read().await;
            let mut c: Vec<WaitlistEntry> = room
                .waitlist
                .iter()
                .filter(|e| {
                    e.status == WaitlistStatus::Waiting && freed.contains_span(&e.span)
                })
                .cloned()
                .collect();
            c.sort_by(|a, b| {
                a.submitted_at
                    .cmp(&b.submitted_at)
                    .then(a.position.cmp(&b.position))
            });
            let occ: Vec<Span> = room.overlapping(&freed).map(|r| r.span).collect();
            (c, occ)
        };

        let mut promoted = Vec::new();
        for entry in candidates {
            if occupied.iter().any(|s| s.overlaps(&entry.span)) {
                continue;
            }
            // One failing entry must not abort the rest of the pass.
            match self.promote_entry(&entry).await {
                Ok(Some(_)) => {
                    occupied.push(entry.span);
                    promoted.push(entry.id);
                }
                Ok(None) => {}
                Err(e) => warn!("promotion of waitlist entry {} failed: {e}", entry.id),
            }
        }
        Ok(promoted)
    }

    /// Try to turn one waiting entry into a reservation.
    ///
    /// Ok(Some(reservation_id)) — promoted.
    /// Ok(None) — not promoted: the entry was cancelled if it can never
    /// succeed (owner or a participant over quota, slot already started,
    /// owner gone), and left waiting on transient failures (slot occupied,
    /// room full).
    /// Err — WAL failure only.
    pub(super) async fn promote_entry(
        &self,
        entry: &WaitlistEntry,
    ) -> Result<Option<Ulid>, EngineError> {
        let now = now_ms();
        let room_arc = match self.get_room(&entry.room_id) {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut room = room_arc.write_owned().await;

        // Entry may have been cancelled or promoted since the snapshot.
        match room.find_entry(entry.id) {
            Some(e) if e.status == WaitlistStatus::Waiting => {}
            _ => return Ok(None),
        }

        if entry.span.start <= now || !self.users.contains_key(&entry.user_id) {
            self.cancel_entry_locked(&mut room, entry.id, entry.room_id)
                .await?;
            return Ok(None);
        }

        // Promotion is lenient about participants: ids that no longer
        // resolve are dropped rather than blocking the owner.
        let mut resolved: Vec<UserId> = Vec::new();
        let mut seen = HashSet::new();
        for sid in &entry.participants {
            if let Some(uid) = self.student_index.get(sid) {
                let uid = *uid.value();
                if uid != entry.user_id && seen.insert(uid) {
                    resolved.push(uid);
                }
            }
        }

        let mut holders: Vec<UserId> = resolved.clone();
        holders.push(entry.user_id);
        holders.sort_unstable();
        holders.dedup();
        let mut ledgers = self.lock_ledgers(&holders).await;

        let owner_idx = holders
            .binary_search(&entry.user_id)
            .expect("owner is in the holder set");
        if ledgers[owner_idx].at_quota(now) {
            self.cancel_entry_locked(&mut room, entry.id, entry.room_id)
                .await?;
            return Ok(None);
        }

        // A participant over their own quota fails the entry for good: the
        // submitted party cannot be honored, so the entry is cancelled
        // rather than promoted short-handed.
        for uid in &resolved {
            let idx = holders.binary_search(uid).expect("holder set covers party");
            if ledgers[idx].at_quota(now) {
                self.cancel_entry_locked(&mut room, entry.id, entry.room_id)
                    .await?;
                return Ok(None);
            }
        }

        if admission::check_capacity(&room, 1 + resolved.len() as u32).is_err()
            || admission::check_overlap(&room, &entry.span).is_err()
        {
            return Ok(None);
        }

        // The reservation and the assignment are one commit unit: replay
        // must never see a promoted slot with its entry still waiting.
        let reservation_id = Ulid::new();
        let created = Event::ReservationCreated {
            id: reservation_id,
            room_id: entry.room_id,
            user_id: entry.user_id,
            span: entry.span,
            participants: resolved.clone(),
            created_at: now,
        };
        let assigned = Event::WaitlistAssigned {
            id: entry.id,
            room_id: entry.room_id,
            reservation_id,
        };
        self.persist_and_apply_all(&mut room, &[created, assigned])
            .await?;

        for (i, uid) in holders.iter().enumerate() {
            if *uid == entry.user_id || resolved.contains(uid) {
                ledgers[i].insert(reservation_id, entry.span.end);
            }
        }
        drop(ledgers);

        let reservation = Reservation {
            id: reservation_id,
            room_id: entry.room_id,
            user_id: entry.user_id,
            span: entry.span,
            participants: resolved,
            created_at: now,
        };
        let snap = self.snapshot(&room, &reservation);
        self.notify
            .send(entry.room_id, &Notice::ReservationCreated(snap));
        self.notify.send(
            entry.room_id,
            &Notice::WaitlistAssigned {
                entry_id: entry.id,
                reservation_id,
                user_id: entry.user_id,
            },
        );
        Ok(Some(reservation_id))
    }

    async fn cancel_entry_locked(
        &self,
        room: &mut RoomState,
        entry_id: Ulid,
        room_id: RoomId,
    ) -> Result<(), EngineError> {
        let event = Event::WaitlistCancelled { id: entry_id, room_id };
        self.persist_and_apply(room, &event).await
    }
}
