mod admission;
mod error;
mod mutations;
mod queries;
mod quota;
mod waitlist;

pub use admission::ParticipantPolicy;
pub use error::EngineError;
pub use queries::{merge_overlapping, subtract_intervals};
pub use quota::UserLedger;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub(super) type SharedLedger = Arc<RwLock<UserLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One commit unit. Multi-event units (promotion writes the reservation
    /// and the assignment together) hit the file in one flush and are acked
    /// with a single response.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Vec<Event>, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'units: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'units;
            }
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(
    batch: &mut Vec<(Vec<Event>, oneshot::Sender<io::Result<()>>)>,
    result: &io::Result<()>,
) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub rooms: DashMap<RoomId, SharedRoomState>,
    pub users: DashMap<UserId, User>,
    /// student_id → user id, for resolving participant lists.
    pub(super) student_index: DashMap<String, UserId>,
    /// Per-user quota ledgers, created on demand.
    pub(super) ledgers: DashMap<UserId, SharedLedger>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_rooms: DashMap<Ulid, RoomId>,
    /// Reverse lookup: waitlist entry id → room id.
    pub(super) waitlist_rooms: DashMap<Ulid, RoomId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub participant_policy: ParticipantPolicy,
}

/// Apply a room-scoped event to a RoomState (no locking — caller holds the lock).
fn apply_to_room(room: &mut RoomState, event: &Event) {
    match event {
        Event::RoomUpdated {
            name,
            location,
            capacity,
            features,
            ..
        } => {
            room.name = name.clone();
            room.location = location.clone();
            room.capacity = *capacity;
            room.features = *features;
        }
        Event::ReservationCreated {
            id,
            room_id,
            user_id,
            span,
            participants,
            created_at,
        } => {
            room.insert_reservation(Reservation {
                id: *id,
                room_id: *room_id,
                user_id: *user_id,
                span: *span,
                participants: participants.clone(),
                created_at: *created_at,
            });
        }
        Event::ReservationCancelled { id, .. } | Event::ReservationDone { id, .. } => {
            room.remove_reservation(*id);
        }
        Event::WaitlistJoined {
            id,
            room_id,
            user_id,
            span,
            participants,
            position,
            submitted_at,
        } => {
            room.waitlist.push(WaitlistEntry {
                id: *id,
                room_id: *room_id,
                user_id: *user_id,
                span: *span,
                participants: participants.clone(),
                position: *position,
                submitted_at: *submitted_at,
                status: WaitlistStatus::Waiting,
                assigned_reservation: None,
            });
        }
        Event::WaitlistAssigned {
            id, reservation_id, ..
        } => {
            if let Some(entry) = room.find_entry_mut(*id) {
                entry.status = WaitlistStatus::Assigned;
                entry.assigned_reservation = Some(*reservation_id);
            }
        }
        Event::WaitlistCancelled { id, .. } => {
            if let Some(entry) = room.find_entry_mut(*id) {
                entry.status = WaitlistStatus::Cancelled;
            }
        }
        // Engine-level events are handled at the DashMap level, not here
        Event::UserRegistered { .. }
        | Event::RoomCreated { .. }
        | Event::RoomDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        participant_policy: ParticipantPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            student_index: DashMap::new(),
            ledgers: DashMap::new(),
            reservation_rooms: DashMap::new(),
            waitlist_rooms: DashMap::new(),
            wal_tx,
            notify,
            participant_policy,
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::UserRegistered { id, student_id, name } => {
                    engine.student_index.insert(student_id.clone(), *id);
                    engine.users.insert(
                        *id,
                        User {
                            id: *id,
                            student_id: student_id.clone(),
                            name: name.clone(),
                        },
                    );
                }
                Event::RoomCreated {
                    id,
                    name,
                    location,
                    capacity,
                    features,
                } => {
                    let room =
                        RoomState::new(*id, name.clone(), location.clone(), *capacity, *features);
                    engine.rooms.insert(*id, Arc::new(RwLock::new(room)));
                }
                Event::RoomDeleted { id } => {
                    if let Some((_, room)) = engine.rooms.remove(id) {
                        let guard = room.try_read().expect("replay: uncontended read");
                        for entry in &guard.waitlist {
                            engine.waitlist_rooms.remove(&entry.id);
                        }
                        for r in &guard.reservations {
                            engine.reservation_rooms.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.rooms.get(&room_id)
                    {
                        let room_arc = entry.clone();
                        drop(entry);
                        let mut guard =
                            room_arc.try_write().expect("replay: uncontended write");
                        engine.replay_indexed(&mut guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Apply a room-scoped event during replay, keeping the reverse indices
    /// and quota ledgers consistent. Ledger locks are uncontended here.
    fn replay_indexed(&self, room: &mut RoomState, event: &Event) {
        match event {
            Event::ReservationCreated {
                id,
                room_id,
                user_id,
                span,
                participants,
                ..
            } => {
                self.reservation_rooms.insert(*id, *room_id);
                let mut holders = participants.clone();
                holders.push(*user_id);
                for uid in holders {
                    let ledger = self.ledger_handle(uid);
                    ledger
                        .try_write()
                        .expect("replay: uncontended write")
                        .insert(*id, span.end);
                }
            }
            Event::ReservationCancelled { id, .. } | Event::ReservationDone { id, .. } => {
                self.reservation_rooms.remove(id);
                if let Some(r) = room.reservations.iter().find(|r| r.id == *id) {
                    let mut holders = r.participants.clone();
                    holders.push(r.user_id);
                    for uid in holders {
                        let ledger = self.ledger_handle(uid);
                        ledger
                            .try_write()
                            .expect("replay: uncontended write")
                            .remove(id);
                    }
                }
            }
            Event::WaitlistJoined { id, room_id, .. } => {
                self.waitlist_rooms.insert(*id, *room_id);
            }
            _ => {}
        }
        apply_to_room(room, event);
    }

    /// Write one event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(std::slice::from_ref(event)).await
    }

    /// Write a group of events as one commit unit: they reach the WAL in a
    /// single flush, and the ack covers all of them.
    pub(super) async fn wal_append_all(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_of_reservation(&self, id: &Ulid) -> Option<RoomId> {
        self.reservation_rooms.get(id).map(|e| *e.value())
    }

    pub fn room_of_entry(&self, id: &Ulid) -> Option<RoomId> {
        self.waitlist_rooms.get(id).map(|e| *e.value())
    }

    pub(super) fn ledger_handle(&self, user_id: UserId) -> SharedLedger {
        self.ledgers.entry(user_id).or_default().clone()
    }

    /// Acquire the quota ledgers for a set of users, write-locked.
    /// `user_ids` must be sorted and deduplicated: a single global lock order
    /// (room first, then ledgers ascending) keeps concurrent admissions
    /// deadlock-free.
    pub(super) async fn lock_ledgers(
        &self,
        user_ids: &[UserId],
    ) -> Vec<OwnedRwLockWriteGuard<UserLedger>> {
        debug_assert!(user_ids.windows(2).all(|w| w[0] < w[1]));
        let mut guards = Vec::with_capacity(user_ids.len());
        for uid in user_ids {
            guards.push(self.ledger_handle(*uid).write_owned().await);
        }
        guards
    }

    /// WAL-append + apply + index maintenance in one call. Quota ledgers are
    /// the caller's responsibility (it holds their locks).
    pub(super) async fn persist_and_apply(
        &self,
        room: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.persist_and_apply_all(room, std::slice::from_ref(event))
            .await
    }

    /// Like `persist_and_apply` for a group of events that must commit
    /// together. Nothing is applied unless the whole group reached the WAL.
    pub(super) async fn persist_and_apply_all(
        &self,
        room: &mut RoomState,
        events: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append_all(events).await?;
        for event in events {
            match event {
                Event::ReservationCreated { id, room_id, .. } => {
                    self.reservation_rooms.insert(*id, *room_id);
                }
                Event::ReservationCancelled { id, .. } | Event::ReservationDone { id, .. } => {
                    self.reservation_rooms.remove(id);
                }
                Event::WaitlistJoined { id, room_id, .. } => {
                    self.waitlist_rooms.insert(*id, *room_id);
                }
                _ => {}
            }
            apply_to_room(room, event);
        }
        Ok(())
    }

    /// Denormalize a reservation with room and directory fields.
    pub(super) fn snapshot(&self, room: &RoomState, r: &Reservation) -> ReservationSnapshot {
        let (user_name, student_id) = self
            .users
            .get(&r.user_id)
            .map(|u| (u.name.clone(), u.student_id.clone()))
            .unwrap_or_default();
        let participants = r
            .participants
            .iter()
            .filter_map(|uid| self.users.get(uid).map(|u| u.student_id.clone()))
            .collect();
        ReservationSnapshot {
            id: r.id,
            room_id: room.id,
            room_name: room.name.clone(),
            location: room.location.clone(),
            user_id: r.user_id,
            user_name,
            student_id,
            span: r.span,
            participants,
            created_at: r.created_at,
        }
    }
}

/// Extract the room id from a room-scoped event.
fn event_room_id(event: &Event) -> Option<RoomId> {
    match event {
        Event::ReservationCreated { room_id, .. }
        | Event::ReservationCancelled { room_id, .. }
        | Event::ReservationDone { room_id, .. }
        | Event::WaitlistJoined { room_id, .. }
        | Event::WaitlistAssigned { room_id, .. }
        | Event::WaitlistCancelled { room_id, .. } => Some(*room_id),
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::UserRegistered { .. } | Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {
            None
        }
    }
}
