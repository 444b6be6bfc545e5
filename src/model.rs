use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Caller-supplied opaque identifiers. Positive integers by contract.
pub type RoomId = u64;
pub type UserId = u64;

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

    /// Half-open semantics: back-to-back spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A registered member of the organization. Identity issuance is an external
/// concern; the engine only keeps the directory needed to resolve student
/// identifiers and denormalize display fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub student_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFeatures {
    pub projector: bool,
    pub whiteboard: bool,
}

/// An admitted, currently-active reservation. Cancelled and finished
/// reservations leave the room state; the WAL keeps the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub span: Span,
    /// Resolved internal ids of additional participants (owner excluded).
    pub participants: Vec<UserId>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waiting,
    Assigned,
    Cancelled,
}

/// A queued request for an exact (room, start, end) slot. Entries are kept in
/// all states so per-key queue positions stay strictly increasing and are
/// never reused. Participants stay unresolved until promotion, mirroring
/// submission-time input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub span: Span,
    pub participants: Vec<String>,
    pub position: u32,
    pub submitted_at: Ms,
    pub status: WaitlistStatus,
    /// Set when the entry is promoted into a reservation.
    pub assigned_reservation: Option<Ulid>,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: RoomId,
    pub name: String,
    pub location: Option<String>,
    /// Max people in the room, owner included (positive).
    pub capacity: u32,
    pub features: RoomFeatures,
    /// Active reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Full waitlist history for this room, in submission order.
    pub waitlist: Vec<WaitlistEntry>,
}

impl RoomState {
    pub fn new(
        id: RoomId,
        name: String,
        location: Option<String>,
        capacity: u32,
        features: RoomFeatures,
    ) -> Self {
        Self {
            id,
            name,
            location,
            capacity,
            features,
            reservations: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    /// Insert a reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        if let Some(pos) = self.reservations.iter().position(|r| r.id == id) {
            Some(self.reservations.remove(pos))
        } else {
            None
        }
    }

    /// Active reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn find_entry(&self, id: Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == id)
    }

    pub fn find_entry_mut(&mut self, id: Ulid) -> Option<&mut WaitlistEntry> {
        self.waitlist.iter_mut().find(|e| e.id == id)
    }

    /// Next queue position for the exact (start, end) key: max over all
    /// entries for the key, regardless of status, plus one. Positions start
    /// at 1 and are never reused.
    pub fn next_queue_position(&self, span: &Span) -> u32 {
        self.waitlist
            .iter()
            .filter(|e| e.span == *span)
            .map(|e| e.position)
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: UserId,
        student_id: String,
        name: String,
    },
    RoomCreated {
        id: RoomId,
        name: String,
        location: Option<String>,
        capacity: u32,
        features: RoomFeatures,
    },
    RoomUpdated {
        id: RoomId,
        name: String,
        location: Option<String>,
        capacity: u32,
        features: RoomFeatures,
    },
    RoomDeleted {
        id: RoomId,
    },
    ReservationCreated {
        id: Ulid,
        room_id: RoomId,
        user_id: UserId,
        span: Span,
        participants: Vec<UserId>,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: RoomId,
    },
    /// End time passed; flipped by the sweep, not by a user.
    ReservationDone {
        id: Ulid,
        room_id: RoomId,
    },
    WaitlistJoined {
        id: Ulid,
        room_id: RoomId,
        user_id: UserId,
        span: Span,
        participants: Vec<String>,
        position: u32,
        submitted_at: Ms,
    },
    WaitlistAssigned {
        id: Ulid,
        room_id: RoomId,
        reservation_id: Ulid,
    },
    WaitlistCancelled {
        id: Ulid,
        room_id: RoomId,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub location: Option<String>,
    pub capacity: u32,
    pub features: RoomFeatures,
}

/// Denormalized reservation record: what the broadcast sink and the wire
/// surface see, joined with room and owner display fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSnapshot {
    pub id: Ulid,
    pub room_id: RoomId,
    pub room_name: String,
    pub location: Option<String>,
    pub user_id: UserId,
    pub user_name: String,
    pub student_id: String,
    pub span: Span,
    /// Student identifiers of the resolved participants.
    pub participants: Vec<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistInfo {
    pub id: Ulid,
    pub room_id: RoomId,
    pub room_name: String,
    pub user_id: UserId,
    pub span: Span,
    pub position: u32,
    pub submitted_at: Ms,
}
