use ulid::Ulid;

use crate::model::{RoomId, UserId};

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval { start: i64, end: i64 },
    NotOnTheHour,
    StartInPast,
    WindowExceeded,
    BadParticipantId(String),
    UnknownParticipant(String),
    RoomNotFound(RoomId),
    UserNotFound(UserId),
    NotFound(Ulid),
    AlreadyExists(u64),
    SlotTaken(Ulid),
    CapacityExceeded { requested: u32, capacity: u32 },
    QuotaExceeded(UserId),
    ParticipantQuotaExceeded(String),
    DuplicateWaitlist,
    NotWaiting(Ulid),
    HasActiveReservations(RoomId),
    Forbidden,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True for failures that cannot resolve by waiting: the request holder
    /// is over their active-reservation cap.
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            EngineError::QuotaExceeded(_) | EngineError::ParticipantQuotaExceeded(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: start {start} must be before end {end}")
            }
            EngineError::NotOnTheHour => {
                write!(f, "reservation bounds must fall on the hour")
            }
            EngineError::StartInPast => write!(f, "start time is not in the future"),
            EngineError::WindowExceeded => {
                write!(f, "start date is beyond the booking window")
            }
            EngineError::BadParticipantId(s) => {
                write!(f, "malformed student id: {s:?}")
            }
            EngineError::UnknownParticipant(s) => {
                write!(f, "no registered user with student id {s}")
            }
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotTaken(id) => {
                write!(f, "slot overlaps existing reservation: {id}")
            }
            EngineError::CapacityExceeded { requested, capacity } => {
                write!(f, "party of {requested} exceeds room capacity {capacity}")
            }
            EngineError::QuotaExceeded(uid) => {
                write!(f, "user {uid} is at the active reservation limit")
            }
            EngineError::ParticipantQuotaExceeded(sid) => {
                write!(f, "participant {sid} is at the active reservation limit")
            }
            EngineError::DuplicateWaitlist => {
                write!(f, "already waiting for this slot")
            }
            EngineError::NotWaiting(id) => {
                write!(f, "waitlist entry {id} is not in the waiting state")
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete room {id}: has active reservations")
            }
            EngineError::Forbidden => write!(f, "not the owner"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
