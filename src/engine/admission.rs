use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// What to do with a participant student id that resolves to nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticipantPolicy {
    /// Drop unknown ids silently; the reservation proceeds with whoever resolved.
    #[default]
    Drop,
    /// Reject the whole request on the first unknown id.
    Strict,
}

/// UTC day index of a timestamp. Two timestamps share a bucket iff they fall
/// on the same UTC calendar day.
pub(crate) fn day_bucket(t: Ms) -> i64 {
    t.div_euclid(DAY_MS)
}

pub(crate) fn is_on_hour(t: Ms) -> bool {
    t.rem_euclid(HOUR_MS) == 0
}

/// Structural checks on a requested slot, independent of clock and room.
pub(crate) fn validate_slot(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    if !is_on_hour(span.start) || !is_on_hour(span.end) {
        return Err(EngineError::NotOnTheHour);
    }
    Ok(())
}

/// Clock checks: the slot must start in the future and within the booking
/// window (start date at most `BOOKING_WINDOW_DAYS` UTC days after today).
pub(crate) fn check_window(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start <= now {
        return Err(EngineError::StartInPast);
    }
    if day_bucket(span.start) > day_bucket(now) + BOOKING_WINDOW_DAYS {
        return Err(EngineError::WindowExceeded);
    }
    Ok(())
}

/// A well-formed student id is 7 to 10 ASCII digits.
pub(crate) fn is_student_id(s: &str) -> bool {
    (7..=10).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

pub(crate) fn check_overlap(room: &RoomState, span: &Span) -> Result<(), EngineError> {
    if let Some(existing) = room.overlapping(span).next() {
        return Err(EngineError::SlotTaken(existing.id));
    }
    Ok(())
}

pub(crate) fn check_capacity(room: &RoomState, party_size: u32) -> Result<(), EngineError> {
    if party_size > room.capacity {
        return Err(EngineError::CapacityExceeded {
            requested: party_size,
            capacity: room.capacity,
        });
    }
    Ok(())
}
