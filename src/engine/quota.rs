use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::MAX_ACTIVE_RESERVATIONS;
use crate::model::Ms;

/// Per-user index of the reservations that count against the quota: every
/// reservation the user owns or participates in, keyed by reservation id,
/// valued by its end time. A reservation is active while `end > now`, so
/// entries are only advisory until checked against the clock.
#[derive(Debug, Default)]
pub struct UserLedger {
    entries: HashMap<Ulid, Ms>,
}

impl UserLedger {
    pub fn insert(&mut self, reservation_id: Ulid, end: Ms) {
        self.entries.insert(reservation_id, end);
    }

    pub fn remove(&mut self, reservation_id: &Ulid) {
        self.entries.remove(reservation_id);
    }

    /// Number of reservations still active at `now`.
    pub fn active_count(&self, now: Ms) -> usize {
        self.entries.values().filter(|&&end| end > now).count()
    }

    pub fn at_quota(&self, now: Ms) -> bool {
        self.active_count(now) >= MAX_ACTIVE_RESERVATIONS
    }
}
