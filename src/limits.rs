//! Hard limits and booking policy constants. Everything that bounds
//! unbounded growth or encodes a product rule lives here.

use crate::model::Ms;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Per-user cap on simultaneous active, not-yet-ended reservations,
/// counting ownership and participation jointly.
pub const MAX_ACTIVE_RESERVATIONS: usize = 3;

/// Reservations may start no later than today + this many days (UTC days).
pub const BOOKING_WINDOW_DAYS: i64 = 6;

/// Additional participants per reservation, owner excluded.
pub const MAX_PARTICIPANTS: usize = 10;

pub const MAX_NAME_LEN: usize = 255;

pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;
pub const MAX_WAITLIST_PER_ROOM: usize = 100_000;

/// Reject timestamps outside [2000-01-01, 3000-01-01) to catch unit mixups
/// (seconds vs milliseconds) at the boundary.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 32_503_680_000_000;

/// A single reservation may not span more than one day.
pub const MAX_SPAN_DURATION_MS: Ms = DAY_MS;

/// Free-slot queries are bounded to a month-sized window.
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * DAY_MS;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
