//! Hard caps. Every limit is enforced at the mutation boundary so a single
//! misbehaving client cannot grow unbounded state or stall the engine.

use std::time::Duration;

/// Max properties per tenant.
pub const MAX_PROPERTIES: usize = 1_000;

/// Max rooms per tenant.
pub const MAX_ROOMS: usize = 50_000;

/// Max reservation records kept per room (including cancelled history).
pub const MAX_RESERVATIONS_PER_ROOM: usize = 10_000;

/// Longest bookable stay.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Widest availability / free-night query window.
pub const MAX_QUERY_WINDOW_NIGHTS: i64 = 1_100;

/// Stay dates must fall within [MIN_STAY_YEAR, MAX_STAY_YEAR].
pub const MIN_STAY_YEAR: i32 = 2000;
pub const MAX_STAY_YEAR: i32 = 2200;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;

/// Bound on the exclusive room-lock wait. Exceeding it surfaces `Busy`
/// rather than queueing the caller indefinitely.
pub const LOCK_WAIT: Duration = Duration::from_secs(3);

/// A pending reservation not confirmed within this window is expired by
/// the reaper.
pub const DEFAULT_PENDING_TTL_MS: i64 = 30 * 60 * 1000;

/// Reference-code generation retries before giving up with DuplicateCode.
pub const CODE_ATTEMPTS: usize = 8;

/// Reference-code length (Crockford base32 chars).
pub const CODE_LEN: usize = 8;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Longest wire-level notice long-poll.
pub const MAX_POLL_WAIT_MS: i64 = 30_000;
