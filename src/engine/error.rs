use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-fixable input problem (bad interval, zero guests, ...).
    #[error("invalid input: {0}")]
    Invalid(&'static str),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("{guests} guests exceed room capacity {capacity}")]
    CapacityExceeded { guests: u32, capacity: u32 },

    /// Genuine overlap with an existing hold. Retry with different dates,
    /// not with the same request.
    #[error("room not available: {} conflicting reservation(s)", .conflicts.len())]
    NotAvailable { conflicts: Vec<Ulid> },

    /// Room-lock wait exceeded its bound. Transient; the identical request
    /// may be retried.
    #[error("room {0} busy, try again")]
    Busy(Ulid),

    #[error("reservation not cancellable in status '{0}'")]
    NotCancellable(ReservationStatus),

    #[error("could not allocate a unique reference code")]
    CodeCollision,

    #[error("unknown reference code: {0}")]
    UnknownCode(String),

    #[error("property {0} still has rooms")]
    HasRooms(Ulid),

    #[error("room {0} still has reservations holding it")]
    HasReservations(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}
