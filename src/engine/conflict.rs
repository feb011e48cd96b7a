use chrono::Datelike;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Stay preconditions, checked before any lock is touched.
pub(crate) fn validate_stay(stay: &StaySpan) -> Result<(), EngineError> {
    if stay.check_out <= stay.check_in {
        return Err(EngineError::Invalid("check-out must be after check-in"));
    }
    if stay.check_in.year() < MIN_STAY_YEAR || stay.check_out.year() > MAX_STAY_YEAR {
        return Err(EngineError::Invalid("stay dates out of range"));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::Invalid("stay too long"));
    }
    Ok(())
}

/// Query windows allow equality-adjacent wider spans than stays.
pub(crate) fn validate_window(window: &StaySpan) -> Result<(), EngineError> {
    if window.check_out <= window.check_in {
        return Err(EngineError::Invalid("window end must be after window start"));
    }
    if window.check_in.year() < MIN_STAY_YEAR || window.check_out.year() > MAX_STAY_YEAR {
        return Err(EngineError::Invalid("window dates out of range"));
    }
    if window.nights() > MAX_QUERY_WINDOW_NIGHTS {
        return Err(EngineError::Invalid("query window too wide"));
    }
    Ok(())
}

/// Ids of room-holding reservations overlapping `stay`. Cancelled and
/// checked-out records never conflict. Caller holds the room lock, so the
/// answer cannot go stale before the caller's own commit.
pub(crate) fn holding_conflicts(room: &RoomState, stay: &StaySpan) -> Vec<Ulid> {
    room.overlapping(stay)
        .filter(|r| r.status.holds_room())
        .map(|r| r.id)
        .collect()
}
