use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only timestamp type.
pub type Ms = i64;

/// Money in minor units (cents). Rates and totals are never floats.
pub type Cents = i64;

/// Half-open date interval `[check_in, check_out)`. A check-out on the same
/// day as another stay's check-in does not overlap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaySpan {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StaySpan {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "check_in must precede check_out");
        Self { check_in, check_out }
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &StaySpan) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.check_in <= day && day < self.check_out
    }

    /// Clamp to a query window. Caller guarantees the spans overlap.
    pub fn clamped_to(&self, window: &StaySpan) -> StaySpan {
        StaySpan {
            check_in: self.check_in.max(window.check_in),
            check_out: self.check_out.min(window.check_out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ReservationStatus {
    /// Whether this status occupies the room for its interval.
    pub fn holds_room(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::CheckedIn)
    }

    /// Owner-facing cancellation is allowed only before the stay begins.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::CheckedIn => "checked_in",
            Self::CheckedOut => "checked_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "checked_in" => Some(Self::CheckedIn),
            "checked_out" => Some(Self::CheckedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted reservation record. Rate and total are snapshots taken at
/// creation; later room-rate changes never rewrite them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// Short human-facing reference code, unique per tenant.
    pub code: String,
    pub guest_id: Ulid,
    pub room_id: Ulid,
    pub stay: StaySpan,
    pub guests: u32,
    pub nightly_rate: Cents,
    pub total_price: Cents,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<Ms>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn nights(&self) -> i64 {
        self.stay.nights()
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub property_id: Ulid,
    pub name: Option<String>,
    /// Max guests per stay (not concurrent bookings — one booking holds the
    /// whole room).
    pub capacity: u32,
    /// Current rate; reservations carry their own snapshot.
    pub nightly_rate: Cents,
    /// All reservation records (including cancelled history), sorted by
    /// `stay.check_in`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(
        id: Ulid,
        property_id: Ulid,
        name: Option<String>,
        capacity: u32,
        nightly_rate: Cents,
    ) -> Self {
        Self {
            id,
            property_id,
            name,
            capacity,
            nightly_rate,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping the list sorted by check-in date.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.stay.check_in, |r| r.stay.check_in)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose stay overlaps the query window, any status.
    /// Binary search skips everything checking in at or after the window end.
    pub fn overlapping(&self, window: &StaySpan) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.check_in < window.check_out);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.check_out > window.check_in)
    }

    /// True if any room-holding reservation overlaps the window.
    pub fn is_taken(&self, window: &StaySpan) -> bool {
        self.overlapping(window).any(|r| r.status.holds_room())
    }
}

/// WAL record format — flat variants, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyRegistered {
        id: Ulid,
        name: String,
    },
    PropertyRemoved {
        id: Ulid,
    },
    RoomRegistered {
        id: Ulid,
        property_id: Ulid,
        name: Option<String>,
        capacity: u32,
        nightly_rate: Cents,
    },
    RoomUpdated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        nightly_rate: Cents,
    },
    RoomRetired {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        code: String,
        guest_id: Ulid,
        room_id: Ulid,
        stay: StaySpan,
        guests: u32,
        nightly_rate: Cents,
        total_price: Cents,
        notes: Option<String>,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        reason: Option<String>,
        cancelled_at: Ms,
    },
    ReservationStatusSet {
        id: Ulid,
        room_id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
        reason: Option<String>,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub nightly_rate: Cents,
}

/// Fresh availability count for one property and one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub property_id: Ulid,
    pub window: StaySpan,
    pub available: u32,
    pub total: u32,
    pub available_rooms: Vec<Ulid>,
}
