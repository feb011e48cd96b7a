use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{ReservationStatus, StaySpan};

const CHANNEL_CAPACITY: usize = 256;

/// A fan-out destination. Room and property topics are broadcast to anyone
/// watching that room or its parent property; guest topics are the owner's
/// private channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Room(Ulid),
    Property(Ulid),
    Guest(Ulid),
}

impl Topic {
    /// Wire channel name, `LISTEN`-compatible.
    pub fn channel(&self) -> String {
        match self {
            Topic::Room(id) => format!("room_{id}"),
            Topic::Property(id) => format!("property_{id}"),
            Topic::Guest(id) => format!("guest_{id}"),
        }
    }

    pub fn parse_channel(channel: &str) -> Option<Topic> {
        let (prefix, id) = channel.split_once('_')?;
        let id = Ulid::from_string(id).ok()?;
        match prefix {
            "room" => Some(Topic::Room(id)),
            "property" => Some(Topic::Property(id)),
            "guest" => Some(Topic::Guest(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityChange {
    Booked,
    Freed,
    Refreshed,
}

/// Fan-out payload. Serialized to JSON at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notice {
    /// Availability for `stay` changed (or was explicitly refreshed).
    /// Counts are recomputed from current holds at publish time, never
    /// cached from the triggering operation.
    AvailabilityChanged {
        change: AvailabilityChange,
        room_id: Ulid,
        property_id: Ulid,
        stay: StaySpan,
        available: u32,
        total: u32,
    },
    ReservationCreated {
        id: Ulid,
        code: String,
        room_id: Ulid,
        guest_id: Ulid,
        stay: StaySpan,
        status: ReservationStatus,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        guest_id: Ulid,
        reason: Option<String>,
    },
    ReservationStatusChanged {
        id: Ulid,
        room_id: Ulid,
        guest_id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
}

/// Broadcast hub. Delivery is best-effort and at-most-once: publishing never
/// blocks, never fails the caller, and lagged receivers lose messages.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic, creating the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to a topic. No-op if nobody is listening.
    pub fn publish(&self, topic: Topic, notice: &Notice) {
        if let Some(sender) = self.channels.get(&topic) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop a topic's channel (e.g. when a room is retired).
    pub fn remove(&self, topic: &Topic) {
        self.channels.remove(topic);
    }
}
