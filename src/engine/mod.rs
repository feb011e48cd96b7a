mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_spans, merge_overlapping, sold_out_spans, subtract_spans};
pub use error::EngineError;
pub use mutations::NewReservation;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::collab::Collaborators;
use crate::limits::LOCK_WAIT;
use crate::model::*;
use crate::notify::{AvailabilityChange, Notice, NotifyHub, Topic};
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then run the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    /// Property id → display name.
    pub(super) properties: DashMap<Ulid, String>,
    /// Property → rooms index for O(1) availability scans.
    pub(super) property_rooms: DashMap<Ulid, Vec<Ulid>>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_rooms: DashMap<Ulid, Ulid>,
    /// Reference code → reservation id. Uniqueness is enforced here at
    /// commit time; generation only makes collisions improbable.
    pub(super) codes: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) collab: Arc<Collaborators>,
}

/// Apply a reservation/room event to a RoomState. No locking — the caller
/// holds the room's write lock (or is the sole owner during replay).
fn apply_to_room(
    room: &mut RoomState,
    event: &Event,
    reservation_rooms: &DashMap<Ulid, Ulid>,
    codes: &DashMap<String, Ulid>,
) {
    match event {
        Event::ReservationCreated {
            id,
            code,
            guest_id,
            room_id,
            stay,
            guests,
            nightly_rate,
            total_price,
            notes,
            created_at,
        } => {
            room.insert_reservation(Reservation {
                id: *id,
                code: code.clone(),
                guest_id: *guest_id,
                room_id: *room_id,
                stay: *stay,
                guests: *guests,
                nightly_rate: *nightly_rate,
                total_price: *total_price,
                status: ReservationStatus::Pending,
                notes: notes.clone(),
                cancel_reason: None,
                cancelled_at: None,
                created_at: *created_at,
            });
            reservation_rooms.insert(*id, *room_id);
            codes.insert(code.clone(), *id);
        }
        Event::ReservationCancelled {
            id,
            reason,
            cancelled_at,
            ..
        } => {
            if let Some(r) = room.reservation_mut(id) {
                r.status = ReservationStatus::Cancelled;
                r.cancel_reason = reason.clone();
                r.cancelled_at = Some(*cancelled_at);
            }
        }
        Event::ReservationStatusSet {
            id, to, reason, at, ..
        } => {
            if let Some(r) = room.reservation_mut(id) {
                r.status = *to;
                if *to == ReservationStatus::Cancelled {
                    r.cancel_reason = reason.clone();
                    r.cancelled_at = Some(*at);
                }
            }
        }
        Event::RoomUpdated {
            name,
            capacity,
            nightly_rate,
            ..
        } => {
            room.name = name.clone();
            room.capacity = *capacity;
            room.nightly_rate = *nightly_rate;
        }
        // Property and room registration/retirement act on the maps, not on
        // a single RoomState.
        Event::PropertyRegistered { .. }
        | Event::PropertyRemoved { .. }
        | Event::RoomRegistered { .. }
        | Event::RoomRetired { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        collab: Arc<Collaborators>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            properties: DashMap::new(),
            property_rooms: DashMap::new(),
            reservation_rooms: DashMap::new(),
            codes: DashMap::new(),
            wal_tx,
            notify,
            collab,
        };

        // Replay — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly. Never use blocking_read/blocking_write
        // here because this may run inside an async context (lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::PropertyRegistered { id, name } => {
                    engine.properties.insert(*id, name.clone());
                    engine.property_rooms.entry(*id).or_default();
                }
                Event::PropertyRemoved { id } => {
                    engine.properties.remove(id);
                    engine.property_rooms.remove(id);
                }
                Event::RoomRegistered {
                    id,
                    property_id,
                    name,
                    capacity,
                    nightly_rate,
                } => {
                    let room =
                        RoomState::new(*id, *property_id, name.clone(), *capacity, *nightly_rate);
                    engine.rooms.insert(*id, Arc::new(RwLock::new(room)));
                    engine.property_rooms.entry(*property_id).or_default().push(*id);
                }
                Event::RoomRetired { id } => {
                    if let Some(entry) = engine.rooms.get(id) {
                        let guard = entry.try_read().expect("replay: uncontended read");
                        if let Some(mut siblings) = engine.property_rooms.get_mut(&guard.property_id)
                        {
                            siblings.retain(|r| r != id);
                        }
                        for r in &guard.reservations {
                            engine.reservation_rooms.remove(&r.id);
                            engine.codes.remove(&r.code);
                        }
                    }
                    engine.rooms.remove(id);
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.rooms.get(&room_id) {
                            let rs = entry.value().clone();
                            let mut guard = rs.try_write().expect("replay: uncontended write");
                            apply_to_room(
                                &mut guard,
                                other,
                                &engine.reservation_rooms,
                                &engine.codes,
                            );
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_rooms
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append then apply. Notices are published by the caller after the
    /// write guard drops — availability recomputation takes read locks and
    /// must not run under the same room's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        room: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(room, event, &self.reservation_rooms, &self.codes);
        Ok(())
    }

    /// Exclusive room lock with a bounded wait. This is the overlap-lock
    /// primitive: every reservation write for a room serializes behind it,
    /// and a caller that cannot acquire it within the bound gets `Busy`
    /// instead of queueing forever.
    pub(super) async fn lock_room_state(
        &self,
        room: &SharedRoomState,
        room_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        match tokio::time::timeout(LOCK_WAIT, room.clone().write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                Err(EngineError::Busy(room_id))
            }
        }
    }

    pub(super) async fn lock_room(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        self.lock_room_state(&room, room_id).await
    }

    /// Reservation id → its room, write-locked.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = self.lock_room(room_id).await?;
        Ok((room_id, guard))
    }

    /// Recompute availability for the room's property and broadcast it to
    /// the room and property topics. Counts come from a fresh scan, never
    /// from the triggering operation's view. Failures are logged and
    /// swallowed — fan-out never fails the committed operation.
    pub(super) async fn publish_availability(
        &self,
        change: AvailabilityChange,
        room_id: Ulid,
        property_id: Ulid,
        stay: StaySpan,
    ) {
        let report = match self.property_availability(property_id, &stay).await {
            Ok(report) => report,
            Err(e) => {
                tracing::debug!(%room_id, "availability publish skipped: {e}");
                return;
            }
        };
        let notice = Notice::AvailabilityChanged {
            change,
            room_id,
            property_id,
            stay,
            available: report.available,
            total: report.total,
        };
        self.notify.publish(Topic::Room(room_id), &notice);
        self.notify.publish(Topic::Property(property_id), &notice);
    }
}

/// Extract the room id from a per-room event.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { room_id, .. }
        | Event::ReservationCancelled { room_id, .. }
        | Event::ReservationStatusSet { room_id, .. } => Some(*room_id),
        Event::RoomUpdated { id, .. } => Some(*id),
        Event::PropertyRegistered { .. }
        | Event::PropertyRemoved { .. }
        | Event::RoomRegistered { .. }
        | Event::RoomRetired { .. } => None,
    }
}
