use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{AvailabilityChange, Notice, Topic};

use super::conflict::{holding_conflicts, now_ms, validate_stay, validate_window};
use super::{Engine, EngineError, WalCommand};

/// Creation request. `guest_id` is the explicit owner — identity resolution
/// happens at the boundary that terminates the request, never inside the
/// engine.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub guest_id: Ulid,
    pub room_id: Ulid,
    pub stay: StaySpan,
    pub guests: u32,
    pub notes: Option<String>,
}

impl Engine {
    pub async fn register_property(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("property name too long"));
        }
        if self.properties.len() >= MAX_PROPERTIES {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        if self.properties.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::PropertyRegistered {
            id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.properties.insert(id, name);
        self.property_rooms.entry(id).or_default();
        Ok(())
    }

    pub async fn remove_property(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.properties.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(rooms) = self.property_rooms.get(&id)
            && !rooms.is_empty() {
                return Err(EngineError::HasRooms(id));
            }

        let event = Event::PropertyRemoved { id };
        self.wal_append(&event).await?;
        self.properties.remove(&id);
        self.property_rooms.remove(&id);
        self.notify.remove(&Topic::Property(id));
        Ok(())
    }

    pub async fn register_room(
        &self,
        id: Ulid,
        property_id: Ulid,
        name: Option<String>,
        capacity: u32,
        nightly_rate: Cents,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("room name too long"));
            }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if capacity == 0 {
            return Err(EngineError::Invalid("room capacity must be at least 1"));
        }
        if nightly_rate < 0 {
            return Err(EngineError::Invalid("nightly rate must not be negative"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.properties.contains_key(&property_id) {
            return Err(EngineError::NotFound(property_id));
        }

        let event = Event::RoomRegistered {
            id,
            property_id,
            name: name.clone(),
            capacity,
            nightly_rate,
        };
        self.wal_append(&event).await?;
        let room = RoomState::new(id, property_id, name, capacity, nightly_rate);
        self.rooms.insert(id, Arc::new(RwLock::new(room)));
        self.property_rooms.entry(property_id).or_default().push(id);
        Ok(())
    }

    /// Rate changes apply to future reservations only; committed records
    /// keep the snapshot they were created with.
    pub async fn update_room(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        nightly_rate: Cents,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("room name too long"));
            }
        if capacity == 0 {
            return Err(EngineError::Invalid("room capacity must be at least 1"));
        }
        if nightly_rate < 0 {
            return Err(EngineError::Invalid("nightly rate must not be negative"));
        }
        let mut guard = self.lock_room(id).await?;

        let event = Event::RoomUpdated {
            id,
            name,
            capacity,
            nightly_rate,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn retire_room(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_room(id).await?;
        if guard.reservations.iter().any(|r| r.status.holds_room()) {
            return Err(EngineError::HasReservations(id));
        }

        let event = Event::RoomRetired { id };
        self.wal_append(&event).await?;
        if let Some(mut siblings) = self.property_rooms.get_mut(&guard.property_id) {
            siblings.retain(|r| r != &id);
        }
        for r in &guard.reservations {
            self.reservation_rooms.remove(&r.id);
            self.codes.remove(&r.code);
        }
        drop(guard);
        self.rooms.remove(&id);
        self.notify.remove(&Topic::Room(id));
        Ok(())
    }

    /// The booking-creation protocol:
    ///
    /// 1. Validate the request — before any lock, so bad input fails cheap.
    /// 2. Acquire the room's exclusive lock (bounded wait → `Busy`).
    /// 3. Scan for holding overlaps; any hit aborts with `NotAvailable` and
    ///    no state change.
    /// 4. Construct the record (pending, fresh reference code, rate snapshot,
    ///    computed total) and commit it through the WAL.
    /// 5. After the lock drops, fan out availability/created notices and
    ///    fire best-effort collaborators. None of these can fail the call.
    pub async fn create_reservation(
        &self,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        validate_stay(&req.stay)?;
        if req.guests == 0 {
            return Err(EngineError::Invalid("guest count must be at least 1"));
        }
        if let Some(ref notes) = req.notes
            && notes.len() > MAX_NOTES_LEN {
                return Err(EngineError::LimitExceeded("notes too long"));
            }
        let room = self
            .get_room(&req.room_id)
            .ok_or(EngineError::NotFound(req.room_id))?;

        // Capacity fail-fast without touching the exclusive lock. If the
        // room is contended the check simply moves below the acquisition,
        // still ahead of any write.
        if let Ok(snapshot) = room.try_read()
            && req.guests > snapshot.capacity {
                return Err(EngineError::CapacityExceeded {
                    guests: req.guests,
                    capacity: snapshot.capacity,
                });
            }

        let mut guard = self.lock_room_state(&room, req.room_id).await?;

        if req.guests > guard.capacity {
            return Err(EngineError::CapacityExceeded {
                guests: req.guests,
                capacity: guard.capacity,
            });
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        let conflicts = holding_conflicts(&guard, &req.stay);
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::NotAvailable { conflicts });
        }

        let id = Ulid::new();
        let code = self.claim_code(id)?;
        let reservation = Reservation {
            id,
            code,
            guest_id: req.guest_id,
            room_id: req.room_id,
            stay: req.stay,
            guests: req.guests,
            nightly_rate: guard.nightly_rate,
            total_price: guard.nightly_rate * req.stay.nights(),
            status: ReservationStatus::Pending,
            notes: req.notes,
            cancel_reason: None,
            cancelled_at: None,
            created_at: now_ms(),
        };
        let event = Event::ReservationCreated {
            id,
            code: reservation.code.clone(),
            guest_id: reservation.guest_id,
            room_id: reservation.room_id,
            stay: reservation.stay,
            guests: reservation.guests,
            nightly_rate: reservation.nightly_rate,
            total_price: reservation.total_price,
            notes: reservation.notes.clone(),
            created_at: reservation.created_at,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            // Nothing committed; release the claimed code.
            self.codes.remove(&reservation.code);
            return Err(e);
        }
        let property_id = guard.property_id;
        drop(guard);

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        self.publish_availability(
            AvailabilityChange::Booked,
            reservation.room_id,
            property_id,
            reservation.stay,
        )
        .await;
        self.notify.publish(
            Topic::Guest(reservation.guest_id),
            &Notice::ReservationCreated {
                id: reservation.id,
                code: reservation.code.clone(),
                room_id: reservation.room_id,
                guest_id: reservation.guest_id,
                stay: reservation.stay,
                status: reservation.status,
            },
        );
        self.collab.dispatch_created(&reservation);
        Ok(reservation)
    }

    /// Owner-facing cancellation. Ownership is enforced at lookup: another
    /// guest's reservation is indistinguishable from a missing one.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        guest_id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("cancellation reason too long"));
            }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if current.guest_id != guest_id {
            return Err(EngineError::NotFound(id));
        }
        if !current.status.is_cancellable() {
            return Err(EngineError::NotCancellable(current.status));
        }

        let cancelled_at = now_ms();
        let event = Event::ReservationCancelled {
            id,
            room_id,
            reason: reason.clone(),
            cancelled_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let mut updated = current;
        updated.status = ReservationStatus::Cancelled;
        updated.cancel_reason = reason.clone();
        updated.cancelled_at = Some(cancelled_at);
        let property_id = guard.property_id;
        drop(guard);

        self.publish_availability(AvailabilityChange::Freed, room_id, property_id, updated.stay)
            .await;
        self.notify.publish(
            Topic::Guest(guest_id),
            &Notice::ReservationCancelled {
                id,
                room_id,
                guest_id,
                reason,
            },
        );
        self.collab.dispatch_cancelled(&updated);
        Ok(updated)
    }

    /// Administrative transition. Looks up by id only and applies any target
    /// status — deliberately no transition table beyond the owner-facing
    /// cancel rules. Landing on checked-out from another status fires the
    /// loyalty collaborator, best-effort.
    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        target: ReservationStatus,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("reason too long"));
            }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let previous = current.status;

        let at = now_ms();
        let event = Event::ReservationStatusSet {
            id,
            room_id,
            from: previous,
            to: target,
            reason: reason.clone(),
            at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let mut updated = current;
        updated.status = target;
        if target == ReservationStatus::Cancelled {
            updated.cancel_reason = reason;
            updated.cancelled_at = Some(at);
        }
        let property_id = guard.property_id;
        drop(guard);

        if previous.holds_room() != target.holds_room() {
            let change = if target.holds_room() {
                AvailabilityChange::Booked
            } else {
                AvailabilityChange::Freed
            };
            self.publish_availability(change, room_id, property_id, updated.stay)
                .await;
        }
        self.notify.publish(
            Topic::Guest(updated.guest_id),
            &Notice::ReservationStatusChanged {
                id,
                room_id,
                guest_id: updated.guest_id,
                from: previous,
                to: target,
            },
        );
        if target == ReservationStatus::CheckedOut && previous != ReservationStatus::CheckedOut {
            self.collab.dispatch_stay_completed(&updated);
        }
        Ok(updated)
    }

    /// Recompute and republish availability without any preceding write.
    /// Used when a viewer changes search dates.
    pub async fn refresh_availability(
        &self,
        room_id: Ulid,
        window: StaySpan,
    ) -> Result<(), EngineError> {
        validate_window(&window)?;
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let property_id = room.read().await.property_id;
        self.publish_availability(AvailabilityChange::Refreshed, room_id, property_id, window)
            .await;
        Ok(())
    }

    /// Pending reservations older than the TTL. `try_read` skips rooms that
    /// are mid-write; the reaper catches them next tick.
    pub fn collect_expired_pending(&self, now: Ms, ttl_ms: i64) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().clone();
            if let Ok(guard) = room.try_read() {
                for r in &guard.reservations {
                    if r.status == ReservationStatus::Pending && r.created_at + ttl_ms <= now {
                        expired.push(r.id);
                    }
                }
            }
        }
        expired
    }

    /// Cancel a pending reservation that outlived its confirmation window.
    /// Fails (harmlessly, for the reaper) if it was confirmed or cancelled
    /// in the meantime.
    pub async fn expire_pending(&self, id: Ulid) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::Pending {
            return Err(EngineError::NotCancellable(current.status));
        }

        let reason = Some("not confirmed in time".to_string());
        let cancelled_at = now_ms();
        let event = Event::ReservationCancelled {
            id,
            room_id,
            reason: reason.clone(),
            cancelled_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let property_id = guard.property_id;
        drop(guard);

        self.publish_availability(AvailabilityChange::Freed, room_id, property_id, current.stay)
            .await;
        self.notify.publish(
            Topic::Guest(current.guest_id),
            &Notice::ReservationCancelled {
                id,
                room_id,
                guest_id: current.guest_id,
                reason,
            },
        );
        Ok(())
    }

    /// Rewrite the WAL with the minimal event set recreating current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for entry in self.properties.iter() {
            events.push(Event::PropertyRegistered {
                id: *entry.key(),
                name: entry.value().clone(),
            });
        }

        let room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        for id in room_ids {
            let Some(room) = self.get_room(&id) else {
                continue;
            };
            let guard = room.read().await;
            events.push(Event::RoomRegistered {
                id: guard.id,
                property_id: guard.property_id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                nightly_rate: guard.nightly_rate,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    code: r.code.clone(),
                    guest_id: r.guest_id,
                    room_id: r.room_id,
                    stay: r.stay,
                    guests: r.guests,
                    nightly_rate: r.nightly_rate,
                    total_price: r.total_price,
                    notes: r.notes.clone(),
                    created_at: r.created_at,
                });
                match r.status {
                    ReservationStatus::Pending => {}
                    ReservationStatus::Cancelled => events.push(Event::ReservationCancelled {
                        id: r.id,
                        room_id: r.room_id,
                        reason: r.cancel_reason.clone(),
                        cancelled_at: r.cancelled_at.unwrap_or(r.created_at),
                    }),
                    status => events.push(Event::ReservationStatusSet {
                        id: r.id,
                        room_id: r.room_id,
                        from: ReservationStatus::Pending,
                        to: status,
                        reason: None,
                        at: r.created_at,
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Claim a fresh reference code in the uniqueness index, retrying on the
    /// (practically impossible) collision.
    fn claim_code(&self, reservation_id: Ulid) -> Result<String, EngineError> {
        use dashmap::mapref::entry::Entry;
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_code();
            match self.codes.entry(code.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(reservation_id);
                    return Ok(code);
                }
            }
        }
        Err(EngineError::CodeCollision)
    }
}

/// Short human-facing code: the random tail of a fresh ULID (Crockford
/// base32, no ambiguous characters).
fn generate_code() -> String {
    let ulid = Ulid::new().to_string();
    ulid[ulid.len() - CODE_LEN..].to_string()
}
