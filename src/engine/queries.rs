use ulid::Ulid;

use crate::model::*;

use super::availability::{free_spans, merge_overlapping, sold_out_spans};
use super::conflict::validate_window;
use super::{Engine, EngineError};

impl Engine {
    pub fn list_properties(&self) -> Vec<PropertyInfo> {
        self.properties
            .iter()
            .map(|entry| PropertyInfo {
                id: *entry.key(),
                name: entry.value().clone(),
            })
            .collect()
    }

    pub async fn list_rooms(&self, property_id: Option<Ulid>) -> Vec<RoomInfo> {
        let ids: Vec<Ulid> = match property_id {
            Some(pid) => self
                .property_rooms
                .get(&pid)
                .map(|e| e.value().clone())
                .unwrap_or_default(),
            None => self.rooms.iter().map(|e| *e.key()).collect(),
        };

        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.get_room(&id) {
                let guard = room.read().await;
                rooms.push(RoomInfo {
                    id: guard.id,
                    property_id: guard.property_id,
                    name: guard.name.clone(),
                    capacity: guard.capacity,
                    nightly_rate: guard.nightly_rate,
                });
            }
        }
        rooms
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        let room_id = self
            .room_for_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = room.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(*id))
    }

    pub async fn get_reservation_by_code(&self, code: &str) -> Result<Reservation, EngineError> {
        let id = self
            .codes
            .get(code)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::UnknownCode(code.to_string()))?;
        self.get_reservation(&id).await
    }

    /// All reservations owned by one guest, across every room.
    pub async fn reservations_for_guest(&self, guest_id: Ulid) -> Vec<Reservation> {
        let room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for id in room_ids {
            if let Some(room) = self.get_room(&id) {
                let guard = room.read().await;
                out.extend(
                    guard
                        .reservations
                        .iter()
                        .filter(|r| r.guest_id == guest_id)
                        .cloned(),
                );
            }
        }
        out.sort_by_key(|r| r.stay.check_in);
        out
    }

    pub async fn reservations_for_room(
        &self,
        room_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = room.read().await;
        Ok(guard.reservations.clone())
    }

    /// Reservations on a room whose stay intersects the window, any status.
    pub async fn reservations_in_range(
        &self,
        room_id: Ulid,
        window: StaySpan,
    ) -> Result<Vec<Reservation>, EngineError> {
        validate_window(&window)?;
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = room.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    /// Fresh availability count across a property for one window: how many
    /// rooms have no holding reservation overlapping it, and which.
    pub async fn property_availability(
        &self,
        property_id: Ulid,
        window: &StaySpan,
    ) -> Result<AvailabilityReport, EngineError> {
        validate_window(window)?;
        if !self.properties.contains_key(&property_id) {
            return Err(EngineError::NotFound(property_id));
        }
        let room_ids: Vec<Ulid> = self
            .property_rooms
            .get(&property_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut available_rooms = Vec::new();
        for id in &room_ids {
            if let Some(room) = self.get_room(id) {
                let guard = room.read().await;
                if !guard.is_taken(window) {
                    available_rooms.push(*id);
                }
            }
        }

        Ok(AvailabilityReport {
            property_id,
            window: *window,
            available: available_rooms.len() as u32,
            total: room_ids.len() as u32,
            available_rooms,
        })
    }

    /// Availability report for the property a room belongs to.
    pub async fn availability_for_room(
        &self,
        room_id: Ulid,
        window: StaySpan,
    ) -> Result<AvailabilityReport, EngineError> {
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let property_id = room.read().await.property_id;
        self.property_availability(property_id, &window).await
    }

    /// Free sub-spans of the window for one room.
    pub async fn free_nights(
        &self,
        room_id: Ulid,
        window: StaySpan,
    ) -> Result<Vec<StaySpan>, EngineError> {
        validate_window(&window)?;
        let room = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = room.read().await;
        Ok(free_spans(&guard, &window))
    }

    /// Date ranges inside the window where every room of the property is
    /// taken.
    pub async fn property_sold_out(
        &self,
        property_id: Ulid,
        window: StaySpan,
    ) -> Result<Vec<StaySpan>, EngineError> {
        validate_window(&window)?;
        if !self.properties.contains_key(&property_id) {
            return Err(EngineError::NotFound(property_id));
        }
        let room_ids: Vec<Ulid> = self
            .property_rooms
            .get(&property_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut busy_per_room = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            if let Some(room) = self.get_room(id) {
                let guard = room.read().await;
                let mut busy: Vec<StaySpan> = guard
                    .overlapping(&window)
                    .filter(|r| r.status.holds_room())
                    .map(|r| r.stay.clamped_to(&window))
                    .collect();
                busy.sort_by_key(|s| s.check_in);
                busy_per_room.push(merge_overlapping(&busy));
            }
        }

        Ok(sold_out_spans(&busy_per_room, room_ids.len() as u32))
    }
}
