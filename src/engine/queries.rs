use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::availability::free_windows;
use super::{Engine, EngineError};

// Read-side operations. Each takes a read lock on at most one room, so
// queries never block transitions on other rooms.

impl Engine {
    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        let mut out: Vec<RoomInfo> = self
            .rooms
            .iter()
            .filter_map(|entry| {
                entry.value().try_read().ok().map(|rs| RoomInfo {
                    id: rs.id,
                    room: rs.room.clone(),
                    floor: rs.floor.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.room.cmp(&b.room));
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        let room_id = self
            .room_for_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    /// All reservations touching `query` in a room, regardless of status.
    /// Schedule views show Pending requests too, not just confirmed holds.
    pub async fn reservations_in_window(
        &self,
        room_id: Ulid,
        query: Span,
    ) -> Result<Vec<Reservation>, EngineError> {
        validate_query(&query)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&query).cloned().collect())
    }

    /// Free sub-windows of `query` for a room (blocking occupancy removed).
    pub async fn room_free_windows(
        &self,
        room_id: Ulid,
        query: Span,
    ) -> Result<Vec<Span>, EngineError> {
        validate_query(&query)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(free_windows(&guard, &query))
    }

    pub fn list_staff(&self, floor: Option<&str>) -> Vec<StaffMember> {
        let mut out: Vec<StaffMember> = self
            .staff
            .iter()
            .filter(|e| floor.is_none_or(|f| e.value().floor == f))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn get_report(&self, id: &Ulid) -> Result<Report, EngineError> {
        self.reports
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn list_reports(&self, floor: Option<&str>) -> Vec<Report> {
        let mut out: Vec<Report> = self
            .reports
            .iter()
            .filter(|e| floor.is_none_or(|f| e.value().floor == f))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }
}

// Queries tolerate wider windows than bookings (a whole year of schedule),
// so this deliberately skips the booking-duration cap.
fn validate_query(query: &Span) -> Result<(), EngineError> {
    if query.start >= query.end {
        return Err(EngineError::Validation("interval must end after it starts"));
    }
    if query.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}
