use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{find_conflict, next_obstacle, validate_span};
use super::{Engine, EngineError};

// ── Reservation lifecycle ─────────────────────────────────
//
// Pending → Approved → Ongoing → Completed → Archived
//         ↘ Rejected          (terminal)
// Pending/Approved → Cancelled (terminal)
//
// Terminal statuses are sticky: every transition checks the current status
// under the room's write lock, so a record that has reached Rejected,
// Cancelled, Completed or Archived can never move again.

impl Engine {
    pub async fn register_room(
        &self,
        actor: &Actor,
        room: String,
        floor: String,
    ) -> Result<Ulid, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "register rooms",
            });
        }
        if room.is_empty() || room.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("room label length invalid"));
        }
        if floor.is_empty() || floor.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("floor label length invalid"));
        }
        if let Some(existing) = self.room_id_by_label(&room) {
            return Err(EngineError::AlreadyExists(existing));
        }
        if self.rooms.len() >= MAX_ROOMS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let id = Ulid::new();
        let event = Event::RoomRegistered {
            id,
            room: room.clone(),
            floor: floor.clone(),
        };
        self.wal_append(&event).await?;
        self.room_index.insert(room.clone(), id);
        self.rooms
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(RoomState::new(id, room, floor))));
        self.notify.send(id, &event);
        tracing::info!(room_id = %id, "room registered");
        Ok(id)
    }

    /// A room can only be retired once nothing live points at it.
    pub async fn retire_room(&self, actor: &Actor, room_id: Ulid) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "retire rooms",
            });
        }
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write().await;
        if guard.has_live_reservations() {
            return Err(EngineError::RoomInUse(room_id));
        }
        let event = Event::RoomRetired { id: room_id };
        self.wal_append(&event).await?;
        self.room_index.remove(&guard.room);
        // Drop the lookup entries for the room's (all terminal) reservations
        // with it; nothing can resolve through a retired room.
        for r in &guard.reservations {
            self.reservation_to_room.remove(&r.id);
        }
        self.rooms.remove(&room_id);
        self.notify.send(room_id, &event);
        self.notify.remove(&room_id);
        tracing::info!(room_id = %room_id, "room retired");
        Ok(())
    }

    /// File a booking request. Never checks availability — overlapping
    /// requests may coexist while Pending; the conflict check happens at
    /// approval, where it is authoritative.
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        room_id: Ulid,
        participants: Vec<Participant>,
        span: Span,
        now: Ms,
    ) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        if participants.len() > MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        for p in &participants {
            if let Participant::Guest(name) = p
                && (name.is_empty() || name.len() > MAX_NAME_LEN) {
                    return Err(EngineError::Validation("guest name length invalid"));
                }
        }

        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write_owned().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations in room"));
        }

        let id = Ulid::new();
        let event = Event::ReservationRequested {
            id,
            room_id,
            requester: actor.id,
            participants,
            span,
            at: now,
        };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        tracing::debug!(reservation_id = %id, room_id = %room_id, "reservation requested");
        Ok(id)
    }

    /// Approval is the admission point for double-booking: the conflict check
    /// and the status flip happen under one write lock, so two racing
    /// approvals over the same window can never both pass.
    pub async fn approve_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "approve reservations",
            });
        }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Approved,
            });
        }
        if let Some(c) = find_conflict(&guard, &r.span, Some(id)) {
            return Err(EngineError::Conflict {
                with: c.id,
                span: c.span,
            });
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationApproved { id, room_id, at: now })
            .await
    }

    pub async fn reject_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "reject reservations",
            });
        }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Rejected,
            });
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationRejected { id, room_id, at: now })
            .await
    }

    /// Requesters withdraw their own bookings; an admin may cancel any.
    /// Only Pending and Approved reservations can be cancelled — once the
    /// room is occupied the path out is end, not cancel.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.requester != actor.id && !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "cancel another requester's reservation",
            });
        }
        if !matches!(
            r.status,
            ReservationStatus::Pending | ReservationStatus::Approved
        ) {
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Cancelled,
            });
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationCancelled { id, room_id, at: now })
            .await
    }

    /// Check-in. Allowed from shortly before the scheduled start (front-desk
    /// tolerance) until the scheduled end.
    pub async fn start_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "start reservations",
            });
        }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Approved {
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Ongoing,
            });
        }
        if now < r.span.start - START_TOLERANCE_MS {
            return Err(EngineError::Validation("too early to start"));
        }
        if now >= r.span.end {
            return Err(EngineError::Validation("scheduled window already over"));
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationStarted { id, room_id, at: now })
            .await
    }

    /// Check-out. The requester may end their own session early; operators
    /// may end any. Ending also settles a still-pending extension request
    /// (it becomes Rejected — see the event application).
    pub async fn end_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.requester != actor.id && !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "end another requester's reservation",
            });
        }
        if r.status != ReservationStatus::Ongoing {
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Completed,
            });
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationEnded { id, room_id, at: now })
            .await
    }

    pub async fn archive_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "archive reservations",
            });
        }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Completed {
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Archived,
            });
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationArchived { id, room_id, at: now })
            .await
    }

    /// Single entry point for "change this reservation's status to X",
    /// dispatching to the operation that owns each target state.
    pub async fn set_status(
        &self,
        id: Ulid,
        actor: &Actor,
        target: ReservationStatus,
        now: Ms,
    ) -> Result<(), EngineError> {
        match target {
            ReservationStatus::Approved => self.approve_reservation(id, actor, now).await,
            ReservationStatus::Rejected => self.reject_reservation(id, actor, now).await,
            ReservationStatus::Cancelled => self.cancel_reservation(id, actor, now).await,
            ReservationStatus::Ongoing => self.start_reservation(id, actor, now).await,
            ReservationStatus::Completed => self.end_reservation(id, actor, now).await,
            ReservationStatus::Archived => self.archive_reservation(id, actor, now).await,
            ReservationStatus::Pending => {
                // Nothing transitions back to Pending.
                let (_, guard) = self.resolve_reservation_write(&id).await?;
                let from = guard.get(&id).ok_or(EngineError::NotFound(id))?.status;
                Err(EngineError::InvalidTransition {
                    from,
                    to: ReservationStatus::Pending,
                })
            }
        }
    }

    // ── Continuous extension ──────────────────────────────

    /// The requester asks to keep the room past the scheduled end. Only one
    /// negotiation can be open at a time; a rejected request may be retried.
    pub async fn request_extension(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: String,
        now: Ms,
    ) -> Result<(), EngineError> {
        if reason.len() > MAX_TEXT_LEN {
            return Err(EngineError::Validation("reason too long"));
        }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.requester != actor.id {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "extend another requester's reservation",
            });
        }
        if r.status != ReservationStatus::Ongoing {
            // Extensions only exist on an occupied room; asking from any
            // other state is a state-machine violation, not bad input.
            return Err(EngineError::InvalidTransition {
                from: r.status,
                to: ReservationStatus::Ongoing,
            });
        }
        if r.extension_status == ExtensionStatus::Pending {
            return Err(EngineError::Validation("extension already requested"));
        }
        if r.extension_status == ExtensionStatus::Approved {
            return Err(EngineError::Validation("extension already approved"));
        }
        let reason = if reason.is_empty() { None } else { Some(reason) };
        self.persist_and_apply(
            room_id,
            &mut guard,
            &Event::ExtensionRequested {
                id,
                room_id,
                reason,
                at: now,
            },
        )
        .await
    }

    /// Staff decision on a pending extension. Approval re-validates against
    /// the room's future schedule: if any blocking reservation still occupies
    /// the room past the current scheduled end, the extension is refused and
    /// the caller learns when the room is next needed. An approved extension
    /// holds the room open-endedly until the session ends.
    pub async fn decide_extension(
        &self,
        id: Ulid,
        actor: &Actor,
        approve: bool,
        now: Ms,
    ) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "decide extensions",
            });
        }
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let r = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if r.extension_status != ExtensionStatus::Pending {
            return Err(EngineError::Validation("no pending extension"));
        }
        if !approve {
            return self
                .persist_and_apply(room_id, &mut guard, &Event::ExtensionRejected { id, room_id, at: now })
                .await;
        }
        if let Some(obstacle) = next_obstacle(&guard, r.span.end, id) {
            return Err(EngineError::ExtensionConflict {
                with: obstacle.id,
                conflict_time: obstacle.span.start,
            });
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ExtensionApproved { id, room_id, at: now })
            .await
    }

    // ── Reaper entry points (no actor — system-initiated) ─

    /// Force-complete an overdue Ongoing reservation. Re-checks under the
    /// lock: the session may have been ended, or an extension approved,
    /// between the sweep's scan and this call.
    pub(crate) async fn sweep_end(
        &self,
        id: Ulid,
        room_id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write_owned().await;
        let Some(r) = guard.get(&id) else {
            return Ok(false);
        };
        let overdue = r.status == ReservationStatus::Ongoing
            && r.effective_end().is_some_and(|end| end <= now);
        if !overdue {
            return Ok(false);
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationEnded { id, room_id, at: now })
            .await?;
        Ok(true)
    }

    /// Archive a Completed reservation past retention.
    pub(crate) async fn sweep_archive(
        &self,
        id: Ulid,
        room_id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write_owned().await;
        let Some(r) = guard.get(&id) else {
            return Ok(false);
        };
        if r.status != ReservationStatus::Completed {
            return Ok(false);
        }
        self.persist_and_apply(room_id, &mut guard, &Event::ReservationArchived { id, room_id, at: now })
            .await?;
        Ok(true)
    }
}
