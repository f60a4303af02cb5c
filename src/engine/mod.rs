mod availability;
mod error;
mod lifecycle;
mod queries;
mod reports;
#[cfg(test)]
mod tests;

pub use availability::{
    find_conflict, free_windows, is_free, merge_overlapping, next_obstacle, subtract_intervals,
};
pub(crate) use availability::now_ms;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Marks the snapshot cut: every append flushed after this point is also
    /// recorded in memory, and the following Compact re-appends those events
    /// after the snapshot so transitions that commit while the snapshot is
    /// being taken survive the rewrite.
    BeginCompact {
        response: oneshot::Sender<()>,
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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    // While a compaction snapshot is being taken, appends keep flowing; this
    // buffer keeps a copy of each flushed event so Compact can carry them
    // past the file rewrite.
    let mut tail: Option<Vec<Event>> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch, &mut tail);
                            handle_non_append(&mut wal, other, &mut tail);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch, &mut tail);
                }
            }
            other => handle_non_append(&mut wal, other, &mut tail),
        }
    }
}

fn flush_and_respond(
    wal: &mut Wal,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    tail: &mut Option<Vec<Event>>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    // Only acknowledged events are recorded: a failed batch was never
    // committed, so it must not resurface after the compaction swap.
    if result.is_ok()
        && let Some(recorded) = tail.as_mut() {
            recorded.extend(batch.iter().map(|(event, _)| event.clone()));
        }
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
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

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, tail: &mut Option<Vec<Event>>) {
    match cmd {
        WalCommand::BeginCompact { response } => {
            *tail = Some(Vec::new());
            let _ = response.send(());
        }
        WalCommand::Compact { mut events, response } => {
            // Events committed after the snapshot cut go after the snapshot,
            // in commit order; replay tolerates any that the snapshot
            // already reflects.
            if let Some(recorded) = tail.take() {
                events.extend(recorded);
            }
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

/// One campus's booking state: rooms with their reservations, the staff
/// directory, and the report ledger. Each room is an independently locked
/// unit, so transitions on unrelated rooms never contend.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    /// Room label ("201") → room id.
    pub(super) room_index: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: DashMap<Ulid, Ulid>,
    pub(super) staff: DashMap<Ulid, StaffMember>,
    pub(super) reports: DashMap<Ulid, Report>,
    /// Serializes the balancer's pick + insert so two concurrent filings
    /// cannot both claim the same least-loaded staff member.
    pub(super) assign_mu: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a reservation-scoped event to a RoomState (no locking — caller holds
/// the lock). The WAL is the source of truth; this is the only place record
/// fields change.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationRequested {
            id,
            room_id,
            requester,
            participants,
            span,
            at,
        } => {
            // A compacted log may carry this event after a snapshot that
            // already contains the reservation; never insert twice.
            if rs.get(id).is_none() {
                rs.insert_reservation(Reservation::new(
                    *id,
                    *requester,
                    participants.clone(),
                    *span,
                    *at,
                ));
            }
            index.insert(*id, *room_id);
        }
        Event::ReservationApproved { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.status = ReservationStatus::Approved;
                r.updated_at = *at;
            }
        }
        Event::ReservationRejected { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.status = ReservationStatus::Rejected;
                r.updated_at = *at;
            }
        }
        Event::ReservationCancelled { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.status = ReservationStatus::Cancelled;
                r.updated_at = *at;
            }
        }
        Event::ReservationStarted { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.status = ReservationStatus::Ongoing;
                r.actual_start = Some(*at);
                r.updated_at = *at;
            }
        }
        Event::ReservationEnded { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.status = ReservationStatus::Completed;
                r.actual_end = Some(*at);
                r.updated_at = *at;
                // Ending resolves any still-open negotiation; a Pending
                // extension must not outlive the session it belongs to.
                if r.extension_status == ExtensionStatus::Pending {
                    r.extension_status = ExtensionStatus::Rejected;
                    r.extension_requested = false;
                }
            }
        }
        Event::ReservationArchived { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.status = ReservationStatus::Archived;
                r.updated_at = *at;
            }
        }
        Event::ExtensionRequested { id, reason, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.extension_requested = true;
                r.extension_status = ExtensionStatus::Pending;
                r.extension_reason = reason.clone();
                r.updated_at = *at;
            }
        }
        Event::ExtensionApproved { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.extension_status = ExtensionStatus::Approved;
                r.updated_at = *at;
            }
        }
        Event::ExtensionRejected { id, at, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.extension_status = ExtensionStatus::Rejected;
                r.extension_requested = false;
                r.updated_at = *at;
            }
        }
        Event::ReservationSnapshot {
            room_id,
            reservation,
        } => {
            index.insert(reservation.id, *room_id);
            rs.insert_reservation(reservation.clone());
        }
        // Room/staff/report events are handled at the Engine level, not here
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            room_index: DashMap::new(),
            reservation_to_room: DashMap::new(),
            staff: DashMap::new(),
            reports: DashMap::new(),
            assign_mu: Mutex::new(()),
            wal_tx,
            notify,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy campus
        // creation).
        for event in &events {
            match event {
                Event::RoomRegistered { id, room, floor } => {
                    // Skip a repeat registration (a compacted log may carry
                    // one after the room's snapshot); a fresh RoomState here
                    // would wipe the snapshotted reservations.
                    if !engine.rooms.contains_key(id) {
                        let rs = RoomState::new(*id, room.clone(), floor.clone());
                        engine.room_index.insert(room.clone(), *id);
                        engine.rooms.insert(*id, Arc::new(RwLock::new(rs)));
                    }
                }
                Event::RoomRetired { id } => {
                    if let Some((_, rs)) = engine.rooms.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        engine.room_index.remove(&guard.room);
                    }
                }
                Event::StaffRegistered { .. }
                | Event::StaffRemoved { .. }
                | Event::ReportFiled { .. }
                | Event::ReportAssigned { .. }
                | Event::ReportStarted { .. }
                | Event::ReportResolved { .. }
                | Event::ReportArchived { .. } => {
                    engine.apply_directory(event);
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.rooms.get(&room_id) {
                            let rs_arc = entry.clone();
                            let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                            apply_to_room(&mut guard, other, &engine.reservation_to_room);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// Resolve a room label ("201") to its id.
    pub fn room_id_by_label(&self, label: &str) -> Option<Ulid> {
        self.room_index.get(label).map(|e| *e.value())
    }

    pub fn room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, while the caller holds the
    /// room's write lock. Check and commit are therefore one atomic unit.
    pub(super) async fn persist_and_apply(
        &self,
        room_id: Ulid,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.reservation_to_room);
        self.notify.send(room_id, event);
        Ok(())
    }

    /// WAL-append + apply for staff/report events; notifies `topic` if set
    /// (the assigned staff member's channel).
    pub(super) async fn persist_directory(
        &self,
        topic: Option<Ulid>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_directory(event);
        if let Some(t) = topic {
            self.notify.send(t, event);
        }
        Ok(())
    }

    /// Apply a staff/report event to the directory maps.
    fn apply_directory(&self, event: &Event) {
        match event {
            Event::StaffRegistered { id, name, floor } => {
                self.staff.insert(
                    *id,
                    StaffMember {
                        id: *id,
                        name: name.clone(),
                        floor: floor.clone(),
                    },
                );
            }
            Event::StaffRemoved { id } => {
                self.staff.remove(id);
            }
            Event::ReportFiled { report } => {
                self.reports.insert(report.id, report.clone());
            }
            Event::ReportAssigned { id, staff_id } => {
                if let Some(mut r) = self.reports.get_mut(id) {
                    r.assigned_to = Some(*staff_id);
                    r.note = None;
                }
            }
            Event::ReportStarted { id } => {
                if let Some(mut r) = self.reports.get_mut(id) {
                    r.status = ReportStatus::InProgress;
                }
            }
            Event::ReportResolved {
                id,
                action_taken,
                at,
            } => {
                if let Some(mut r) = self.reports.get_mut(id) {
                    r.status = ReportStatus::Resolved;
                    r.resolved_at = Some(*at);
                    r.action_taken = Some(action_taken.clone());
                }
            }
            Event::ReportArchived { id } => {
                if let Some(mut r) = self.reports.get_mut(id) {
                    r.status = ReportStatus::Archived;
                }
            }
            _ => {}
        }
    }

    /// Lookup reservation → room, get room, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        Ok((room_id, guard))
    }

    /// Ongoing reservations whose effective end has passed. The reaper ends
    /// these; reservations with an approved extension have no effective end
    /// and are never swept.
    pub fn collect_overdue(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut overdue = Vec::new();
        for entry in self.rooms.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for r in &guard.reservations {
                    if r.status == ReservationStatus::Ongoing
                        && let Some(end) = r.effective_end()
                        && end <= now {
                            overdue.push((r.id, guard.id));
                        }
                }
            }
        }
        overdue
    }

    /// Completed reservations past the retention window, due for archival.
    pub fn collect_archivable(&self, now: Ms, retention_ms: Ms) -> Vec<(Ulid, Ulid)> {
        let mut due = Vec::new();
        for entry in self.rooms.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for r in &guard.reservations {
                    if r.status == ReservationStatus::Completed
                        && let Some(ended) = r.actual_end
                        && ended + retention_ms <= now {
                            due.push((r.id, guard.id));
                        }
                }
            }
        }
        due
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Archived reservations and reports are
    /// dropped — archival is the retention boundary.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Mark the snapshot cut first. Any transition that commits from here
        // on is recorded by the writer and re-appended after the swap, so an
        // acknowledged write can never be erased by a stale snapshot. A
        // transition already flushed when we read its room is covered by the
        // room lock: its in-memory apply finishes before our read lock is
        // granted, so the snapshot reflects it.
        let (cut_tx, cut_rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::BeginCompact { response: cut_tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        cut_rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?;

        let mut events = Vec::new();

        let room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        for id in room_ids {
            let entry = match self.rooms.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let rs = entry.value().clone();
            drop(entry); // don't hold the DashMap shard across an await
            let guard = rs.read().await;

            events.push(Event::RoomRegistered {
                id: guard.id,
                room: guard.room.clone(),
                floor: guard.floor.clone(),
            });
            for r in &guard.reservations {
                if r.status == ReservationStatus::Archived {
                    continue;
                }
                events.push(Event::ReservationSnapshot {
                    room_id: guard.id,
                    reservation: r.clone(),
                });
            }
        }

        for entry in self.staff.iter() {
            let s = entry.value();
            events.push(Event::StaffRegistered {
                id: s.id,
                name: s.name.clone(),
                floor: s.floor.clone(),
            });
        }

        for entry in self.reports.iter() {
            let r = entry.value();
            if r.status == ReportStatus::Archived {
                continue;
            }
            events.push(Event::ReportFiled { report: r.clone() });
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
}

/// Extract the room_id from a reservation-scoped event.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationRequested { room_id, .. }
        | Event::ReservationApproved { room_id, .. }
        | Event::ReservationRejected { room_id, .. }
        | Event::ReservationCancelled { room_id, .. }
        | Event::ReservationStarted { room_id, .. }
        | Event::ReservationEnded { room_id, .. }
        | Event::ReservationArchived { room_id, .. }
        | Event::ExtensionRequested { room_id, .. }
        | Event::ExtensionApproved { room_id, .. }
        | Event::ExtensionRejected { room_id, .. }
        | Event::ReservationSnapshot { room_id, .. } => Some(*room_id),
        _ => None,
    }
}
