use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::campus::CampusManager;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability;

/// Longest accepted request line. Generous: the largest legal payload is a
/// reservation with MAX_PARTICIPANTS guest names.
const MAX_LINE_LEN: usize = 64 * 1024;

/// One request per line, JSON-encoded, `op` selects the operation. Identity
/// is connection-scoped: the `hello` handshake carries the actor and campus,
/// every later request acts as that actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        password: String,
        campus: String,
        actor: Ulid,
        role: Role,
    },
    RegisterRoom {
        room: String,
        floor: String,
    },
    RetireRoom {
        room_id: Ulid,
    },
    CreateReservation {
        room_id: Ulid,
        #[serde(default)]
        participants: Vec<Participant>,
        start: Ms,
        end: Ms,
    },
    /// Drives the whole lifecycle: Approved, Rejected, Cancelled, Ongoing
    /// (check-in), Completed (check-out), Archived.
    SetStatus {
        reservation_id: Ulid,
        status: ReservationStatus,
    },
    RequestExtension {
        reservation_id: Ulid,
        #[serde(default)]
        reason: String,
    },
    DecideExtension {
        reservation_id: Ulid,
        approve: bool,
    },
    RegisterStaff {
        name: String,
        floor: String,
    },
    RemoveStaff {
        staff_id: Ulid,
    },
    FileReport {
        category: String,
        floor: String,
        #[serde(default)]
        room: String,
        #[serde(default)]
        details: String,
    },
    AssignReport {
        report_id: Ulid,
        staff_id: Ulid,
    },
    StartReport {
        report_id: Ulid,
    },
    ResolveReport {
        report_id: Ulid,
        action_taken: String,
    },
    ArchiveReport {
        report_id: Ulid,
    },
    Rooms,
    Reservation {
        reservation_id: Ulid,
    },
    Schedule {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Availability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Staff {
        #[serde(default)]
        floor: Option<String>,
    },
    Reports {
        #[serde(default)]
        floor: Option<String>,
    },
    Workloads {
        #[serde(default)]
        floor: Option<String>,
    },
    /// Subscribe to a topic: a room id (lifecycle events) or a staff id
    /// (report assignments). Events arrive as out-of-band `notify` frames.
    Listen {
        topic: Ulid,
    },
    Unlisten {
        topic: Ulid,
    },
}

fn ok_response(data: Value) -> String {
    json!({"ok": true, "data": data}).to_string()
}

/// Error frames carry a stable machine-readable `kind` (from
/// `EngineError::kind`) next to the human message. Clients switch on:
/// `validation`, `invalid_transition`, `conflict`, `extension_conflict`
/// (an extension refusal — a conflict that names when the room is next
/// needed rather than a full interval), `unauthorized`, `not_found`,
/// `already_exists`, `room_in_use`, `limit_exceeded`, `wal_error`.
fn err_response(kind: &str, message: &str) -> String {
    json!({"ok": false, "error": {"kind": kind, "message": message}}).to_string()
}

fn notify_frame(topic: Ulid, event: &Event) -> String {
    json!({"notify": topic, "event": event}).to_string()
}

/// Drive one client connection: hello handshake, then a request loop
/// multiplexed with notification delivery.
pub async fn process_connection(
    socket: TcpStream,
    campuses: Arc<CampusManager>,
    password: Arc<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    // Hello must come first and carries auth + campus + identity
    let (engine, actor) = match framed.next().await {
        Some(Ok(line)) => match serde_json::from_str::<Request>(&line) {
            Ok(Request::Hello {
                password: given,
                campus,
                actor,
                role,
            }) => {
                if given != *password {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    framed
                        .send(err_response("unauthorized", "bad password"))
                        .await?;
                    return Ok(());
                }
                match campuses.get_or_create(&campus) {
                    Ok(engine) => {
                        framed.send(ok_response(json!({"campus": campus}))).await?;
                        (engine, Actor::new(actor, role))
                    }
                    Err(e) => {
                        framed
                            .send(err_response("validation", &e.to_string()))
                            .await?;
                        return Ok(());
                    }
                }
            }
            Ok(_) => {
                framed
                    .send(err_response("validation", "hello must be the first request"))
                    .await?;
                return Ok(());
            }
            Err(e) => {
                framed
                    .send(err_response("validation", &format!("bad request: {e}")))
                    .await?;
                return Ok(());
            }
        },
        _ => return Ok(()), // disconnected before hello
    };

    // Notifications from all subscribed topics funnel into one channel so the
    // select below stays two-armed no matter how many topics are live.
    let (event_tx, mut event_rx) = mpsc::channel::<(Ulid, Event)>(256);
    let mut forwarders: HashMap<Ulid, JoinHandle<()>> = HashMap::new();

    let result = loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                };
                let request = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        framed.send(err_response("validation", &format!("bad request: {e}"))).await?;
                        continue;
                    }
                };

                let op = observability::op_label(&request);
                let started = std::time::Instant::now();
                let response = match request {
                    Request::Hello { .. } => {
                        Err(EngineError::Validation("already authenticated"))
                    }
                    Request::Listen { topic } => {
                        subscribe_topic(&engine, topic, &event_tx, &mut forwarders);
                        Ok(json!({"listening": topic}))
                    }
                    Request::Unlisten { topic } => {
                        if let Some(handle) = forwarders.remove(&topic) {
                            handle.abort();
                        }
                        Ok(json!({"listening": Value::Null}))
                    }
                    other => handle_request(&engine, &actor, other).await,
                };
                let status = if response.is_ok() { "ok" } else { "error" };
                metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => status)
                    .increment(1);
                metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
                    .record(started.elapsed().as_secs_f64());

                let line = match response {
                    Ok(data) => ok_response(data),
                    Err(e) => {
                        debug!(op, error = %e, "request failed");
                        err_response(e.kind(), &e.to_string())
                    }
                };
                framed.send(line).await?;
            }
            notification = event_rx.recv() => {
                // Senders can't all drop while `forwarders`/`event_tx` live here
                if let Some((topic, event)) = notification {
                    framed.send(notify_frame(topic, &event)).await?;
                }
            }
        }
    };

    for handle in forwarders.values() {
        handle.abort();
    }
    result
}

/// Spawn a task that pumps one topic's broadcast channel into the
/// connection's notification funnel.
fn subscribe_topic(
    engine: &Engine,
    topic: Ulid,
    event_tx: &mpsc::Sender<(Ulid, Event)>,
    forwarders: &mut HashMap<Ulid, JoinHandle<()>>,
) {
    if forwarders.contains_key(&topic) {
        return;
    }
    let mut rx = engine.notify.subscribe(topic);
    let tx = event_tx.clone();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send((topic, event)).await.is_err() {
                        break; // connection gone
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(%topic, skipped = n, "notification subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    forwarders.insert(topic, handle);
}

async fn handle_request(
    engine: &Engine,
    actor: &Actor,
    request: Request,
) -> Result<Value, EngineError> {
    let now = now_ms();
    match request {
        Request::RegisterRoom { room, floor } => {
            let id = engine.register_room(actor, room, floor).await?;
            Ok(json!({"room_id": id}))
        }
        Request::RetireRoom { room_id } => {
            engine.retire_room(actor, room_id).await?;
            Ok(json!({"retired": room_id}))
        }
        Request::CreateReservation {
            room_id,
            participants,
            start,
            end,
        } => {
            if start >= end {
                return Err(EngineError::Validation("interval must end after it starts"));
            }
            let id = engine
                .create_reservation(actor, room_id, participants, Span::new(start, end), now)
                .await?;
            Ok(json!({"reservation_id": id, "status": ReservationStatus::Pending}))
        }
        Request::SetStatus {
            reservation_id,
            status,
        } => {
            engine.set_status(reservation_id, actor, status, now).await?;
            Ok(json!({"reservation_id": reservation_id, "status": status}))
        }
        Request::RequestExtension {
            reservation_id,
            reason,
        } => {
            engine
                .request_extension(actor, reservation_id, reason, now)
                .await?;
            Ok(json!({"reservation_id": reservation_id, "extension": ExtensionStatus::Pending}))
        }
        Request::DecideExtension {
            reservation_id,
            approve,
        } => {
            engine
                .decide_extension(reservation_id, actor, approve, now)
                .await?;
            let decided = if approve {
                ExtensionStatus::Approved
            } else {
                ExtensionStatus::Rejected
            };
            Ok(json!({"reservation_id": reservation_id, "extension": decided}))
        }
        Request::RegisterStaff { name, floor } => {
            let id = engine.register_staff(actor, name, floor).await?;
            Ok(json!({"staff_id": id}))
        }
        Request::RemoveStaff { staff_id } => {
            engine.remove_staff(actor, staff_id).await?;
            Ok(json!({"removed": staff_id}))
        }
        Request::FileReport {
            category,
            floor,
            room,
            details,
        } => {
            let report = engine
                .file_report(actor, category, floor, room, details, now)
                .await?;
            to_value(report)
        }
        Request::AssignReport {
            report_id,
            staff_id,
        } => {
            engine.assign_report(actor, report_id, staff_id).await?;
            Ok(json!({"report_id": report_id, "assigned_to": staff_id}))
        }
        Request::StartReport { report_id } => {
            engine.start_report(actor, report_id).await?;
            Ok(json!({"report_id": report_id, "status": ReportStatus::InProgress}))
        }
        Request::ResolveReport {
            report_id,
            action_taken,
        } => {
            engine
                .resolve_report(actor, report_id, action_taken, now)
                .await?;
            Ok(json!({"report_id": report_id, "status": ReportStatus::Resolved}))
        }
        Request::ArchiveReport { report_id } => {
            engine.archive_report(actor, report_id).await?;
            Ok(json!({"report_id": report_id, "status": ReportStatus::Archived}))
        }
        Request::Rooms => to_value(engine.list_rooms()),
        Request::Reservation { reservation_id } => {
            to_value(engine.get_reservation(&reservation_id).await?)
        }
        Request::Schedule {
            room_id,
            start,
            end,
        } => {
            if start >= end {
                return Err(EngineError::Validation("interval must end after it starts"));
            }
            to_value(
                engine
                    .reservations_in_window(room_id, Span::new(start, end))
                    .await?,
            )
        }
        Request::Availability {
            room_id,
            start,
            end,
        } => {
            if start >= end {
                return Err(EngineError::Validation("interval must end after it starts"));
            }
            to_value(
                engine
                    .room_free_windows(room_id, Span::new(start, end))
                    .await?,
            )
        }
        Request::Staff { floor } => to_value(engine.list_staff(floor.as_deref())),
        Request::Reports { floor } => to_value(engine.list_reports(floor.as_deref())),
        Request::Workloads { floor } => to_value(engine.workloads(floor.as_deref())),
        // Handled in the connection loop
        Request::Hello { .. } | Request::Listen { .. } | Request::Unlisten { .. } => {
            Err(EngineError::Validation("unexpected request"))
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::WalError(e.to_string()))
}
