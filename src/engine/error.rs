use ulid::Ulid;

use crate::model::{Ms, ReservationStatus, Role, Span};

/// Terminal, synchronous outcomes of a single operation. None of these are
/// retried internally — each is a business-rule rejection, not a transient
/// fault. Every variant formats to its own stable message template so callers
/// never have to parse free text.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed input; always recoverable by the caller.
    Validation(&'static str),
    /// Requested status change is not legal from the current state.
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// Approval would double-book the room; carries the conflicting interval.
    Conflict {
        with: Ulid,
        span: Span,
    },
    /// Extension approval refused; carries the start of the next booking.
    ExtensionConflict {
        with: Ulid,
        conflict_time: Ms,
    },
    /// Actor's role does not permit the requested operation.
    Unauthorized {
        role: Role,
        action: &'static str,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Room still has non-terminal reservations.
    RoomInUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(
                    f,
                    "invalid transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::Conflict { with, span } => {
                write!(
                    f,
                    "conflict with reservation {with} over [{}, {})",
                    span.start, span.end
                )
            }
            EngineError::ExtensionConflict {
                with,
                conflict_time,
            } => {
                write!(
                    f,
                    "extension refused: reservation {with} begins at {conflict_time}"
                )
            }
            EngineError::Unauthorized { role, action } => {
                write!(f, "role {role:?} may not {action}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::RoomInUse(id) => {
                write!(f, "cannot retire room {id}: live reservations exist")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Stable machine-readable kind, used by the wire layer and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Conflict { .. } => "conflict",
            EngineError::ExtensionConflict { .. } => "extension_conflict",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::RoomInUse(_) => "room_in_use",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
