use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Who is acting. Requesters may only touch their own reservations;
/// staff and admins carry the portal's operator powers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Requester,
    Staff,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.role, Role::Staff | Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

/// A reservation participant: a registered user or a free-text guest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Participant {
    User(Ulid),
    Guest(String),
}

/// Reservation lifecycle states. The vocabulary is fixed — stored data and the
/// wire protocol both use these names verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Ongoing,
    Completed,
    Cancelled,
    Archived,
}

impl ReservationStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Rejected
                | ReservationStatus::Cancelled
                | ReservationStatus::Completed
                | ReservationStatus::Archived
        )
    }

    /// Only Approved and Ongoing reservations block a room. Pending requests
    /// are provisional; the conflict check happens at approval time.
    pub fn blocks(&self) -> bool {
        matches!(self, ReservationStatus::Approved | ReservationStatus::Ongoing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "Pending",
            ReservationStatus::Approved => "Approved",
            ReservationStatus::Rejected => "Rejected",
            ReservationStatus::Ongoing => "Ongoing",
            ReservationStatus::Completed => "Completed",
            ReservationStatus::Cancelled => "Cancelled",
            ReservationStatus::Archived => "Archived",
        }
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ReservationStatus::Pending),
            "Approved" => Ok(ReservationStatus::Approved),
            "Rejected" => Ok(ReservationStatus::Rejected),
            "Ongoing" => Ok(ReservationStatus::Ongoing),
            "Completed" => Ok(ReservationStatus::Completed),
            "Cancelled" => Ok(ReservationStatus::Cancelled),
            "Archived" => Ok(ReservationStatus::Archived),
            _ => Err(()),
        }
    }
}

/// Extension negotiation state, layered on an Ongoing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionStatus {
    None,
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester: Ulid,
    pub participants: Vec<Participant>,
    /// Scheduled window `[start, end)`.
    pub span: Span,
    pub status: ReservationStatus,
    pub extension_requested: bool,
    pub extension_status: ExtensionStatus,
    pub extension_reason: Option<String>,
    /// Stamped on Approved → Ongoing; may differ from the scheduled start.
    pub actual_start: Option<Ms>,
    /// Stamped on Ongoing → Completed.
    pub actual_end: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn new(
        id: Ulid,
        requester: Ulid,
        participants: Vec<Participant>,
        span: Span,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            requester,
            participants,
            span,
            status: ReservationStatus::Pending,
            extension_requested: false,
            extension_status: ExtensionStatus::None,
            extension_reason: None,
            actual_start: None,
            actual_end: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// When the reservation stops occupying the room. `None` means open-ended:
    /// an approved extension has no fixed end until the reservation is ended.
    pub fn effective_end(&self) -> Option<Ms> {
        if self.extension_status == ExtensionStatus::Approved {
            None
        } else {
            Some(self.span.end)
        }
    }

    pub fn blocks(&self) -> bool {
        self.status.blocks()
    }
}

/// Report (incident/maintenance ticket) states. `In Progress` keeps its
/// two-word spelling in stored data and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Pending,
    #[serde(rename = "In Progress")]
    InProgress,
    Resolved,
    Archived,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "Pending",
            ReportStatus::InProgress => "In Progress",
            ReportStatus::Resolved => "Resolved",
            ReportStatus::Archived => "Archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: Ulid,
    pub category: String,
    pub floor: String,
    pub room: String,
    pub details: String,
    pub status: ReportStatus,
    pub assigned_to: Option<Ulid>,
    /// Attached when no staff cover the floor at filing time.
    pub note: Option<String>,
    pub created_at: Ms,
    pub resolved_at: Option<Ms>,
    pub action_taken: Option<String>,
}

impl Report {
    /// Active reports count toward a staff member's workload.
    pub fn is_active(&self) -> bool {
        matches!(self.status, ReportStatus::Pending | ReportStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
    /// Floor assignment; reports are only routed to staff on their floor.
    pub floor: String,
}

/// In-memory state of one room: identity plus every reservation taken
/// against it, sorted by scheduled start.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub room: String,
    pub floor: String,
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: Ulid, room: String, floor: String) -> Self {
        Self {
            id,
            room,
            floor,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping sort order by scheduled start. Spans never change after
    /// creation, so the order stays valid across status transitions.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose scheduled span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// True if any reservation is still live (non-terminal). Retiring a room
    /// is refused while this holds.
    pub fn has_live_reservations(&self) -> bool {
        self.reservations.iter().any(|r| !r.status.is_terminal())
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        id: Ulid,
        room: String,
        floor: String,
    },
    RoomRetired {
        id: Ulid,
    },
    ReservationRequested {
        id: Ulid,
        room_id: Ulid,
        requester: Ulid,
        participants: Vec<Participant>,
        span: Span,
        at: Ms,
    },
    ReservationApproved {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    ReservationRejected {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    /// `at` becomes `actual_start`.
    ReservationStarted {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    /// `at` becomes `actual_end`.
    ReservationEnded {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    ReservationArchived {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    ExtensionRequested {
        id: Ulid,
        room_id: Ulid,
        reason: Option<String>,
        at: Ms,
    },
    ExtensionApproved {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    ExtensionRejected {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    StaffRegistered {
        id: Ulid,
        name: String,
        floor: String,
    },
    StaffRemoved {
        id: Ulid,
    },
    ReportFiled {
        report: Report,
    },
    ReportAssigned {
        id: Ulid,
        staff_id: Ulid,
    },
    ReportStarted {
        id: Ulid,
    },
    ReportResolved {
        id: Ulid,
        action_taken: String,
        at: Ms,
    },
    ReportArchived {
        id: Ulid,
    },
    /// Compaction-only: the full record as it stands, replayed verbatim.
    ReservationSnapshot {
        room_id: Ulid,
        reservation: Reservation,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub room: String,
    pub floor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadInfo {
    pub staff: Ulid,
    pub name: String,
    pub active_reports: usize,
}
