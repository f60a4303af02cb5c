use crate::model::Ms;

// Hard caps. Requests past these fail with `LimitExceeded` rather than
// degrading the whole campus.

pub const MAX_ROOMS_PER_CAMPUS: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;
pub const MAX_PARTICIPANTS: usize = 64;
pub const MAX_STAFF_PER_CAMPUS: usize = 10_000;
pub const MAX_REPORTS_PER_CAMPUS: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One reservation may span at most 30 days.
pub const MAX_SPAN_DURATION_MS: Ms = 30 * 24 * 3_600_000;

/// Schedule/availability queries may cover at most one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// A reservation may be started up to this long before its scheduled start.
pub const START_TOLERANCE_MS: Ms = 15 * 60_000;

pub const MAX_CAMPUSES: usize = 256;
pub const MAX_CAMPUS_NAME_LEN: usize = 256;
