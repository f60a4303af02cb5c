use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("interval must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

// ── Availability Checker ──────────────────────────────────────────
//
// Only Approved and Ongoing reservations block a room. An Ongoing reservation
// with an approved extension occupies the room open-endedly from its scheduled
// start until it is ended. All checks are side-effect-free; the caller holds
// the room lock, making check + commit one atomic unit.

/// First blocking reservation whose occupancy overlaps `span` (half-open).
/// `exclude` lets a reservation re-validate without conflicting with itself,
/// which the extension re-check depends on.
pub fn find_conflict<'a>(
    rs: &'a RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    // Everything at index >= right_bound starts at or after span.end → can't overlap.
    let right_bound = rs.reservations.partition_point(|r| r.span.start < span.end);
    rs.reservations[..right_bound].iter().find(|r| {
        r.blocks()
            && Some(r.id) != exclude
            && match r.effective_end() {
                Some(end) => end > span.start,
                None => true, // open-ended occupancy
            }
    })
}

/// The single authority consulted before any transition that could
/// double-book: true iff no blocking reservation overlaps `span`.
pub fn is_free(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, span, exclude).is_none()
}

/// Earliest blocking reservation (other than `exclude`) still occupying the
/// room at any instant past `after`. This is the "next known boundary" an
/// open-ended extension would run into; its scheduled start is reported as
/// the conflict time.
pub fn next_obstacle<'a>(rs: &'a RoomState, after: Ms, exclude: Ulid) -> Option<&'a Reservation> {
    // Sorted by start, so the first hit is the nearest one.
    rs.reservations.iter().find(|r| {
        r.id != exclude
            && r.blocks()
            && match r.effective_end() {
                Some(end) => end > after,
                None => true,
            }
    })
}

/// Free sub-windows of `query` once blocking occupancy is subtracted.
/// Sorted, disjoint. Schedule UIs render these directly.
pub fn free_windows(rs: &RoomState, query: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = Vec::new();
    let right_bound = rs.reservations.partition_point(|r| r.span.start < query.end);
    for r in &rs.reservations[..right_bound] {
        if !r.blocks() {
            continue;
        }
        let occ_end = match r.effective_end() {
            Some(end) => end.min(query.end),
            None => query.end,
        };
        let occ_start = r.span.start.max(query.start);
        if occ_start < occ_end {
            busy.push(Span::new(occ_start, occ_end));
        }
    }
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[*query], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
