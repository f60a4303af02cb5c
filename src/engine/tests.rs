use std::path::PathBuf;
use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::limits::START_TOLERANCE_MS;
use crate::notify::NotifyHub;

const H: Ms = 3_600_000;
const M: Ms = 60_000;
// Midnight, some weekday in 2023. Every scheduled instant below is T0-relative.
const T0: Ms = 1_700_000_000_000 - (1_700_000_000_000 % 86_400_000);

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(path: &PathBuf) -> Arc<Engine> {
    Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap())
}

fn engine(name: &str) -> Arc<Engine> {
    engine_at(&test_wal_path(name))
}

fn admin() -> Actor {
    Actor {
        id: Ulid::new(),
        role: Role::Admin,
    }
}

fn staff() -> Actor {
    Actor {
        id: Ulid::new(),
        role: Role::Staff,
    }
}

fn requester() -> Actor {
    Actor {
        id: Ulid::new(),
        role: Role::Requester,
    }
}

fn at(hour: Ms) -> Ms {
    T0 + hour * H
}

async fn room_201(eng: &Engine, a: &Actor) -> Ulid {
    eng.register_room(a, "201".into(), "2nd Floor".into())
        .await
        .unwrap()
}

// ── Full lifecycle walk ────────────────────────────────────

#[tokio::test]
async fn full_booking_flow_with_extension() {
    let eng = engine("full_flow.wal");
    let adm = admin();
    let front_desk = staff();
    let alice = requester();
    let bob = requester();

    let room = room_201(&eng, &adm).await;

    // Alice requests 09:00-10:00
    let res = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    assert_eq!(
        eng.get_reservation(&res).await.unwrap().status,
        ReservationStatus::Pending
    );

    assert_ok!(eng.approve_reservation(res, &front_desk, at(8)).await);

    // Check-in five minutes late
    assert_ok!(eng.start_reservation(res, &front_desk, at(9) + 5 * M).await);
    let r = eng.get_reservation(&res).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Ongoing);
    assert_eq!(r.actual_start, Some(at(9) + 5 * M));

    // Session overruns; Alice asks to keep the room
    assert_ok!(
        eng.request_extension(&alice, res, "seminar running long".into(), at(10) - 10 * M)
            .await
    );
    assert_ok!(eng.decide_extension(res, &front_desk, true, at(10) - 5 * M).await);
    let r = eng.get_reservation(&res).await.unwrap();
    assert_eq!(r.extension_status, ExtensionStatus::Approved);
    assert_eq!(r.effective_end(), None);

    // Bob's overlapping request cannot be approved while the room is held open
    let bob_res = eng
        .create_reservation(&bob, room, vec![], Span::new(at(10) + 30 * M, at(11) + 30 * M), at(10))
        .await
        .unwrap();
    let err = eng
        .approve_reservation(bob_res, &front_desk, at(10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { with, .. } if with == res));

    // Alice finally leaves at 11:40
    assert_ok!(eng.end_reservation(res, &alice, at(11) + 40 * M).await);
    let r = eng.get_reservation(&res).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);
    assert_eq!(r.actual_end, Some(at(11) + 40 * M));

    // Room is free again; Bob's later window now clears (it's in the past
    // relative to nothing — approval doesn't check wall-clock time)
    assert_ok!(eng.approve_reservation(bob_res, &front_desk, at(12)).await);

    assert_ok!(eng.archive_reservation(res, &adm, at(13)).await);
    assert_eq!(
        eng.get_reservation(&res).await.unwrap().status,
        ReservationStatus::Archived
    );
}

// ── Double-booking protection ──────────────────────────────

#[tokio::test]
async fn concurrent_approvals_admit_exactly_one() {
    let eng = engine("concurrent_approve.wal");
    let adm = admin();
    let room = room_201(&eng, &adm).await;

    // Two overlapping Pending requests may coexist
    let a = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    let b = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9) + 30 * M, at(10) + 30 * M), at(8))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for id in [a, b] {
        let eng = eng.clone();
        let op = staff();
        handles.push(tokio::spawn(async move {
            eng.approve_reservation(id, &op, at(8)).await
        }));
    }

    let mut ok = 0;
    let mut conflict = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(EngineError::Conflict { .. }) => conflict += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, conflict), (1, 1));
}

#[tokio::test]
async fn approval_allows_boundary_touch() {
    let eng = engine("boundary_touch.wal");
    let adm = admin();
    let op = staff();
    let room = room_201(&eng, &adm).await;

    let a = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    let b = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(10), at(11)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.approve_reservation(a, &op, at(8)).await);
    // [10:00, 11:00) after [09:00, 10:00) — back-to-back is fine
    assert_ok!(eng.approve_reservation(b, &op, at(8)).await);
}

// ── Terminal stickiness ────────────────────────────────────

#[tokio::test]
async fn terminal_statuses_are_sticky() {
    let eng = engine("sticky.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();
    let room = room_201(&eng, &adm).await;

    let res = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.cancel_reservation(res, &alice, at(8)).await);

    // Cancelling twice is an error, not a silent no-op
    let err = eng.cancel_reservation(res, &alice, at(8)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: ReservationStatus::Cancelled,
            to: ReservationStatus::Cancelled,
        }
    ));

    // Nor can a cancelled reservation be approved or started
    assert!(matches!(
        eng.approve_reservation(res, &op, at(8)).await.unwrap_err(),
        EngineError::InvalidTransition { .. }
    ));
    assert!(matches!(
        eng.start_reservation(res, &op, at(9)).await.unwrap_err(),
        EngineError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn nothing_returns_to_pending() {
    let eng = engine("no_pending_return.wal");
    let adm = admin();
    let op = staff();
    let room = room_201(&eng, &adm).await;

    let res = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.approve_reservation(res, &op, at(8)).await);
    let err = eng
        .set_status(res, &adm, ReservationStatus::Pending, at(8))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: ReservationStatus::Approved,
            to: ReservationStatus::Pending,
        }
    ));
}

// ── Check-in window ────────────────────────────────────────

#[tokio::test]
async fn start_respects_tolerance_window() {
    let eng = engine("start_window.wal");
    let adm = admin();
    let op = staff();
    let room = room_201(&eng, &adm).await;

    let res = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.approve_reservation(res, &op, at(8)).await);

    // One minute before the tolerance opens: refused
    let too_early = at(9) - START_TOLERANCE_MS - M;
    assert!(matches!(
        eng.start_reservation(res, &op, too_early).await.unwrap_err(),
        EngineError::Validation(_)
    ));

    // At the scheduled end: refused
    assert!(matches!(
        eng.start_reservation(res, &op, at(10)).await.unwrap_err(),
        EngineError::Validation(_)
    ));

    // Ten minutes early is within tolerance
    assert_ok!(eng.start_reservation(res, &op, at(9) - 10 * M).await);
}

// ── Extension negotiation ──────────────────────────────────

#[tokio::test]
async fn extension_refused_when_room_next_needed() {
    let eng = engine("ext_refused.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();
    let room = room_201(&eng, &adm).await;

    let current = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    let upcoming = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(12), at(13)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.approve_reservation(current, &op, at(8)).await);
    assert_ok!(eng.approve_reservation(upcoming, &op, at(8)).await);
    assert_ok!(eng.start_reservation(current, &op, at(9)).await);

    assert_ok!(eng.request_extension(&alice, current, "need more time".into(), at(9) + 50 * M).await);
    let err = eng
        .decide_extension(current, &op, true, at(9) + 55 * M)
        .await
        .unwrap_err();
    match err {
        EngineError::ExtensionConflict {
            with,
            conflict_time,
        } => {
            assert_eq!(with, upcoming);
            assert_eq!(conflict_time, at(12));
        }
        other => panic!("expected ExtensionConflict, got {other}"),
    }

    // The failed approval leaves the request Pending; staff may still reject it
    let r = eng.get_reservation(&current).await.unwrap();
    assert_eq!(r.extension_status, ExtensionStatus::Pending);
    assert_ok!(eng.decide_extension(current, &op, false, at(9) + 56 * M).await);
    let r = eng.get_reservation(&current).await.unwrap();
    assert_eq!(r.extension_status, ExtensionStatus::Rejected);
    assert!(!r.extension_requested);
}

#[tokio::test]
async fn extension_requires_ongoing_and_single_negotiation() {
    let eng = engine("ext_rules.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();
    let room = room_201(&eng, &adm).await;

    let res = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();

    // Not ongoing yet — a state-machine rejection, not a validation one
    assert!(matches!(
        eng.request_extension(&alice, res, "".into(), at(8)).await.unwrap_err(),
        EngineError::InvalidTransition {
            from: ReservationStatus::Pending,
            to: ReservationStatus::Ongoing,
        }
    ));

    assert_ok!(eng.approve_reservation(res, &op, at(8)).await);
    assert_ok!(eng.start_reservation(res, &op, at(9)).await);

    // Only the requester may ask
    assert!(matches!(
        eng.request_extension(&requester(), res, "".into(), at(9)).await.unwrap_err(),
        EngineError::Unauthorized { .. }
    ));

    assert_ok!(eng.request_extension(&alice, res, "".into(), at(9)).await);
    // Second request while one is pending
    assert_err!(eng.request_extension(&alice, res, "".into(), at(9)).await);

    // Rejected extensions may be retried
    assert_ok!(eng.decide_extension(res, &op, false, at(9)).await);
    assert_ok!(eng.request_extension(&alice, res, "second try".into(), at(9)).await);
}

#[tokio::test]
async fn ending_settles_pending_extension() {
    let eng = engine("ext_settled_on_end.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();
    let room = room_201(&eng, &adm).await;

    let res = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.approve_reservation(res, &op, at(8)).await);
    assert_ok!(eng.start_reservation(res, &op, at(9)).await);
    assert_ok!(eng.request_extension(&alice, res, "".into(), at(9)).await);

    // Alice walks out without waiting for a decision
    assert_ok!(eng.end_reservation(res, &alice, at(9) + 45 * M).await);
    let r = eng.get_reservation(&res).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);
    assert_eq!(r.extension_status, ExtensionStatus::Rejected);
    assert!(!r.extension_requested);
}

// ── Authorization ──────────────────────────────────────────

#[tokio::test]
async fn role_checks() {
    let eng = engine("roles.wal");
    let adm = admin();
    let alice = requester();
    let mallory = requester();
    let room = room_201(&eng, &adm).await;

    // Requesters cannot register rooms or staff
    assert!(matches!(
        eng.register_room(&alice, "202".into(), "2nd Floor".into()).await.unwrap_err(),
        EngineError::Unauthorized { .. }
    ));
    assert!(matches!(
        eng.register_staff(&alice, "Dana".into(), "2nd Floor".into()).await.unwrap_err(),
        EngineError::Unauthorized { .. }
    ));

    let res = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();

    // Requesters cannot approve, not even their own
    assert!(matches!(
        eng.approve_reservation(res, &alice, at(8)).await.unwrap_err(),
        EngineError::Unauthorized { .. }
    ));

    // Another requester cannot cancel Alice's booking, but an admin can
    assert!(matches!(
        eng.cancel_reservation(res, &mallory, at(8)).await.unwrap_err(),
        EngineError::Unauthorized { .. }
    ));
    assert_ok!(eng.cancel_reservation(res, &adm, at(8)).await);
}

// ── Validation ─────────────────────────────────────────────

#[tokio::test]
async fn create_rejects_bad_input() {
    let eng = engine("bad_input.wal");
    let adm = admin();
    let room = room_201(&eng, &adm).await;

    // Inverted interval
    let bad = Span {
        start: at(10),
        end: at(9),
    };
    assert!(matches!(
        eng.create_reservation(&requester(), room, vec![], bad, at(8)).await.unwrap_err(),
        EngineError::Validation(_)
    ));

    // Unknown room
    assert!(matches!(
        eng.create_reservation(&requester(), Ulid::new(), vec![], Span::new(at(9), at(10)), at(8))
            .await
            .unwrap_err(),
        EngineError::NotFound(_)
    ));

    // Duplicate room label
    assert!(matches!(
        eng.register_room(&adm, "201".into(), "2nd Floor".into()).await.unwrap_err(),
        EngineError::AlreadyExists(id) if id == room
    ));
}

// ── Room retirement ────────────────────────────────────────

#[tokio::test]
async fn retire_refuses_while_live() {
    let eng = engine("retire.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();
    let room = room_201(&eng, &adm).await;

    let res = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    assert!(matches!(
        eng.retire_room(&adm, room).await.unwrap_err(),
        EngineError::RoomInUse(id) if id == room
    ));

    assert_ok!(eng.reject_reservation(res, &op, at(8)).await);
    assert_ok!(eng.retire_room(&adm, room).await);
    assert!(eng.room_id_by_label("201").is_none());
    // Lookup entries die with the room
    assert!(eng.room_for_reservation(&res).is_none());
    assert!(matches!(
        eng.get_reservation(&res).await.unwrap_err(),
        EngineError::NotFound(_)
    ));
}

// ── Workload balancer ──────────────────────────────────────

#[tokio::test]
async fn balancer_picks_least_loaded() {
    let eng = engine("balancer.wal");
    let adm = admin();
    let op = staff();

    let a = eng.register_staff(&adm, "A".into(), "2nd Floor".into()).await.unwrap();
    let b = eng.register_staff(&adm, "B".into(), "2nd Floor".into()).await.unwrap();
    let c = eng.register_staff(&adm, "C".into(), "2nd Floor".into()).await.unwrap();

    // Load A with 2 and C with 1 via manual assignment
    for target in [a, a, c] {
        let rep = eng
            .file_report(&op, "HVAC".into(), "2nd Floor".into(), "201".into(), "".into(), at(8))
            .await
            .unwrap();
        eng.assign_report(&op, rep.id, target).await.unwrap();
    }

    let rep = eng
        .file_report(&op, "Lighting".into(), "2nd Floor".into(), "202".into(), "".into(), at(9))
        .await
        .unwrap();
    assert_eq!(rep.assigned_to, Some(b));
    assert!(rep.note.is_none());

    let loads = eng.workloads(Some("2nd Floor"));
    let total: usize = loads.iter().map(|w| w.active_reports).sum();
    assert_eq!(total, 4);
}

#[tokio::test]
async fn balancer_ties_break_by_id() {
    let eng = engine("balancer_tie.wal");
    let adm = admin();
    let op = staff();

    let x = eng.register_staff(&adm, "X".into(), "2nd Floor".into()).await.unwrap();
    let y = eng.register_staff(&adm, "Y".into(), "2nd Floor".into()).await.unwrap();
    let expected = x.min(y);

    let rep = eng
        .file_report(&op, "Plumbing".into(), "2nd Floor".into(), "201".into(), "".into(), at(8))
        .await
        .unwrap();
    assert_eq!(rep.assigned_to, Some(expected));
}

#[tokio::test]
async fn balancer_is_floor_scoped() {
    let eng = engine("balancer_floor.wal");
    let adm = admin();
    let op = staff();

    // Idle staff on the wrong floor must never be picked
    eng.register_staff(&adm, "Idle".into(), "3rd Floor".into()).await.unwrap();
    let busy = eng.register_staff(&adm, "Busy".into(), "2nd Floor".into()).await.unwrap();
    let rep = eng
        .file_report(&op, "HVAC".into(), "2nd Floor".into(), "201".into(), "".into(), at(8))
        .await
        .unwrap();
    eng.assign_report(&op, rep.id, busy).await.unwrap();

    let rep = eng
        .file_report(&op, "HVAC".into(), "2nd Floor".into(), "202".into(), "".into(), at(9))
        .await
        .unwrap();
    assert_eq!(rep.assigned_to, Some(busy));

    // Manual assignment across floors is refused
    let idle_3rd = eng.list_staff(Some("3rd Floor"))[0].id;
    assert!(matches!(
        eng.assign_report(&op, rep.id, idle_3rd).await.unwrap_err(),
        EngineError::Validation(_)
    ));
}

#[tokio::test]
async fn report_without_floor_staff_stays_unassigned() {
    let eng = engine("balancer_none.wal");
    let rep = eng
        .file_report(&requester(), "Window".into(), "4th Floor".into(), "401".into(), "stuck".into(), at(8))
        .await
        .unwrap();
    assert_eq!(rep.assigned_to, None);
    assert!(rep.note.as_deref().unwrap().contains("4th Floor"));
    assert_eq!(rep.status, ReportStatus::Pending);
}

#[tokio::test]
async fn report_lifecycle() {
    let eng = engine("report_lifecycle.wal");
    let adm = admin();
    let op = staff();

    eng.register_staff(&adm, "Dana".into(), "2nd Floor".into()).await.unwrap();
    let rep = eng
        .file_report(&op, "HVAC".into(), "2nd Floor".into(), "201".into(), "no heat".into(), at(8))
        .await
        .unwrap();

    assert_ok!(eng.start_report(&op, rep.id).await);
    assert_eq!(eng.get_report(&rep.id).unwrap().status, ReportStatus::InProgress);

    // Resolved reports leave the workload
    assert_ok!(eng.resolve_report(&op, rep.id, "replaced thermostat".into(), at(10)).await);
    let r = eng.get_report(&rep.id).unwrap();
    assert_eq!(r.status, ReportStatus::Resolved);
    assert_eq!(r.resolved_at, Some(at(10)));
    assert_eq!(r.action_taken.as_deref(), Some("replaced thermostat"));
    assert_eq!(eng.workloads(Some("2nd Floor"))[0].active_reports, 0);

    // Can't resolve twice, can't start a resolved report
    assert_err!(eng.resolve_report(&op, rep.id, "again".into(), at(11)).await);
    assert_err!(eng.start_report(&op, rep.id).await);

    // Archiving is admin-only and requires Resolved
    assert_err!(eng.archive_report(&op, rep.id).await);
    assert_ok!(eng.archive_report(&adm, rep.id).await);
}

// ── Queries ────────────────────────────────────────────────

#[tokio::test]
async fn window_queries() {
    let eng = engine("queries.wal");
    let adm = admin();
    let op = staff();
    let room = room_201(&eng, &adm).await;

    let a = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    eng.create_reservation(&requester(), room, vec![], Span::new(at(14), at(15)), at(8))
        .await
        .unwrap();
    assert_ok!(eng.approve_reservation(a, &op, at(8)).await);

    // Both show in the schedule regardless of status
    let all = eng
        .reservations_in_window(room, Span::new(at(8), at(16)))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    // Only the approved one blocks availability
    let free = eng
        .room_free_windows(room, Span::new(at(8), at(12)))
        .await
        .unwrap();
    assert_eq!(free, vec![Span::new(at(8), at(9)), Span::new(at(10), at(12))]);
}

// ── Overdue sweep ──────────────────────────────────────────

#[tokio::test]
async fn sweep_completes_overdue_but_spares_extended() {
    let eng = engine("sweep.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();
    let bob = requester();
    let room = room_201(&eng, &adm).await;
    let room2 = eng
        .register_room(&adm, "202".into(), "2nd Floor".into())
        .await
        .unwrap();

    let plain = eng
        .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    let extended = eng
        .create_reservation(&bob, room2, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    for id in [plain, extended] {
        assert_ok!(eng.approve_reservation(id, &op, at(8)).await);
        assert_ok!(eng.start_reservation(id, &op, at(9)).await);
    }
    assert_ok!(eng.request_extension(&bob, extended, "".into(), at(9)).await);
    assert_ok!(eng.decide_extension(extended, &op, true, at(9)).await);

    // Past both scheduled ends
    let overdue = eng.collect_overdue(at(10) + 5 * M);
    assert_eq!(overdue, vec![(plain, room)]);

    assert!(eng.sweep_end(plain, room, at(10) + 5 * M).await.unwrap());
    assert_eq!(
        eng.get_reservation(&plain).await.unwrap().status,
        ReservationStatus::Completed
    );
    // Second sweep of the same record is a no-op
    assert!(!eng.sweep_end(plain, room, at(10) + 6 * M).await.unwrap());

    // The extended session is never swept
    assert_eq!(
        eng.get_reservation(&extended).await.unwrap().status,
        ReservationStatus::Ongoing
    );

    // Retention archival
    let due = eng.collect_archivable(at(10) + 5 * M + 1000, 1000);
    assert_eq!(due, vec![(plain, room)]);
    assert!(eng.sweep_archive(plain, room, at(11)).await.unwrap());
}

// ── Durability ─────────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_full_state() {
    let path = test_wal_path("replay_state.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();

    let (room, res, staff_id, report_id);
    {
        let eng = engine_at(&path);
        room = room_201(&eng, &adm).await;
        res = eng
            .create_reservation(&alice, room, vec![Participant::Guest("visitor".into())], Span::new(at(9), at(10)), at(8))
            .await
            .unwrap();
        eng.approve_reservation(res, &op, at(8)).await.unwrap();
        eng.start_reservation(res, &op, at(9)).await.unwrap();
        eng.request_extension(&alice, res, "demo overrun".into(), at(9)).await.unwrap();
        eng.decide_extension(res, &op, true, at(9)).await.unwrap();

        staff_id = eng.register_staff(&adm, "Dana".into(), "2nd Floor".into()).await.unwrap();
        report_id = eng
            .file_report(&op, "HVAC".into(), "2nd Floor".into(), "201".into(), "".into(), at(8))
            .await
            .unwrap()
            .id;
    }

    // Fresh engine over the same WAL — `engine_at` only truncates via
    // test_wal_path, which was called once above
    let eng2 = engine_at(&path);
    assert_eq!(eng2.room_id_by_label("201"), Some(room));
    let r = eng2.get_reservation(&res).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Ongoing);
    assert_eq!(r.extension_status, ExtensionStatus::Approved);
    assert_eq!(r.extension_reason.as_deref(), Some("demo overrun"));
    assert_eq!(r.participants, vec![Participant::Guest("visitor".into())]);
    assert_eq!(eng2.list_staff(None)[0].id, staff_id);
    assert_eq!(eng2.get_report(&report_id).unwrap().assigned_to, Some(staff_id));
}

#[tokio::test]
async fn compaction_drops_archived_records() {
    let path = test_wal_path("compact_archived.wal");
    let adm = admin();
    let op = staff();
    let alice = requester();

    let (room, old, fresh);
    {
        let eng = engine_at(&path);
        room = room_201(&eng, &adm).await;

        old = eng
            .create_reservation(&alice, room, vec![], Span::new(at(9), at(10)), at(8))
            .await
            .unwrap();
        eng.approve_reservation(old, &op, at(8)).await.unwrap();
        eng.start_reservation(old, &op, at(9)).await.unwrap();
        eng.end_reservation(old, &alice, at(10)).await.unwrap();
        eng.archive_reservation(old, &adm, at(11)).await.unwrap();

        fresh = eng
            .create_reservation(&alice, room, vec![], Span::new(at(14), at(15)), at(12))
            .await
            .unwrap();

        assert!(eng.wal_appends_since_compact().await > 0);
        eng.compact_wal().await.unwrap();
        assert_eq!(eng.wal_appends_since_compact().await, 0);
    }

    let eng2 = engine_at(&path);
    // The archived record is gone; the live one survived with full fidelity
    assert!(eng2.get_reservation(&old).await.is_err());
    let r = eng2.get_reservation(&fresh).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.span, Span::new(at(14), at(15)));
}

#[tokio::test]
async fn compaction_keeps_writes_committed_mid_snapshot() {
    // Drives the writer task directly: an append that lands between the
    // snapshot cut and the Compact command is acknowledged against the old
    // file and must survive the rewrite.
    let path = test_wal_path("compact_cut.wal");
    let wal = Wal::open(&path).unwrap();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(wal_writer_loop(wal, rx));

    async fn append(tx: &mpsc::Sender<WalCommand>, event: Event) {
        let (rtx, rrx) = oneshot::channel();
        tx.send(WalCommand::Append { event, response: rtx }).await.unwrap();
        rrx.await.unwrap().unwrap();
    }

    let room_id = Ulid::new();
    let pending =
        Reservation::new(Ulid::new(), Ulid::new(), vec![], Span::new(at(9), at(10)), at(8));
    let room_event = Event::RoomRegistered {
        id: room_id,
        room: "201".into(),
        floor: "2nd Floor".into(),
    };
    append(&tx, room_event.clone()).await;

    let (cut_tx, cut_rx) = oneshot::channel();
    tx.send(WalCommand::BeginCompact { response: cut_tx }).await.unwrap();
    cut_rx.await.unwrap();

    // Commits and is acknowledged while the snapshot is being assembled
    let approval = Event::ReservationApproved {
        id: pending.id,
        room_id,
        at: at(8),
    };
    append(&tx, approval.clone()).await;

    // The snapshot reflects the pre-approval state
    let snapshot = vec![
        room_event,
        Event::ReservationSnapshot {
            room_id,
            reservation: pending,
        },
    ];
    let (ctx, crx) = oneshot::channel();
    tx.send(WalCommand::Compact { events: snapshot, response: ctx }).await.unwrap();
    crx.await.unwrap().unwrap();
    drop(tx);

    let replayed = Wal::replay(&path).unwrap();
    assert!(replayed.contains(&approval));
}

#[tokio::test]
async fn replay_tolerates_events_already_in_a_snapshot() {
    // A transition that commits while a snapshot is read can end up both in
    // the snapshot and in the re-appended tail; replay must not double-apply.
    let path = test_wal_path("replay_dup.wal");
    let room_id = Ulid::new();
    let mut res =
        Reservation::new(Ulid::new(), Ulid::new(), vec![], Span::new(at(9), at(10)), at(8));
    res.status = ReservationStatus::Approved;
    let room_event = Event::RoomRegistered {
        id: room_id,
        room: "201".into(),
        floor: "2nd Floor".into(),
    };
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_event).unwrap();
        wal.append(&Event::ReservationSnapshot { room_id, reservation: res.clone() }).unwrap();
        // Tail repeats what the snapshot already reflects
        wal.append(&room_event).unwrap();
        wal.append(&Event::ReservationRequested {
            id: res.id,
            room_id,
            requester: res.requester,
            participants: vec![],
            span: res.span,
            at: at(8),
        })
        .unwrap();
        wal.append(&Event::ReservationApproved { id: res.id, room_id, at: at(8) }).unwrap();
    }

    let eng = engine_at(&path);
    let r = eng.get_reservation(&res.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    // Exactly one copy on the schedule
    let window = eng
        .reservations_in_window(room_id, Span::new(at(8), at(11)))
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
}

// ── Notifications ──────────────────────────────────────────

#[tokio::test]
async fn lifecycle_events_reach_room_subscribers() {
    let notify = Arc::new(NotifyHub::new());
    let eng = Arc::new(
        Engine::new(test_wal_path("notify_events.wal"), notify.clone()).unwrap(),
    );
    let adm = admin();
    let op = staff();
    let room = room_201(&eng, &adm).await;

    let mut rx = notify.subscribe(room);
    let res = eng
        .create_reservation(&requester(), room, vec![], Span::new(at(9), at(10)), at(8))
        .await
        .unwrap();
    eng.approve_reservation(res, &op, at(8)).await.unwrap();

    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::ReservationRequested { id, .. } if id == res
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::ReservationApproved { id, .. } if id == res
    ));
}

#[tokio::test]
async fn assignment_events_reach_staff_subscribers() {
    let notify = Arc::new(NotifyHub::new());
    let eng = Arc::new(
        Engine::new(test_wal_path("notify_assign.wal"), notify.clone()).unwrap(),
    );
    let adm = admin();
    let op = staff();

    let dana = eng.register_staff(&adm, "Dana".into(), "2nd Floor".into()).await.unwrap();
    let mut rx = notify.subscribe(dana);

    let rep = eng
        .file_report(&op, "HVAC".into(), "2nd Floor".into(), "201".into(), "".into(), at(8))
        .await
        .unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::ReportFiled { report } if report.id == rep.id
    ));
}
