use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use super::*;
use crate::collab::{CollabError, Collaborators, GuestMailer, LoyaltyProgram, NoopMailer};
use crate::notify::{AvailabilityChange, Notice, NotifyHub, Topic};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("vacancy_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
}

fn stay(a: u32, b: u32) -> StaySpan {
    StaySpan::new(day(a), day(b))
}

fn new_engine(name: &str) -> Engine {
    Engine::new(
        test_wal_path(name),
        Arc::new(NotifyHub::new()),
        Collaborators::noop(),
    )
    .unwrap()
}

fn new_engine_with(name: &str, collab: Arc<Collaborators>) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), collab).unwrap()
}

/// Register a property with one capacity-2 room at 100.00/night.
async fn setup_room(engine: &Engine) -> (Ulid, Ulid) {
    let property = Ulid::new();
    engine
        .register_property(property, "Seaside Hotel".into())
        .await
        .unwrap();
    let room = Ulid::new();
    engine
        .register_room(room, property, Some("101".into()), 2, 10_000)
        .await
        .unwrap();
    (property, room)
}

fn request(guest: Ulid, room: Ulid, a: u32, b: u32, guests: u32) -> NewReservation {
    NewReservation {
        guest_id: guest,
        room_id: room,
        stay: stay(a, b),
        guests,
        notes: None,
    }
}

// ── Creation protocol ────────────────────────────────────

#[tokio::test]
async fn create_computes_totals_and_roundtrips() {
    let engine = new_engine("create_roundtrip.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 2))
        .await
        .unwrap();

    assert_eq!(reservation.status, ReservationStatus::Pending);
    assert_eq!(reservation.nights(), 2);
    assert_eq!(reservation.nightly_rate, 10_000);
    assert_eq!(reservation.total_price, 20_000);
    assert_eq!(reservation.code.len(), crate::limits::CODE_LEN);

    let by_id = engine.get_reservation(&reservation.id).await.unwrap();
    let by_code = engine
        .get_reservation_by_code(&reservation.code)
        .await
        .unwrap();
    assert_eq!(by_id, reservation);
    assert_eq!(by_code, reservation);
}

#[tokio::test]
async fn create_rejects_inverted_interval() {
    let engine = new_engine("inverted_interval.wal");
    let (_, room) = setup_room(&engine).await;

    let bad = NewReservation {
        guest_id: Ulid::new(),
        room_id: room,
        stay: StaySpan {
            check_in: day(5),
            check_out: day(5),
        },
        guests: 1,
        notes: None,
    };
    assert!(matches!(
        engine.create_reservation(bad).await,
        Err(EngineError::Invalid(_))
    ));

    let reversed = NewReservation {
        guest_id: Ulid::new(),
        room_id: room,
        stay: StaySpan {
            check_in: day(8),
            check_out: day(5),
        },
        guests: 1,
        notes: None,
    };
    assert!(matches!(
        engine.create_reservation(reversed).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn create_rejects_zero_guests() {
    let engine = new_engine("zero_guests.wal");
    let (_, room) = setup_room(&engine).await;
    let result = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 0))
        .await;
    assert!(matches!(result, Err(EngineError::Invalid(_))));
}

#[tokio::test]
async fn create_rejects_unknown_room() {
    let engine = new_engine("unknown_room.wal");
    let result = engine
        .create_reservation(request(Ulid::new(), Ulid::new(), 1, 3, 1))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn capacity_violation_fails_before_any_write() {
    let engine = new_engine("capacity_fail_fast.wal");
    let (_, room) = setup_room(&engine).await;

    // capacity 2, 3 guests
    let result = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 3))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::CapacityExceeded {
            guests: 3,
            capacity: 2
        })
    ));

    // no row written, the dates stay bookable
    assert!(engine.reservations_for_room(room).await.unwrap().is_empty());
    let ok = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 2))
        .await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn overlap_scenario_from_the_brochure() {
    // capacity-2 room at 100.00/night: book [01,03), overlap [02,04) fails,
    // back-to-back [03,05) succeeds
    let engine = new_engine("overlap_scenario.wal");
    let (_, room) = setup_room(&engine).await;

    let first = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 2))
        .await
        .unwrap();
    assert_eq!(first.nights(), 2);
    assert_eq!(first.total_price, 20_000);

    let overlapping = engine
        .create_reservation(request(Ulid::new(), room, 2, 4, 1))
        .await;
    match overlapping {
        Err(EngineError::NotAvailable { conflicts }) => {
            assert_eq!(conflicts, vec![first.id]);
        }
        other => panic!("expected NotAvailable, got {other:?}"),
    }

    let adjacent = engine
        .create_reservation(request(Ulid::new(), room, 3, 5, 1))
        .await;
    assert!(adjacent.is_ok());
}

#[tokio::test]
async fn half_open_semantics() {
    let engine = new_engine("half_open.wal");
    let (_, room) = setup_room(&engine).await;

    engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 1))
        .await
        .unwrap();
    // same-day turnover is not an overlap
    engine
        .create_reservation(request(Ulid::new(), room, 3, 5, 1))
        .await
        .unwrap();
    // one shared night is
    assert!(matches!(
        engine
            .create_reservation(request(Ulid::new(), room, 2, 4, 1))
            .await,
        Err(EngineError::NotAvailable { .. })
    ));
}

#[tokio::test]
async fn cancelled_records_do_not_conflict() {
    let engine = new_engine("cancelled_no_conflict.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let first = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .cancel_reservation(first.id, guest, None)
        .await
        .unwrap();

    assert!(
        engine
            .create_reservation(request(Ulid::new(), room, 1, 3, 1))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn checked_out_records_do_not_conflict() {
    let engine = new_engine("checked_out_no_conflict.wal");
    let (_, room) = setup_room(&engine).await;

    let first = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .set_reservation_status(first.id, ReservationStatus::CheckedOut, None)
        .await
        .unwrap();

    assert!(
        engine
            .create_reservation(request(Ulid::new(), room, 1, 3, 1))
            .await
            .is_ok()
    );
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_commit_exactly_one() {
    let engine = Arc::new(new_engine("race_one_winner.wal"));
    let (_, room) = setup_room(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(request(Ulid::new(), room, 1, 3, 1))
                .await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(EngineError::NotAvailable { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 15);

    // and exactly one holding record exists
    let holds: Vec<_> = engine
        .reservations_for_room(room)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status.holds_room())
        .collect();
    assert_eq!(holds.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_intervals_race_freely() {
    let engine = Arc::new(new_engine("race_disjoint.wal"));
    let (_, room) = setup_room(&engine).await;

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = 1 + i * 3;
            engine
                .create_reservation(request(Ulid::new(), room, start, start + 2, 1))
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn held_lock_surfaces_busy_not_deadlock() {
    let engine = Arc::new(new_engine("busy_timeout.wal"));
    let (_, room) = setup_room(&engine).await;

    let state = engine.get_room(&room).unwrap();
    let _guard = state.clone().write_owned().await; // someone else mid-commit

    let result = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 1))
        .await;
    assert!(matches!(result, Err(EngineError::Busy(id)) if id == room));
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_stamps_reason_and_frees_dates() {
    let engine = new_engine("cancel_frees.wal");
    let (property, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 2))
        .await
        .unwrap();

    let before = engine
        .property_availability(property, &stay(1, 3))
        .await
        .unwrap();
    assert_eq!(before.available, 0);

    let cancelled = engine
        .cancel_reservation(reservation.id, guest, Some("plans changed".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("plans changed"));
    assert!(cancelled.cancelled_at.is_some());

    let after = engine
        .property_availability(property, &stay(1, 3))
        .await
        .unwrap();
    assert_eq!(after.available, 1);
    assert_eq!(after.available_rooms, vec![room]);
}

#[tokio::test]
async fn cancel_by_non_owner_reads_as_missing() {
    let engine = new_engine("cancel_wrong_owner.wal");
    let (_, room) = setup_room(&engine).await;
    let owner = Ulid::new();

    let reservation = engine
        .create_reservation(request(owner, room, 1, 3, 1))
        .await
        .unwrap();

    let intruder = Ulid::new();
    let result = engine.cancel_reservation(reservation.id, intruder, None).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    // untouched
    let still_there = engine.get_reservation(&reservation.id).await.unwrap();
    assert_eq!(still_there.status, ReservationStatus::Pending);
}

#[tokio::test]
async fn cancel_twice_always_fails() {
    let engine = new_engine("cancel_twice.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .cancel_reservation(reservation.id, guest, None)
        .await
        .unwrap();

    let again = engine.cancel_reservation(reservation.id, guest, None).await;
    assert!(matches!(
        again,
        Err(EngineError::NotCancellable(ReservationStatus::Cancelled))
    ));
}

#[tokio::test]
async fn cancel_after_check_in_fails_with_current_status() {
    let engine = new_engine("cancel_checked_in.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .set_reservation_status(reservation.id, ReservationStatus::CheckedIn, None)
        .await
        .unwrap();

    let result = engine.cancel_reservation(reservation.id, guest, None).await;
    assert!(matches!(
        result,
        Err(EngineError::NotCancellable(ReservationStatus::CheckedIn))
    ));
}

#[tokio::test]
async fn cancel_unknown_reservation_not_found() {
    let engine = new_engine("cancel_unknown.wal");
    setup_room(&engine).await;
    let result = engine
        .cancel_reservation(Ulid::new(), Ulid::new(), None)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

// ── Price snapshot ───────────────────────────────────────

#[tokio::test]
async fn rate_changes_never_touch_existing_reservations() {
    let engine = new_engine("price_snapshot.wal");
    let (_, room) = setup_room(&engine).await;

    let before = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 1))
        .await
        .unwrap();
    assert_eq!(before.nightly_rate, 10_000);

    engine
        .update_room(room, Some("101".into()), 2, 15_000)
        .await
        .unwrap();

    let unchanged = engine.get_reservation(&before.id).await.unwrap();
    assert_eq!(unchanged.nightly_rate, 10_000);
    assert_eq!(unchanged.total_price, 20_000);

    let after = engine
        .create_reservation(request(Ulid::new(), room, 5, 7, 1))
        .await
        .unwrap();
    assert_eq!(after.nightly_rate, 15_000);
    assert_eq!(after.total_price, 30_000);
}

// ── Administrative transitions ───────────────────────────

#[tokio::test]
async fn admin_path_is_deliberately_permissive() {
    let engine = new_engine("admin_permissive.wal");
    let (property, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .cancel_reservation(reservation.id, guest, None)
        .await
        .unwrap();

    // Back from the dead — no transition table on the admin path
    let revived = engine
        .set_reservation_status(reservation.id, ReservationStatus::Confirmed, None)
        .await
        .unwrap();
    assert_eq!(revived.status, ReservationStatus::Confirmed);

    // and it holds the room again
    let report = engine
        .property_availability(property, &stay(1, 3))
        .await
        .unwrap();
    assert_eq!(report.available, 0);
}

struct CountingLoyalty(Arc<AtomicUsize>);

#[async_trait]
impl LoyaltyProgram for CountingLoyalty {
    async fn accrue_stay(&self, _r: &Reservation) -> Result<(), CollabError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingLoyalty;

#[async_trait]
impl LoyaltyProgram for FailingLoyalty {
    async fn accrue_stay(&self, _r: &Reservation) -> Result<(), CollabError> {
        Err("ledger offline".into())
    }
}

struct FailingMailer;

#[async_trait]
impl GuestMailer for FailingMailer {
    async fn reservation_created(&self, _r: &Reservation) -> Result<(), CollabError> {
        Err("smtp down".into())
    }

    async fn reservation_cancelled(&self, _r: &Reservation) -> Result<(), CollabError> {
        Err("smtp down".into())
    }
}

#[tokio::test]
async fn checkout_accrues_loyalty_exactly_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let collab = Collaborators::new(
        Arc::new(CountingLoyalty(calls.clone())),
        Arc::new(NoopMailer),
    );
    let engine = new_engine_with("loyalty_once.wal", collab);
    let (_, room) = setup_room(&engine).await;

    let reservation = engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .set_reservation_status(reservation.id, ReservationStatus::CheckedIn, None)
        .await
        .unwrap();
    engine
        .set_reservation_status(reservation.id, ReservationStatus::CheckedOut, None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // re-applying checked-out does not accrue again
    engine
        .set_reservation_status(reservation.id, ReservationStatus::CheckedOut, None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn collaborator_failures_never_fail_the_operation() {
    let collab = Collaborators::new(Arc::new(FailingLoyalty), Arc::new(FailingMailer));
    let engine = new_engine_with("collab_failures.wal", collab);
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .expect("create must succeed despite failing mailer");
    engine
        .set_reservation_status(reservation.id, ReservationStatus::CheckedOut, None)
        .await
        .expect("status update must succeed despite failing loyalty");

    let second = engine
        .create_reservation(request(guest, room, 5, 7, 1))
        .await
        .unwrap();
    engine
        .cancel_reservation(second.id, guest, None)
        .await
        .expect("cancel must succeed despite failing mailer");
}

// ── Availability queries ─────────────────────────────────

#[tokio::test]
async fn availability_counts_rooms_of_the_property() {
    let engine = new_engine("availability_counts.wal");
    let property = Ulid::new();
    engine
        .register_property(property, "Seaside Hotel".into())
        .await
        .unwrap();
    let room_a = Ulid::new();
    let room_b = Ulid::new();
    engine
        .register_room(room_a, property, Some("101".into()), 2, 10_000)
        .await
        .unwrap();
    engine
        .register_room(room_b, property, Some("102".into()), 2, 12_000)
        .await
        .unwrap();

    engine
        .create_reservation(request(Ulid::new(), room_a, 1, 3, 1))
        .await
        .unwrap();

    let report = engine
        .availability_for_room(room_a, stay(1, 3))
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.available, 1);
    assert_eq!(report.available_rooms, vec![room_b]);

    // outside the booked window both rooms are free
    let later = engine
        .availability_for_room(room_a, stay(10, 12))
        .await
        .unwrap();
    assert_eq!(later.available, 2);
}

#[tokio::test]
async fn free_nights_subtract_holding_stays() {
    let engine = new_engine("free_nights.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    engine
        .create_reservation(request(guest, room, 5, 8, 1))
        .await
        .unwrap();
    let cancelled = engine
        .create_reservation(request(guest, room, 12, 14, 1))
        .await
        .unwrap();
    engine
        .cancel_reservation(cancelled.id, guest, None)
        .await
        .unwrap();

    let free = engine.free_nights(room, stay(1, 20)).await.unwrap();
    assert_eq!(free, vec![stay(1, 5), stay(8, 20)]);
}

#[tokio::test]
async fn sold_out_spans_cover_full_occupancy() {
    let engine = new_engine("sold_out.wal");
    let property = Ulid::new();
    engine
        .register_property(property, "Seaside Hotel".into())
        .await
        .unwrap();
    let room_a = Ulid::new();
    let room_b = Ulid::new();
    engine
        .register_room(room_a, property, None, 2, 10_000)
        .await
        .unwrap();
    engine
        .register_room(room_b, property, None, 2, 10_000)
        .await
        .unwrap();

    engine
        .create_reservation(request(Ulid::new(), room_a, 1, 10, 1))
        .await
        .unwrap();
    engine
        .create_reservation(request(Ulid::new(), room_b, 5, 15, 1))
        .await
        .unwrap();

    let sold_out = engine
        .property_sold_out(property, stay(1, 20))
        .await
        .unwrap();
    assert_eq!(sold_out, vec![stay(5, 10)]);
}

#[tokio::test]
async fn window_validation_rejects_absurd_queries() {
    let engine = new_engine("window_validation.wal");
    let (property, room) = setup_room(&engine).await;

    let inverted = StaySpan {
        check_in: day(5),
        check_out: day(5),
    };
    assert!(matches!(
        engine.property_availability(property, &inverted).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.free_nights(room, inverted).await,
        Err(EngineError::Invalid(_))
    ));
}

// ── Store lookups ────────────────────────────────────────

#[tokio::test]
async fn guest_and_range_lookups() {
    let engine = new_engine("lookups.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let first = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    let second = engine
        .create_reservation(request(guest, room, 10, 12, 1))
        .await
        .unwrap();
    engine
        .create_reservation(request(Ulid::new(), room, 5, 7, 1))
        .await
        .unwrap();

    let mine = engine.reservations_for_guest(guest).await;
    assert_eq!(
        mine.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    let in_range = engine
        .reservations_in_range(room, stay(9, 20))
        .await
        .unwrap();
    assert_eq!(in_range.len(), 1);
    assert_eq!(in_range[0].id, second.id);

    let unknown_code = engine.get_reservation_by_code("ZZZZZZZZ").await;
    assert!(matches!(unknown_code, Err(EngineError::UnknownCode(_))));
}

#[tokio::test]
async fn reference_codes_are_unique() {
    let engine = new_engine("unique_codes.wal");
    let (_, room) = setup_room(&engine).await;

    let mut codes = std::collections::HashSet::new();
    for i in 0..40u32 {
        let start = 1 + i * 2;
        let r = engine
            .create_reservation(NewReservation {
                guest_id: Ulid::new(),
                room_id: room,
                stay: StaySpan {
                    check_in: day(1) + chrono::Days::new((start * 3) as u64),
                    check_out: day(1) + chrono::Days::new((start * 3 + 2) as u64),
                },
                guests: 1,
                notes: None,
            })
            .await
            .unwrap();
        assert!(codes.insert(r.code.clone()), "duplicate code {}", r.code);
    }
}

// ── Rooms and properties ─────────────────────────────────

#[tokio::test]
async fn room_registration_guards() {
    let engine = new_engine("room_guards.wal");
    let property = Ulid::new();
    engine
        .register_property(property, "Seaside Hotel".into())
        .await
        .unwrap();

    // unknown property
    assert!(matches!(
        engine
            .register_room(Ulid::new(), Ulid::new(), None, 2, 10_000)
            .await,
        Err(EngineError::NotFound(_))
    ));

    // duplicate id
    let room = Ulid::new();
    engine
        .register_room(room, property, None, 2, 10_000)
        .await
        .unwrap();
    assert!(matches!(
        engine.register_room(room, property, None, 2, 10_000).await,
        Err(EngineError::AlreadyExists(_))
    ));

    // zero capacity, negative rate
    assert!(matches!(
        engine
            .register_room(Ulid::new(), property, None, 0, 10_000)
            .await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.register_room(Ulid::new(), property, None, 2, -1).await,
        Err(EngineError::Invalid(_))
    ));

    // duplicate property
    assert!(matches!(
        engine.register_property(property, "Again".into()).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn retire_room_requires_no_active_holds() {
    let engine = new_engine("retire_room.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    assert!(matches!(
        engine.retire_room(room).await,
        Err(EngineError::HasReservations(_))
    ));

    engine
        .cancel_reservation(reservation.id, guest, None)
        .await
        .unwrap();
    engine.retire_room(room).await.unwrap();

    assert!(engine.get_room(&room).is_none());
    assert!(matches!(
        engine.get_reservation(&reservation.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn remove_property_requires_no_rooms() {
    let engine = new_engine("remove_property.wal");
    let (property, room) = setup_room(&engine).await;

    assert!(matches!(
        engine.remove_property(property).await,
        Err(EngineError::HasRooms(_))
    ));
    engine.retire_room(room).await.unwrap();
    engine.remove_property(property).await.unwrap();
    assert!(engine.list_properties().is_empty());
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn create_broadcasts_booked_with_fresh_count() {
    let engine = new_engine("notify_booked.wal");
    let (property, room) = setup_room(&engine).await;

    let mut room_rx = engine.notify.subscribe(Topic::Room(room));
    let mut property_rx = engine.notify.subscribe(Topic::Property(property));

    engine
        .create_reservation(request(Ulid::new(), room, 1, 3, 1))
        .await
        .unwrap();

    for rx in [&mut room_rx, &mut property_rx] {
        match rx.recv().await.unwrap() {
            Notice::AvailabilityChanged {
                change,
                available,
                total,
                ..
            } => {
                assert_eq!(change, AvailabilityChange::Booked);
                assert_eq!(available, 0);
                assert_eq!(total, 1);
            }
            other => panic!("expected AvailabilityChanged, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn guest_channel_carries_lifecycle_notices() {
    let engine = new_engine("notify_guest.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let mut guest_rx = engine.notify.subscribe(Topic::Guest(guest));

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    match guest_rx.recv().await.unwrap() {
        Notice::ReservationCreated { id, code, .. } => {
            assert_eq!(id, reservation.id);
            assert_eq!(code, reservation.code);
        }
        other => panic!("expected ReservationCreated, got {other:?}"),
    }

    engine
        .cancel_reservation(reservation.id, guest, Some("plans changed".into()))
        .await
        .unwrap();
    match guest_rx.recv().await.unwrap() {
        Notice::ReservationCancelled { id, reason, .. } => {
            assert_eq!(id, reservation.id);
            assert_eq!(reason.as_deref(), Some("plans changed"));
        }
        other => panic!("expected ReservationCancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_broadcasts_freed() {
    let engine = new_engine("notify_freed.wal");
    let (_, room) = setup_room(&engine).await;
    let guest = Ulid::new();

    let reservation = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();

    let mut room_rx = engine.notify.subscribe(Topic::Room(room));
    engine
        .cancel_reservation(reservation.id, guest, None)
        .await
        .unwrap();

    match room_rx.recv().await.unwrap() {
        Notice::AvailabilityChanged {
            change, available, ..
        } => {
            assert_eq!(change, AvailabilityChange::Freed);
            assert_eq!(available, 1);
        }
        other => panic!("expected AvailabilityChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn refresh_republishes_without_a_write() {
    let engine = new_engine("notify_refresh.wal");
    let (_, room) = setup_room(&engine).await;

    let mut room_rx = engine.notify.subscribe(Topic::Room(room));
    engine.refresh_availability(room, stay(1, 5)).await.unwrap();

    match room_rx.recv().await.unwrap() {
        Notice::AvailabilityChanged {
            change,
            available,
            total,
            stay: window,
            ..
        } => {
            assert_eq!(change, AvailabilityChange::Refreshed);
            assert_eq!(available, 1);
            assert_eq!(total, 1);
            assert_eq!(window, stay(1, 5));
        }
        other => panic!("expected AvailabilityChanged, got {other:?}"),
    }

    assert!(engine.reservations_for_room(room).await.unwrap().is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_reservations_and_indexes() {
    let path = test_wal_path("replay_restore.wal");
    let guest = Ulid::new();
    let property = Ulid::new();
    let room = Ulid::new();

    let (kept_id, kept_code, cancelled_id) = {
        let engine = Engine::new(
            path.clone(),
            Arc::new(NotifyHub::new()),
            Collaborators::noop(),
        )
        .unwrap();
        engine
            .register_property(property, "Seaside Hotel".into())
            .await
            .unwrap();
        engine
            .register_room(room, property, Some("101".into()), 2, 10_000)
            .await
            .unwrap();

        let kept = engine
            .create_reservation(request(guest, room, 1, 3, 2))
            .await
            .unwrap();
        engine
            .set_reservation_status(kept.id, ReservationStatus::Confirmed, None)
            .await
            .unwrap();
        let doomed = engine
            .create_reservation(request(guest, room, 5, 7, 1))
            .await
            .unwrap();
        engine
            .cancel_reservation(doomed.id, guest, Some("plans changed".into()))
            .await
            .unwrap();

        (kept.id, kept.code, doomed.id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), Collaborators::noop()).unwrap();

    let kept = engine.get_reservation(&kept_id).await.unwrap();
    assert_eq!(kept.status, ReservationStatus::Confirmed);
    assert_eq!(kept.total_price, 20_000);
    assert_eq!(
        engine.get_reservation_by_code(&kept_code).await.unwrap().id,
        kept_id
    );

    let cancelled = engine.get_reservation(&cancelled_id).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("plans changed"));

    // overlap enforcement survives the restart
    assert!(matches!(
        engine
            .create_reservation(request(Ulid::new(), room, 2, 4, 1))
            .await,
        Err(EngineError::NotAvailable { .. })
    ));
    // the cancelled window is open
    assert!(
        engine
            .create_reservation(request(Ulid::new(), room, 5, 7, 1))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_preserve.wal");
    let guest = Ulid::new();
    let property = Ulid::new();
    let room = Ulid::new();

    let engine = Engine::new(
        path.clone(),
        Arc::new(NotifyHub::new()),
        Collaborators::noop(),
    )
    .unwrap();
    engine
        .register_property(property, "Seaside Hotel".into())
        .await
        .unwrap();
    engine
        .register_room(room, property, None, 2, 10_000)
        .await
        .unwrap();
    let kept = engine
        .create_reservation(request(guest, room, 1, 3, 1))
        .await
        .unwrap();
    engine
        .set_reservation_status(kept.id, ReservationStatus::CheckedIn, None)
        .await
        .unwrap();

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), Collaborators::noop()).unwrap();
    let restored = engine.get_reservation(&kept.id).await.unwrap();
    assert_eq!(restored.status, ReservationStatus::CheckedIn);
    assert_eq!(restored.code, kept.code);
    assert!(matches!(
        engine
            .create_reservation(request(Ulid::new(), room, 1, 3, 1))
            .await,
        Err(EngineError::NotAvailable { .. })
    ));
}
