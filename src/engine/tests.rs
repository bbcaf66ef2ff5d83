use super::*;
use crate::audit::TimelineFilter;
use crate::calendar::MemoryCalendar;
use crate::limits::MAX_TIMELINE_LIMIT;
use crate::notify::Notification;
use chrono::NaiveDate;
use std::time::Duration;

// ── Fixtures ─────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Far enough ahead that cancellations are never late.
fn future_day() -> NaiveDate {
    date(2099, 6, 1)
}

fn room(id: &str) -> Resource {
    Resource {
        id: id.into(),
        name: format!("Room {id}"),
        kind: ResourceKind::Cabinet,
        location: "unbox_one".into(),
        hourly_rate: Money(2000),
        capacity: 4,
        min_booking_hours: 1,
        active: true,
    }
}

fn hhmm(s: &str) -> Minute {
    parse_hhmm(s).unwrap()
}

fn balance_booking(resource_id: &str, day: NaiveDate, start: &str, duration: Minute, price: i64) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        resource_id: resource_id.into(),
        date: day,
        start_time: hhmm(start),
        duration,
        payment_method: PaymentMethod::Balance,
        final_price: Money(price),
        format: BookingFormat::Individual,
        target_user: None,
    }
}

fn hours_booking(resource_id: &str, day: NaiveDate, start: &str, duration: Minute) -> NewBooking {
    NewBooking {
        payment_method: PaymentMethod::Subscription,
        final_price: Money::ZERO,
        ..balance_booking(resource_id, day, start, duration, 0)
    }
}

/// Engine with an owner account and resource `R1`.
async fn setup(name: &str) -> (Engine, Actor) {
    let engine = Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
    let owner = engine
        .bootstrap_owner("owner@example.com", "Owner")
        .await
        .unwrap()
        .unwrap();
    let owner = Actor::from(&owner);
    engine.create_resource(&owner, room("R1")).await.unwrap();
    (engine, owner)
}

async fn member(engine: &Engine, staff: &Actor, email: &str) -> Actor {
    let user = engine
        .register_user(Some(staff), &staff.email, Ulid::new(), email.into(), "Member".into(), Role::User)
        .await
        .unwrap();
    Actor::from(&user)
}

async fn staff(engine: &Engine, owner: &Actor, email: &str, role: Role) -> Actor {
    let user = engine
        .register_user(Some(owner), &owner.email, Ulid::new(), email.into(), "Staff".into(), role)
        .await
        .unwrap();
    Actor::from(&user)
}

async fn user_state(engine: &Engine, id: Ulid) -> User {
    engine.get_user(&id).unwrap().lock().await.clone()
}

async fn balance_of(engine: &Engine, id: Ulid) -> Money {
    user_state(engine, id).await.balance
}

async fn hours_of(engine: &Engine, id: Ulid) -> Option<Hours> {
    user_state(engine, id).await.subscription.map(|s| s.remaining)
}

fn count_events(engine: &Engine, staff: &Actor, event_type: &str) -> usize {
    engine
        .list_timeline(
            staff,
            &TimelineFilter {
                event_type: Some(event_type.into()),
                limit: MAX_TIMELINE_LIMIT,
                ..Default::default()
            },
        )
        .unwrap()
        .len()
}

// ── Conflicts ────────────────────────────────────────────

#[tokio::test]
async fn overlapping_request_rejected_abutting_accepted() {
    let (engine, owner) = setup("overlap.wal").await;
    let day = date(2025, 6, 1);
    engine.deposit(&owner, owner.id, Money(100_000)).await.unwrap();

    let first = engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();

    let err = engine
        .create_booking(&owner, balance_booking("R1", day, "10:30", 30, 1000))
        .await
        .unwrap_err();
    match err {
        EngineError::SlotConflict(desc) => {
            assert!(desc.contains(&first.id.to_string()), "{desc}");
            assert!(desc.contains("10:00-11:00"), "{desc}");
        }
        other => panic!("expected SlotConflict, got {other:?}"),
    }

    engine
        .create_booking(&owner, balance_booking("R1", day, "11:00", 30, 1000))
        .await
        .unwrap();
    engine
        .create_booking(&owner, balance_booking("R1", day, "09:00", 60, 2000))
        .await
        .unwrap();

    // Same slot, other day and other resource are independent.
    engine
        .create_booking(&owner, balance_booking("R1", date(2025, 6, 2), "10:00", 60, 2000))
        .await
        .unwrap();
    engine.create_resource(&owner, room("R2")).await.unwrap();
    engine
        .create_booking(&owner, balance_booking("R2", day, "10:00", 60, 2000))
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_booking_leaves_no_trace() {
    let (engine, owner) = setup("reject_no_trace.wal").await;
    let day = future_day();
    engine.deposit(&owner, owner.id, Money(5000)).await.unwrap();
    engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();

    let clash = balance_booking("R1", day, "10:15", 30, 1000);
    let clash_id = clash.id;
    assert!(engine.create_booking(&owner, clash).await.is_err());
    assert_eq!(balance_of(&engine, owner.id).await, Money(3000));
    assert!(engine.resource_for_booking(&clash_id).is_none());
}

#[tokio::test]
async fn cancelled_booking_frees_its_slot() {
    let (engine, owner) = setup("cancel_frees.wal").await;
    let day = future_day();
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    let b = engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();
    engine.cancel_booking(&owner, b.id, None).await.unwrap();
    engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let (engine, owner) = setup("dup_booking.wal").await;
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    let request = balance_booking("R1", future_day(), "10:00", 60, 2000);
    let again = NewBooking {
        start_time: hhmm("15:00"),
        ..request.clone()
    };
    engine.create_booking(&owner, request).await.unwrap();
    assert!(matches!(
        engine.create_booking(&owner, again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn same_id_on_two_resources_admits_one() {
    let (engine, owner) = setup("dup_across.wal").await;
    engine.create_resource(&owner, room("R2")).await.unwrap();
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    let day = future_day();
    let first = balance_booking("R1", day, "10:00", 60, 2000);
    let second = NewBooking {
        resource_id: "R2".into(),
        ..first.clone()
    };
    let id = first.id;

    let (a, b) = tokio::join!(
        engine.create_booking(&owner, first),
        engine.create_booking(&owner, second)
    );
    let winner = match (a, b) {
        (Ok(booking), Err(EngineError::AlreadyExists(_)))
        | (Err(EngineError::AlreadyExists(_)), Ok(booking)) => booking,
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(balance_of(&engine, owner.id).await, Money(8000));
    assert_eq!(engine.resource_for_booking(&id), Some(winner.resource_id.clone()));

    let outcome = engine.cancel_booking(&owner, id, None).await.unwrap();
    assert_eq!(outcome.booking.resource_id, winner.resource_id);
    assert_eq!(balance_of(&engine, owner.id).await, Money(10_000));
}

#[tokio::test]
async fn rejected_create_releases_its_id() {
    let (engine, owner) = setup("dup_release.wal").await;
    let request = balance_booking("R1", future_day(), "10:00", 60, 2000);
    assert!(matches!(
        engine.create_booking(&owner, request.clone()).await,
        Err(EngineError::InsufficientFunds { .. })
    ));
    assert_eq!(engine.resource_for_booking(&request.id), None);

    engine.deposit(&owner, owner.id, Money(2000)).await.unwrap();
    let booking = engine.create_booking(&owner, request.clone()).await.unwrap();
    assert_eq!(booking.id, request.id);
}

#[tokio::test]
async fn bad_requests_rejected() {
    let (engine, owner) = setup("bad_requests.wal").await;
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    let day = future_day();

    let zero = balance_booking("R1", day, "10:00", 0, 0);
    assert!(matches!(engine.create_booking(&owner, zero).await, Err(EngineError::Invalid(_))));

    let past_midnight = balance_booking("R1", day, "23:30", 60, 1000);
    assert!(matches!(
        engine.create_booking(&owner, past_midnight).await,
        Err(EngineError::Invalid(_))
    ));

    let negative = balance_booking("R1", day, "10:00", 60, -100);
    assert!(matches!(engine.create_booking(&owner, negative).await, Err(EngineError::Invalid(_))));

    let nowhere = balance_booking("R9", day, "10:00", 60, 100);
    assert!(matches!(engine.create_booking(&owner, nowhere).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn inactive_resource_not_bookable() {
    let (engine, owner) = setup("inactive.wal").await;
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    engine
        .update_resource(
            &owner,
            "R1",
            ResourcePatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Invalid(_)));
}

#[tokio::test]
async fn concurrent_requests_for_one_slot_admit_one() {
    let (engine, owner) = setup("concurrent.wal").await;
    engine.deposit(&owner, owner.id, Money(100_000)).await.unwrap();
    let engine = Arc::new(engine);
    let day = future_day();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let owner = owner.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 100))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::SlotConflict(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(balance_of(&engine, owner.id).await, Money(99_900));
}

// ── Settlement ───────────────────────────────────────────

#[tokio::test]
async fn credit_limit_is_the_floor() {
    let (engine, owner) = setup("credit_floor.wal").await;
    let payer = member(&engine, &owner, "payer@example.com").await;
    engine.set_credit_limit(&owner, payer.id, Money(10_000)).await.unwrap();
    let day = future_day();

    engine
        .create_booking(&payer, balance_booking("R1", day, "08:00", 60, 8000))
        .await
        .unwrap();
    assert_eq!(balance_of(&engine, payer.id).await, Money(-8000));

    let err = engine
        .create_booking(&payer, balance_booking("R1", day, "10:00", 60, 2500))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientFunds {
            available: Money(2000),
            required: Money(2500),
        }
    );
    assert_eq!(balance_of(&engine, payer.id).await, Money(-8000));

    engine
        .create_booking(&payer, balance_booking("R1", day, "10:00", 60, 1500))
        .await
        .unwrap();
    assert_eq!(balance_of(&engine, payer.id).await, Money(-9500));
}

#[tokio::test]
async fn refund_mirrors_charge_after_rate_change() {
    let (engine, owner) = setup("refund_rate.wal").await;
    engine.deposit(&owner, owner.id, Money(5000)).await.unwrap();
    let b = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 90, 3000))
        .await
        .unwrap();
    assert_eq!(balance_of(&engine, owner.id).await, Money(2000));

    engine
        .update_resource(
            &owner,
            "R1",
            ResourcePatch {
                hourly_rate: Some(Money(9900)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = engine.cancel_booking(&owner, b.id, None).await.unwrap();
    assert_eq!(outcome.refund, Some(Charge::Balance(Money(3000))));
    assert_eq!(balance_of(&engine, owner.id).await, Money(5000));
}

#[tokio::test]
async fn subscription_hours_deducted_and_restored() {
    let (engine, owner) = setup("sub_hours.wal").await;
    let payer = member(&engine, &owner, "hours@example.com").await;
    engine
        .assign_subscription(&owner, payer.id, Hours(120), Some("Monthly".into()))
        .await
        .unwrap();

    let b = engine
        .create_booking(&payer, hours_booking("R1", future_day(), "10:00", 90))
        .await
        .unwrap();
    assert_eq!(b.hours_deducted, Some(Hours(90)));
    assert_eq!(hours_of(&engine, payer.id).await, Some(Hours(30)));
    assert_eq!(Hours(30).to_string(), "0.5");
    // Balance untouched by an hours booking.
    assert_eq!(balance_of(&engine, payer.id).await, Money::ZERO);

    let outcome = engine.cancel_booking(&payer, b.id, None).await.unwrap();
    assert_eq!(outcome.refund, Some(Charge::Hours(Hours(90))));
    assert_eq!(hours_of(&engine, payer.id).await, Some(Hours(120)));
}

#[tokio::test]
async fn insufficient_hours_rejected() {
    let (engine, owner) = setup("few_hours.wal").await;
    let payer = member(&engine, &owner, "few@example.com").await;

    let err = engine
        .create_booking(&payer, hours_booking("R1", future_day(), "10:00", 60))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientHours {
            remaining: None,
            required: Hours(60),
        }
    );

    engine.assign_subscription(&owner, payer.id, Hours(60), None).await.unwrap();
    let err = engine
        .create_booking(&payer, hours_booking("R1", future_day(), "10:00", 90))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientHours {
            remaining: Some(Hours(60)),
            required: Hours(90),
        }
    );
    assert_eq!(hours_of(&engine, payer.id).await, Some(Hours(60)));
}

#[tokio::test]
async fn frozen_subscription_still_pays() {
    let (engine, owner) = setup("frozen_pays.wal").await;
    let payer = member(&engine, &owner, "frozen@example.com").await;
    engine.assign_subscription(&owner, payer.id, Hours(120), None).await.unwrap();
    let user = engine.set_subscription_frozen(&owner, payer.id, true).await.unwrap();
    let sub = user.subscription.unwrap();
    assert!(sub.frozen);
    assert!(sub.frozen_until.unwrap() > now_ms());

    engine
        .create_booking(&payer, hours_booking("R1", future_day(), "10:00", 60))
        .await
        .unwrap();
    assert_eq!(hours_of(&engine, payer.id).await, Some(Hours(60)));

    let user = engine.set_subscription_frozen(&owner, payer.id, false).await.unwrap();
    let sub = user.subscription.unwrap();
    assert!(!sub.frozen);
    assert_eq!(sub.frozen_until, None);
}

#[tokio::test]
async fn freeze_without_subscription_is_invalid() {
    let (engine, owner) = setup("freeze_none.wal").await;
    let payer = member(&engine, &owner, "nosub@example.com").await;
    assert!(matches!(
        engine.set_subscription_frozen(&owner, payer.id, true).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn refund_recreates_removed_subscription() {
    let (engine, owner) = setup("lost_sub.wal").await;
    let payer = member(&engine, &owner, "lost@example.com").await;
    engine.assign_subscription(&owner, payer.id, Hours(120), None).await.unwrap();
    let b = engine
        .create_booking(&payer, hours_booking("R1", future_day(), "10:00", 60))
        .await
        .unwrap();

    // Subscription taken away between charge and refund.
    engine.get_user(&payer.id).unwrap().lock().await.subscription = None;

    engine.cancel_booking(&payer, b.id, None).await.unwrap();
    assert_eq!(hours_of(&engine, payer.id).await, Some(Hours(60)));
}

#[tokio::test]
async fn ledger_operations_are_staff_only() {
    let (engine, owner) = setup("ledger_staff.wal").await;
    let payer = member(&engine, &owner, "ledger@example.com").await;
    assert!(matches!(
        engine.deposit(&payer, payer.id, Money(100)).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.set_credit_limit(&payer, payer.id, Money(100)).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.assign_subscription(&payer, payer.id, Hours(60), None).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.deposit(&owner, payer.id, Money::ZERO).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.set_credit_limit(&owner, payer.id, Money(-1)).await,
        Err(EngineError::Invalid(_))
    ));
    let user = engine.deposit(&owner, payer.id, Money(2550)).await.unwrap();
    assert_eq!(user.balance, Money(2550));
}

#[tokio::test]
async fn personal_discount_keeps_history_and_timeline() {
    let (engine, owner) = setup("discount.wal").await;
    let payer = member(&engine, &owner, "discount@example.com").await;
    assert!(matches!(
        engine.set_personal_discount(&payer, payer.id, 10, None).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.set_personal_discount(&owner, payer.id, 101, None).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.set_personal_discount(&owner, Ulid::new(), 10, None).await,
        Err(EngineError::NotFound(_))
    ));

    engine
        .set_personal_discount(&owner, payer.id, 10, Some("regular".into()))
        .await
        .unwrap();
    let user = engine.set_personal_discount(&owner, payer.id, 25, None).await.unwrap();
    assert_eq!(user.personal_discount_percent, 25);
    let history: Vec<_> = user
        .discount_history
        .iter()
        .map(|c| (c.old_percent, c.new_percent, c.reason.as_str()))
        .collect();
    assert_eq!(history, vec![(10, 25, "Manual admin update"), (0, 10, "regular")]);
    assert_eq!(user.discount_history[0].changed_by, owner.name);

    let events = engine
        .list_timeline(
            &owner,
            &TimelineFilter {
                target_id: Some(payer.id.to_string()),
                event_type: Some("discount_change".into()),
                limit: 0,
            },
        )
        .unwrap();
    assert_eq!(events.len(), 2);
    let latest = events
        .iter()
        .find(|e| e.metadata["new_percent"] == serde_json::json!(25))
        .unwrap();
    assert_eq!(latest.metadata["old_percent"], serde_json::json!(10));
    assert_eq!(latest.metadata["reason"], serde_json::json!("Manual admin update"));
    assert_eq!(latest.description, "Changed discount from 10% to 25%. Reason: Manual admin update");
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_twice_is_idempotent() {
    let (engine, owner) = setup("cancel_twice.wal").await;
    engine.deposit(&owner, owner.id, Money(5000)).await.unwrap();
    let b = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap();

    let first = engine
        .cancel_booking(&owner, b.id, Some("plans changed".into()))
        .await
        .unwrap();
    assert!(first.refund.is_some());
    assert_eq!(first.booking.status, BookingStatus::Cancelled);
    assert_eq!(first.booking.cancellation_reason.as_deref(), Some("plans changed"));
    assert_eq!(first.booking.cancelled_by.as_deref(), Some("owner@example.com"));

    let second = engine.cancel_booking(&owner, b.id, None).await.unwrap();
    assert_eq!(second.refund, None);
    assert_eq!(second.booking, first.booking);
    assert_eq!(balance_of(&engine, owner.id).await, Money(5000));
    assert_eq!(count_events(&engine, &owner, "booking_cancelled"), 1);
}

#[tokio::test]
async fn default_cancel_reason() {
    let (engine, owner) = setup("cancel_reason.wal").await;
    engine.deposit(&owner, owner.id, Money(5000)).await.unwrap();
    let b = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap();
    let outcome = engine.cancel_booking(&owner, b.id, Some("   ".into())).await.unwrap();
    assert_eq!(outcome.booking.cancellation_reason.as_deref(), Some("User cancelled"));
}

#[tokio::test]
async fn only_owner_or_staff_may_cancel() {
    let (engine, owner) = setup("cancel_perm.wal").await;
    let alice = member(&engine, &owner, "alice@example.com").await;
    let bob = member(&engine, &owner, "bob@example.com").await;
    let admin = staff(&engine, &owner, "admin@example.com", Role::Admin).await;
    engine.deposit(&owner, alice.id, Money(5000)).await.unwrap();

    let b = engine
        .create_booking(&alice, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap();
    assert!(matches!(
        engine.cancel_booking(&bob, b.id, None).await,
        Err(EngineError::Forbidden(_))
    ));

    let outcome = engine.cancel_booking(&admin, b.id, None).await.unwrap();
    assert_eq!(outcome.booking.cancelled_by.as_deref(), Some("admin@example.com"));
    // The refund goes to the booking's owner, not the canceller.
    assert_eq!(balance_of(&engine, alice.id).await, Money(5000));
    assert_eq!(balance_of(&engine, admin.id).await, Money::ZERO);
}

#[tokio::test]
async fn late_cancellation_flagged() {
    let (engine, owner) = setup("late_cancel.wal").await;
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();

    let past = engine
        .create_booking(&owner, balance_booking("R1", date(2025, 6, 1), "10:00", 60, 2000))
        .await
        .unwrap();
    let future = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap();

    assert!(engine.cancel_booking(&owner, past.id, None).await.unwrap().is_late);
    assert!(!engine.cancel_booking(&owner, future.id, None).await.unwrap().is_late);

    let events = engine
        .list_timeline(
            &owner,
            &TimelineFilter {
                target_id: Some(past.id.to_string()),
                event_type: Some("booking_cancelled".into()),
                limit: 0,
            },
        )
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["is_late_cancellation"], serde_json::Value::Bool(true));
    assert_eq!(events[0].metadata["refunded_amount"], serde_json::json!(20.0));
}

#[tokio::test]
async fn unknown_booking_not_found() {
    let (engine, owner) = setup("cancel_unknown.wal").await;
    assert!(matches!(
        engine.cancel_booking(&owner, Ulid::new(), None).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Payer targeting ──────────────────────────────────────

#[tokio::test]
async fn staff_may_book_for_another_user() {
    let (engine, owner) = setup("target_staff.wal").await;
    let admin = staff(&engine, &owner, "desk@example.com", Role::Admin).await;
    let guest = member(&engine, &owner, "guest@example.com").await;
    engine.deposit(&owner, guest.id, Money(5000)).await.unwrap();

    let request = NewBooking {
        target_user: Some("Guest@Example.com".into()),
        ..balance_booking("R1", future_day(), "10:00", 60, 2000)
    };
    let b = engine.create_booking(&admin, request).await.unwrap();
    assert_eq!(b.user_id, guest.id);
    assert_eq!(balance_of(&engine, guest.id).await, Money(3000));
    assert_eq!(balance_of(&engine, admin.id).await, Money::ZERO);

    let unknown = NewBooking {
        target_user: Some("nobody@example.com".into()),
        ..balance_booking("R1", future_day(), "12:00", 60, 2000)
    };
    assert!(matches!(
        engine.create_booking(&admin, unknown).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn members_cannot_bill_others() {
    let (engine, owner) = setup("target_member.wal").await;
    let alice = member(&engine, &owner, "alice@example.com").await;
    let bob = member(&engine, &owner, "bob@example.com").await;
    engine.deposit(&owner, alice.id, Money(5000)).await.unwrap();
    engine.deposit(&owner, bob.id, Money(5000)).await.unwrap();

    let for_bob = NewBooking {
        target_user: Some(bob.id.to_string()),
        ..balance_booking("R1", future_day(), "10:00", 60, 2000)
    };
    assert!(matches!(
        engine.create_booking(&alice, for_bob).await,
        Err(EngineError::Forbidden(_))
    ));
    let for_nobody = NewBooking {
        target_user: Some("ghost@example.com".into()),
        ..balance_booking("R1", future_day(), "10:00", 60, 2000)
    };
    assert!(matches!(
        engine.create_booking(&alice, for_nobody).await,
        Err(EngineError::Forbidden(_))
    ));
    // Naming yourself is fine.
    let for_self = NewBooking {
        target_user: Some("alice@example.com".into()),
        ..balance_booking("R1", future_day(), "10:00", 60, 2000)
    };
    engine.create_booking(&alice, for_self).await.unwrap();
    assert_eq!(balance_of(&engine, bob.id).await, Money(5000));
}

// ── Re-rent ──────────────────────────────────────────────

#[tokio::test]
async fn re_rent_listing_shows_free_but_still_blocks() {
    let (engine, owner) = setup("re_rent.wal").await;
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    let day = future_day();
    let b = engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();

    let listed = engine.set_re_rent_listed(&owner, b.id, true).await.unwrap();
    assert!(listed.re_rent_listed);

    let skip = engine
        .is_available("R1", day, hhmm("10:00"), 60, None, ReRentPolicy::Skip)
        .await
        .unwrap();
    assert!(skip.available);
    let block = engine
        .is_available("R1", day, hhmm("10:00"), 60, None, ReRentPolicy::Block)
        .await
        .unwrap();
    assert!(!block.available);
    assert_eq!(block.conflict.unwrap().booking_id, b.id);

    assert_eq!(
        engine.free_slots("R1", day, None, ReRentPolicy::Skip).await.unwrap(),
        vec![Span::new(0, 1440)]
    );

    assert!(matches!(
        engine
            .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
            .await,
        Err(EngineError::SlotConflict(_))
    ));

    engine.cancel_booking(&owner, b.id, None).await.unwrap();
    assert!(matches!(
        engine.set_re_rent_listed(&owner, b.id, false).await,
        Err(EngineError::Invalid(_))
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn free_slots_and_slot_check() {
    let (engine, owner) = setup("free_slots.wal").await;
    engine.deposit(&owner, owner.id, Money(10_000)).await.unwrap();
    let day = future_day();
    let first = engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();
    engine
        .create_booking(&owner, balance_booking("R1", day, "14:00", 60, 2000))
        .await
        .unwrap();

    let free = engine.free_slots("R1", day, None, ReRentPolicy::Block).await.unwrap();
    assert_eq!(
        free,
        vec![Span::new(0, 600), Span::new(660, 840), Span::new(900, 1440)]
    );
    let long = engine
        .free_slots("R1", day, Some(200), ReRentPolicy::Block)
        .await
        .unwrap();
    assert_eq!(long, vec![Span::new(0, 600), Span::new(900, 1440)]);

    // Rescheduling check: the booking itself is excluded.
    let own = engine
        .is_available("R1", day, hhmm("10:30"), 60, Some(first.id), ReRentPolicy::Block)
        .await
        .unwrap();
    assert!(own.available);
    let other = engine
        .is_available("R1", day, hhmm("10:30"), 60, None, ReRentPolicy::Block)
        .await
        .unwrap();
    assert!(!other.available);
}

#[tokio::test]
async fn members_see_only_their_bookings() {
    let (engine, owner) = setup("visibility.wal").await;
    let alice = member(&engine, &owner, "alice@example.com").await;
    let bob = member(&engine, &owner, "bob@example.com").await;
    engine.deposit(&owner, alice.id, Money(5000)).await.unwrap();
    engine.deposit(&owner, bob.id, Money(5000)).await.unwrap();
    let day = future_day();

    let a = engine
        .create_booking(&alice, balance_booking("R1", day, "09:00", 60, 1000))
        .await
        .unwrap();
    let b = engine
        .create_booking(&bob, balance_booking("R1", day, "10:00", 60, 1000))
        .await
        .unwrap();
    engine.cancel_booking(&bob, b.id, None).await.unwrap();

    let mine = engine.list_bookings(&alice, &BookingFilter::default()).await.unwrap();
    assert_eq!(mine.iter().map(|b| b.id).collect::<Vec<_>>(), vec![a.id]);

    let all = engine.list_bookings(&owner, &BookingFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    let confirmed = engine
        .list_bookings(
            &owner,
            &BookingFilter {
                status: Some(BookingStatus::Confirmed),
                date: Some(day),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 1);

    assert!(matches!(
        engine.get_booking(&alice, b.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert_eq!(engine.get_booking(&owner, b.id).await.unwrap().status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn timeline_is_staff_only_and_newest_first() {
    let (engine, owner) = setup("timeline.wal").await;
    let payer = member(&engine, &owner, "t@example.com").await;
    engine.deposit(&owner, payer.id, Money(100)).await.unwrap();
    engine.deposit(&owner, payer.id, Money(200)).await.unwrap();

    assert!(matches!(
        engine.list_timeline(&payer, &TimelineFilter::default()),
        Err(EngineError::Forbidden(_))
    ));

    let deposits = engine
        .list_timeline(
            &owner,
            &TimelineFilter {
                event_type: Some("balance_deposit".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(deposits.len(), 2);
    assert_eq!(deposits[0].metadata["amount"], serde_json::json!(2.0));

    let one = engine
        .list_timeline(
            &owner,
            &TimelineFilter {
                limit: 1,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].event_type, "balance_deposit");
}

// ── Accounts ─────────────────────────────────────────────

#[tokio::test]
async fn registration_rules() {
    let (engine, owner) = setup("register.wal").await;

    // Self-registration: login must match the email, role must be user.
    let me = engine
        .register_user(None, "new@example.com", Ulid::new(), "new@example.com".into(), "New".into(), Role::User)
        .await
        .unwrap();
    assert_eq!(me.role, Role::User);
    assert!(matches!(
        engine
            .register_user(None, "x@example.com", Ulid::new(), "y@example.com".into(), "Y".into(), Role::User)
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine
            .register_user(None, "boss@example.com", Ulid::new(), "boss@example.com".into(), "B".into(), Role::Owner)
            .await,
        Err(EngineError::Forbidden(_))
    ));

    let admin = staff(&engine, &owner, "admin@example.com", Role::Admin).await;
    assert!(matches!(
        engine
            .register_user(Some(&admin), &admin.email, Ulid::new(), "a2@example.com".into(), "A2".into(), Role::Admin)
            .await,
        Err(EngineError::Forbidden(_))
    ));

    // Emails are unique regardless of case.
    assert!(matches!(
        engine
            .register_user(Some(&owner), &owner.email, Ulid::new(), "NEW@example.com".into(), "Dup".into(), Role::User)
            .await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine
            .register_user(Some(&owner), &owner.email, Ulid::new(), "not-an-email".into(), "Bad".into(), Role::User)
            .await,
        Err(EngineError::Invalid(_))
    ));
    assert_eq!(engine.resolve_actor("New@Example.com").await.unwrap().id, me.id);
}

#[tokio::test]
async fn bootstrap_owner_runs_once() {
    let (engine, _owner) = setup("bootstrap.wal").await;
    assert!(engine.bootstrap_owner("owner@example.com", "Owner").await.unwrap().is_none());
}

#[tokio::test]
async fn role_change_rules() {
    let (engine, owner) = setup("roles.wal").await;
    let senior = staff(&engine, &owner, "senior@example.com", Role::SeniorAdmin).await;
    let admin = staff(&engine, &owner, "admin@example.com", Role::Admin).await;
    let user = member(&engine, &owner, "user@example.com").await;

    assert!(matches!(
        engine.change_role(&admin, user.id, Role::Admin).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.change_role(&senior, user.id, Role::Owner).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.change_role(&senior, owner.id, Role::User).await,
        Err(EngineError::Forbidden(_))
    ));

    let promoted = engine.change_role(&senior, user.id, Role::Admin).await.unwrap();
    assert_eq!(promoted.role, Role::Admin);
    engine.change_role(&senior, admin.id, Role::User).await.unwrap();

    // The last owner cannot step down; a second owner makes it possible.
    assert!(matches!(
        engine.change_role(&owner, owner.id, Role::User).await,
        Err(EngineError::Invalid(_))
    ));
    engine.change_role(&owner, senior.id, Role::Owner).await.unwrap();
    engine.change_role(&owner, owner.id, Role::SeniorAdmin).await.unwrap();

    let changes = engine
        .list_timeline(
            &Actor::from(&user_state(&engine, senior.id).await),
            &TimelineFilter {
                event_type: Some("role_change".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(changes.len(), 4);
    assert_eq!(changes[0].metadata["old_role"], serde_json::json!("owner"));
    assert_eq!(changes[0].metadata["new_role"], serde_json::json!("senior_admin"));
}

#[tokio::test]
async fn resources_are_staff_managed() {
    let (engine, owner) = setup("resources.wal").await;
    let user = member(&engine, &owner, "u@example.com").await;
    assert!(matches!(
        engine.create_resource(&user, room("R2")).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.create_resource(&owner, room("R1")).await,
        Err(EngineError::AlreadyExists(_))
    ));
    let updated = engine
        .update_resource(
            &owner,
            "R1",
            ResourcePatch {
                name: Some("Big room".into()),
                capacity: Some(12),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "Big room");
    assert_eq!(updated.capacity, 12);
    assert_eq!(updated.hourly_rate, Money(2000));
    assert_eq!(engine.list_resources().await.len(), 1);
}

// ── Waitlist ─────────────────────────────────────────────

async fn next_slot_freed(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Option<Notification> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(left, rx.recv()).await {
            Ok(Ok(n @ Notification::SlotFreed { .. })) => return Some(n),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn cancellation_announces_to_waitlist() {
    let (engine, owner) = setup("waitlist_announce.wal").await;
    let waiter = member(&engine, &owner, "waiter@example.com").await;
    let day = future_day();
    engine.deposit(&owner, owner.id, Money(5000)).await.unwrap();
    let b = engine
        .create_booking(&owner, balance_booking("R1", day, "10:00", 60, 2000))
        .await
        .unwrap();

    let entry = engine
        .join_waitlist(&waiter, Ulid::new(), "R1", day, hhmm("09:30"), hhmm("12:00"))
        .await
        .unwrap();
    // Different day: not told.
    engine
        .join_waitlist(&waiter, Ulid::new(), "R1", date(2099, 6, 2), hhmm("09:30"), hhmm("12:00"))
        .await
        .unwrap();

    let mut rx = engine.notify.subscribe("R1");
    engine.cancel_booking(&owner, b.id, None).await.unwrap();

    match next_slot_freed(&mut rx).await {
        Some(Notification::SlotFreed {
            resource_id,
            date: freed_day,
            span,
            waitlist,
        }) => {
            assert_eq!(resource_id, "R1");
            assert_eq!(freed_day, day);
            assert_eq!(span, Span::new(600, 660));
            assert_eq!(waitlist, vec![entry.id]);
        }
        other => panic!("expected SlotFreed, got {other:?}"),
    }
}

#[tokio::test]
async fn booking_fulfils_own_waitlist_entry() {
    let (engine, owner) = setup("waitlist_fulfil.wal").await;
    let waiter = member(&engine, &owner, "waiter@example.com").await;
    let other = member(&engine, &owner, "other@example.com").await;
    engine.deposit(&owner, waiter.id, Money(5000)).await.unwrap();
    engine.deposit(&owner, other.id, Money(5000)).await.unwrap();
    let day = future_day();

    let mine = engine
        .join_waitlist(&waiter, Ulid::new(), "R1", day, hhmm("10:00"), hhmm("12:00"))
        .await
        .unwrap();
    let theirs = engine
        .join_waitlist(&other, Ulid::new(), "R1", day, hhmm("10:00"), hhmm("12:00"))
        .await
        .unwrap();

    engine
        .create_booking(&waiter, balance_booking("R1", day, "11:00", 60, 1000))
        .await
        .unwrap();

    let entries = engine.list_waitlist(&owner);
    let status = |id: Ulid| entries.iter().find(|e| e.id == id).unwrap().status;
    assert_eq!(status(mine.id), WaitlistStatus::Fulfilled);
    assert_eq!(status(theirs.id), WaitlistStatus::Active);
    assert_eq!(engine.list_waitlist(&other).len(), 1);
}

#[tokio::test]
async fn leaving_waitlist() {
    let (engine, owner) = setup("waitlist_leave.wal").await;
    let waiter = member(&engine, &owner, "waiter@example.com").await;
    let stranger = member(&engine, &owner, "stranger@example.com").await;
    let entry = engine
        .join_waitlist(&waiter, Ulid::new(), "R1", future_day(), hhmm("10:00"), hhmm("11:00"))
        .await
        .unwrap();

    assert!(matches!(
        engine.leave_waitlist(&stranger, entry.id).await,
        Err(EngineError::Forbidden(_))
    ));
    let left = engine.leave_waitlist(&waiter, entry.id).await.unwrap();
    assert_eq!(left.status, WaitlistStatus::Cancelled);
    let again = engine.leave_waitlist(&waiter, entry.id).await.unwrap();
    assert_eq!(again.status, WaitlistStatus::Cancelled);

    assert!(matches!(
        engine
            .join_waitlist(&waiter, Ulid::new(), "R1", future_day(), hhmm("11:00"), hhmm("10:00"))
            .await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine
            .join_waitlist(&waiter, Ulid::new(), "R9", future_day(), hhmm("10:00"), hhmm("11:00"))
            .await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Calendar mirror ──────────────────────────────────────

async fn setup_with_calendar(name: &str) -> (Engine, Actor, Arc<MemoryCalendar>) {
    let calendar = Arc::new(MemoryCalendar::new());
    let engine = Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()))
        .unwrap()
        .with_calendar(calendar.clone());
    let owner = engine
        .bootstrap_owner("owner@example.com", "Owner")
        .await
        .unwrap()
        .unwrap();
    let owner = Actor::from(&owner);
    engine.create_resource(&owner, room("R1")).await.unwrap();
    engine.deposit(&owner, owner.id, Money(100_000)).await.unwrap();
    (engine, owner, calendar)
}

#[tokio::test]
async fn calendar_event_follows_booking() {
    let (engine, owner, calendar) = setup_with_calendar("calendar_follow.wal").await;
    let b = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap();
    let event_id = b.calendar_event_id.clone().unwrap();
    assert!(calendar.contains(&event_id));
    assert_eq!(
        engine.get_booking(&owner, b.id).await.unwrap().calendar_event_id,
        Some(event_id.clone())
    );

    let outcome = engine.cancel_booking(&owner, b.id, None).await.unwrap();
    assert!(!calendar.contains(&event_id));
    assert_eq!(outcome.booking.calendar_event_id, None);
}

#[tokio::test]
async fn calendar_failures_never_fail_bookings() {
    let (engine, owner, calendar) = setup_with_calendar("calendar_fail.wal").await;
    calendar.set_fail_create(true);
    let b = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "10:00", 60, 2000))
        .await
        .unwrap();
    assert_eq!(b.calendar_event_id, None);
    assert!(calendar.is_empty());
    assert_eq!(balance_of(&engine, owner.id).await, Money(98_000));

    calendar.set_fail_create(false);
    calendar.set_fail_delete(true);
    let linked = engine
        .create_booking(&owner, balance_booking("R1", future_day(), "12:00", 60, 2000))
        .await
        .unwrap();
    assert!(linked.calendar_event_id.is_some());
    let outcome = engine.cancel_booking(&owner, linked.id, None).await.unwrap();
    assert_eq!(outcome.booking.status, BookingStatus::Cancelled);
    // Reference cleared even though the remote delete failed.
    assert_eq!(outcome.booking.calendar_event_id, None);
    assert_eq!(calendar.len(), 1);
}

// ── Persistence ──────────────────────────────────────────

async fn populate(engine: &Engine, owner: &Actor) -> (Actor, Ulid, Ulid, Ulid) {
    let payer = member(engine, owner, "persist@example.com").await;
    engine.deposit(owner, payer.id, Money(10_000)).await.unwrap();
    engine.set_credit_limit(owner, payer.id, Money(500)).await.unwrap();
    engine
        .assign_subscription(owner, payer.id, Hours(180), Some("Quarter".into()))
        .await
        .unwrap();
    engine
        .set_personal_discount(owner, payer.id, 15, Some("loyal".into()))
        .await
        .unwrap();
    let kept = engine
        .create_booking(&payer, balance_booking("R1", future_day(), "10:00", 60, 2500))
        .await
        .unwrap();
    engine
        .create_booking(&payer, hours_booking("R1", future_day(), "12:00", 90))
        .await
        .unwrap();
    let dropped = engine
        .create_booking(&payer, balance_booking("R1", future_day(), "15:00", 30, 700))
        .await
        .unwrap();
    engine.cancel_booking(&payer, dropped.id, Some("sick".into())).await.unwrap();
    engine.set_re_rent_listed(&payer, kept.id, true).await.unwrap();
    let entry = engine
        .join_waitlist(&payer, Ulid::new(), "R1", date(2099, 6, 2), hhmm("09:00"), hhmm("10:00"))
        .await
        .unwrap();
    (payer, kept.id, dropped.id, entry.id)
}

async fn assert_populated(engine: &Engine, owner: &Actor, payer: Ulid, kept: Ulid, dropped: Ulid, entry: Ulid) {
    let user = user_state(engine, payer).await;
    assert_eq!(user.balance, Money(7500));
    assert_eq!(user.credit_limit, Money(500));
    let sub = user.subscription.unwrap();
    assert_eq!(sub.remaining, Hours(90));
    assert_eq!(sub.plan.as_deref(), Some("Quarter"));
    assert_eq!(user.personal_discount_percent, 15);
    assert_eq!(user.discount_history.len(), 1);
    assert_eq!(user.discount_history[0].reason, "loyal");

    let kept = engine.get_booking(owner, kept).await.unwrap();
    assert!(kept.is_confirmed());
    assert!(kept.re_rent_listed);
    let dropped = engine.get_booking(owner, dropped).await.unwrap();
    assert_eq!(dropped.status, BookingStatus::Cancelled);
    assert_eq!(dropped.cancellation_reason.as_deref(), Some("sick"));

    let entries = engine.list_waitlist(owner);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, entry);

    // The index survives too: cancelling again still finds the booking.
    assert!(engine.cancel_booking(owner, dropped.id, None).await.unwrap().refund.is_none());
    assert!(matches!(
        engine
            .create_booking(owner, balance_booking("R1", future_day(), "10:00", 60, 0))
            .await,
        Err(EngineError::SlotConflict(_))
    ));
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (payer, kept, dropped, entry, owner) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let owner = Actor::from(&engine.bootstrap_owner("owner@example.com", "Owner").await.unwrap().unwrap());
        engine.create_resource(&owner, room("R1")).await.unwrap();
        let (payer, kept, dropped, entry) = populate(&engine, &owner).await;
        (payer, kept, dropped, entry, owner)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.resolve_actor("owner@example.com").await.unwrap(), owner);
    assert_populated(&engine, &owner, payer.id, kept, dropped, entry).await;
}

#[tokio::test]
async fn state_survives_compaction() {
    let path = test_wal_path("compaction.wal");
    let (payer, kept, dropped, entry, owner) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let owner = Actor::from(&engine.bootstrap_owner("owner@example.com", "Owner").await.unwrap().unwrap());
        engine.create_resource(&owner, room("R1")).await.unwrap();
        let (payer, kept, dropped, entry) = populate(&engine, &owner).await;
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (payer, kept, dropped, entry, owner)
    };

    let events = crate::wal::Wal::replay(&path).unwrap();
    // Two users, one resource, three bookings, one waitlist entry.
    assert_eq!(events.len(), 7);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_populated(&engine, &owner, payer.id, kept, dropped, entry).await;
}

#[tokio::test]
async fn appends_after_compaction_replay() {
    let path = test_wal_path("compact_then_append.wal");
    let owner_id = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let owner = Actor::from(&engine.bootstrap_owner("owner@example.com", "Owner").await.unwrap().unwrap());
        engine.deposit(&owner, owner.id, Money(1000)).await.unwrap();
        engine.compact_wal().await.unwrap();
        engine.deposit(&owner, owner.id, Money(250)).await.unwrap();
        owner.id
    };
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(balance_of(&engine, owner_id).await, Money(1250));
}
