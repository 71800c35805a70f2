use super::*;
use crate::model::*;

use chrono::{Days, NaiveDate};
use tokio_test::{assert_err, assert_ok};

const HOUR: Ms = 3_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbay_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn day(offset: i64) -> NaiveDate {
    let today = guard::today();
    if offset >= 0 {
        today.checked_add_days(Days::new(offset as u64)).unwrap()
    } else {
        today.checked_sub_days(Days::new((-offset) as u64)).unwrap()
    }
}

fn vehicle() -> Vehicle {
    Vehicle {
        make: "Honda".into(),
        model: "Civic".into(),
        year: 2019,
        plate: "KA01AB1234".into(),
    }
}

fn request(service_id: Ulid, date: NaiveDate, slot: TimeSlot) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        service_id,
        key: SlotKey::new(date, slot),
        vehicle: vehicle(),
        notes: None,
        priority: Priority::Normal,
    }
}

/// A small shop: one service, one super employee, two regular reports.
struct Shop {
    engine: Arc<Engine>,
    service: Ulid,
    boss: Actor,
    emp: Actor,
    emp2: Actor,
}

async fn shop(name: &str) -> Shop {
    let engine = Arc::new(Engine::new(test_wal_path(name), 30).unwrap());
    let admin = Actor::admin();

    let service = Ulid::new();
    engine
        .register_service(
            &admin,
            Service {
                id: service,
                name: "Oil change".into(),
                estimated_duration: Some(HOUR),
                active: true,
            },
        )
        .await
        .unwrap();

    let boss = Employee::new(Ulid::new(), "SUP001".into(), EmployeeKind::Super);
    engine.register_employee(&admin, boss.clone()).await.unwrap();

    let mut emp = Employee::new(Ulid::new(), "EMP001".into(), EmployeeKind::Regular);
    emp.supervisor_id = Some(boss.id);
    engine.register_employee(&admin, emp.clone()).await.unwrap();

    let mut emp2 = Employee::new(Ulid::new(), "EMP002".into(), EmployeeKind::Regular);
    emp2.supervisor_id = Some(boss.id);
    engine.register_employee(&admin, emp2.clone()).await.unwrap();

    Shop {
        engine,
        service,
        boss: Actor::supervisor(boss.id),
        emp: Actor::employee(emp.id),
        emp2: Actor::employee(emp2.id),
    }
}

// ── Booking guard ────────────────────────────────────────

#[tokio::test]
async fn concurrent_bookings_for_one_slot_admit_exactly_one() {
    let s = shop("concurrent_same_slot.wal").await;
    let date = day(3);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = s.engine.clone();
        let req = request(s.service, date, TimeSlot::At0900);
        handles.push(tokio::spawn(async move {
            engine.book_appointment(&Actor::customer(Ulid::new()), req).await
        }));
    }

    let mut booked = 0;
    let mut occupied = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::SlotOccupied(key)) => {
                assert_eq!(key, SlotKey::new(date, TimeSlot::At0900));
                occupied += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);
    assert_eq!(occupied, 15);
    assert_eq!(s.engine.list_appointments(&Actor::admin(), AppointmentFilter::Date(date)).await.len(), 1);
}

#[tokio::test]
async fn different_slots_book_independently() {
    let s = shop("parallel_slots.wal").await;
    let date = day(1);

    let mut handles = Vec::new();
    for slot in TimeSlot::ALL {
        let engine = s.engine.clone();
        let req = request(s.service, date, slot);
        handles.push(tokio::spawn(async move {
            engine.book_appointment(&Actor::customer(Ulid::new()), req).await
        }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    assert!(s.engine.available_slots(date).await.is_empty());
    assert_eq!(s.engine.daily_summary(date).await.available, 0);
}

#[tokio::test]
async fn occupied_error_names_the_slot_label() {
    let s = shop("occupied_label.wal").await;
    let date = day(2);
    s.engine
        .book_appointment(&Actor::customer(Ulid::new()), request(s.service, date, TimeSlot::At1300))
        .await
        .unwrap();
    let err = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(s.service, date, TimeSlot::At1300))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1:00 PM"), "{err}");
}

#[tokio::test]
async fn horizon_boundaries() {
    let s = shop("horizon.wal").await;
    let cust = Actor::customer(Ulid::new());

    let err = s
        .engine
        .book_appointment(&cust, request(s.service, day(-1), TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PastDate(_)));

    let err = s
        .engine
        .book_appointment(&cust, request(s.service, day(31), TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HorizonExceeded { horizon_days: 30, .. }));

    assert_ok!(s.engine.book_appointment(&cust, request(s.service, day(30), TimeSlot::At0900)).await);
    assert_ok!(s.engine.book_appointment(&cust, request(s.service, day(0), TimeSlot::At1700)).await);
}

#[tokio::test]
async fn past_dates_show_no_availability() {
    let s = shop("past_availability.wal").await;
    assert!(s.engine.available_slots(day(-2)).await.is_empty());
    assert_eq!(s.engine.available_slots(day(2)).await, TimeSlot::ALL.to_vec());
}

#[tokio::test]
async fn only_customers_book_active_services() {
    let s = shop("booking_preconditions.wal").await;
    let date = day(4);

    let err = s
        .engine
        .book_appointment(&s.emp, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));

    let err = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(Ulid::new(), date, TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let withdrawn = Ulid::new();
    s.engine
        .register_service(
            &Actor::admin(),
            Service {
                id: withdrawn,
                name: "Detailing".into(),
                estimated_duration: None,
                active: false,
            },
        )
        .await
        .unwrap();
    let err = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(withdrawn, date, TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ServiceInactive(_)));
    assert_eq!(s.engine.available_slots(date).await.len(), 5);
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_leaking_the_slot() {
    let s = shop("duplicate_id.wal").await;
    let cust = Actor::customer(Ulid::new());
    let first = request(s.service, day(5), TimeSlot::At0900);
    s.engine.book_appointment(&cust, first.clone()).await.unwrap();

    let mut again = request(s.service, day(5), TimeSlot::At1100);
    again.id = first.id;
    let err = s.engine.book_appointment(&cust, again).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    assert!(s.engine.available_slots(day(5)).await.contains(&TimeSlot::At1100));

    // A refused booking does not leave its id claimed.
    let blocked = request(s.service, day(5), TimeSlot::At0900);
    let blocked_id = blocked.id;
    assert_err!(s.engine.book_appointment(&cust, blocked).await);
    let mut retry = request(s.service, day(5), TimeSlot::At1500);
    retry.id = blocked_id;
    assert_ok!(s.engine.book_appointment(&cust, retry).await);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn completion_and_cancellation_release_the_slot() {
    let s = shop("release.wal").await;
    let date = day(6);
    let cust = Actor::customer(Ulid::new());

    let a = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap();
    s.engine.cancel_appointment(&cust, a.id).await.unwrap();
    assert!(s.engine.available_slots(date).await.contains(&TimeSlot::At0900));

    let b = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp, b.id, AppointmentAction::Assign { employee: s.emp.id })
        .await
        .unwrap();
    assert!(!s.engine.available_slots(date).await.contains(&TimeSlot::At0900));
    s.engine
        .transition_appointment(&s.emp, b.id, AppointmentAction::Complete)
        .await
        .unwrap();
    assert!(s.engine.available_slots(date).await.contains(&TimeSlot::At0900));

    // both old records remain as history
    let history = s.engine.list_appointments(&cust, AppointmentFilter::Date(date)).await;
    let statuses: Vec<_> = history.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![AppointmentStatus::Cancelled, AppointmentStatus::Completed]);
}

#[tokio::test]
async fn end_to_end_scenario() {
    let s = shop("scenario.wal").await;
    let date = day(7);
    let alice = Actor::customer(Ulid::new());
    let bob = Actor::customer(Ulid::new());

    let a = s
        .engine
        .book_appointment(&alice, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap();
    assert_eq!(a.status, AppointmentStatus::Booked);

    let err = s
        .engine
        .book_appointment(&bob, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotOccupied(_)));

    let a = s
        .engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Assign { employee: s.emp.id })
        .await
        .unwrap();
    assert_eq!(a.status, AppointmentStatus::Assigned);

    let a = s
        .engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Start)
        .await
        .unwrap();
    assert_eq!(a.status, AppointmentStatus::InProgress);
    let started = a.work_started_at.unwrap();
    assert_eq!(a.estimated_completion, Some(started + HOUR));

    let a = s
        .engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Complete)
        .await
        .unwrap();
    assert_eq!(a.status, AppointmentStatus::Completed);
    assert!(a.work_completed_at.unwrap() >= started);
    assert!(s.engine.available_slots(date).await.contains(&TimeSlot::At0900));
}

#[tokio::test]
async fn completing_unassigned_booking_is_invalid() {
    let s = shop("complete_unassigned.wal").await;
    let a = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(s.service, day(1), TimeSlot::At1100))
        .await
        .unwrap();
    let err = s
        .engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let err = s
        .engine
        .transition_appointment(&s.emp, Ulid::new(), AppointmentAction::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn non_assignee_cannot_start() {
    let s = shop("non_assignee.wal").await;
    let a = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(s.service, day(1), TimeSlot::At1500))
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Assign { employee: s.emp.id })
        .await
        .unwrap();
    let err = s
        .engine
        .transition_appointment(&s.emp2, a.id, AppointmentAction::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAssigned(_)));
}

#[tokio::test]
async fn target_status_updates_pick_the_matching_action() {
    let s = shop("target_status.wal").await;
    let customer = Actor::customer(Ulid::new());
    let a = s
        .engine
        .book_appointment(&customer, request(s.service, day(1), TimeSlot::At1300))
        .await
        .unwrap();

    let to = |status| AppointmentUpdate {
        status: Some(status),
        ..Default::default()
    };

    // Staff picking up work without naming anyone assign themselves.
    let picked = s
        .engine
        .update_appointment(&s.emp, a.id, to(AppointmentStatus::Assigned))
        .await
        .unwrap();
    assert_eq!(picked.assigned_employee, Some(s.emp.id));

    let err = s
        .engine
        .update_appointment(&s.emp, a.id, to(AppointmentStatus::Booked))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: "assigned",
            to: "booked"
        }
    ));

    let started = s
        .engine
        .update_appointment(
            &s.emp,
            a.id,
            AppointmentUpdate {
                status: Some(AppointmentStatus::InProgress),
                work_notes: Some("rotors scored".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(started.status, AppointmentStatus::InProgress);
    assert_eq!(started.work_notes.as_deref(), Some("rotors scored"));

    // Only booked appointments can be cancelled, whichever route is taken.
    let err = s
        .engine
        .update_appointment(&customer, a.id, to(AppointmentStatus::Cancelled))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable { .. }));

    // Admins must name the assignee.
    let b = s
        .engine
        .book_appointment(&customer, request(s.service, day(1), TimeSlot::At1500))
        .await
        .unwrap();
    let err = s
        .engine
        .update_appointment(&Actor::admin(), b.id, to(AppointmentStatus::Assigned))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    assert_ok!(
        s.engine
            .update_appointment(&customer, b.id, to(AppointmentStatus::Cancelled))
            .await
    );
}

#[tokio::test]
async fn supervisor_assigns_only_active_employees() {
    let s = shop("assign_inactive.wal").await;
    let admin = Actor::admin();
    let a = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(s.service, day(2), TimeSlot::At0900))
        .await
        .unwrap();

    s.engine
        .update_employee(
            &admin,
            s.emp2.id,
            EmployeePatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = s
        .engine
        .transition_appointment(&s.boss, a.id, AppointmentAction::Assign { employee: s.emp2.id })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EmployeeInactive(_)));

    let a = s
        .engine
        .transition_appointment(&s.boss, a.id, AppointmentAction::Assign { employee: s.emp.id })
        .await
        .unwrap();
    assert_eq!(a.assigned_employee, Some(s.emp.id));
}

#[tokio::test]
async fn cancel_is_owner_or_admin_and_booked_only() {
    let s = shop("cancel_rules.wal").await;
    let owner = Actor::customer(Ulid::new());
    let a = s
        .engine
        .book_appointment(&owner, request(s.service, day(3), TimeSlot::At1100))
        .await
        .unwrap();

    let err = s
        .engine
        .cancel_appointment(&Actor::customer(Ulid::new()), a.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));

    s.engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Assign { employee: s.emp.id })
        .await
        .unwrap();
    let err = s.engine.cancel_appointment(&owner, a.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable { .. }));

    let b = s
        .engine
        .book_appointment(&owner, request(s.service, day(3), TimeSlot::At1300))
        .await
        .unwrap();
    let b = s.engine.cancel_appointment(&Actor::admin(), b.id).await.unwrap();
    assert_eq!(b.status, AppointmentStatus::Cancelled);
}

// ── Work assignments ─────────────────────────────────────

fn new_task(assignee: Ulid, appointment_id: Option<Ulid>) -> NewAssignment {
    NewAssignment {
        id: Ulid::new(),
        assigned_to: assignee,
        title: "Inspect brakes".into(),
        description: "front and rear".into(),
        priority: Priority::High,
        due_at: guard::now_ms() + 24 * HOUR,
        appointment_id,
    }
}

#[tokio::test]
async fn only_super_employees_delegate() {
    let s = shop("delegate_permission.wal").await;
    let err = s
        .engine
        .create_assignment(&s.emp, new_task(s.emp2.id, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));

    let task = s
        .engine
        .create_assignment(&s.boss, new_task(s.emp.id, None))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assigned_by, s.boss.id);
}

#[tokio::test]
async fn supervisors_delegate_only_to_their_reports() {
    let s = shop("delegate_reports.wal").await;
    let other = Employee::new(Ulid::new(), "SUP999".into(), EmployeeKind::Super);
    s.engine.register_employee(&Actor::admin(), other.clone()).await.unwrap();
    let other = Actor::supervisor(other.id);

    let err = s
        .engine
        .create_assignment(&other, new_task(s.emp.id, None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));
    assert!(s.engine.list_assignments(&Actor::admin(), AssignmentFilter::All).await.unwrap().is_empty());

    // Admins are not bound to a reporting line.
    assert_ok!(
        s.engine
            .create_assignment(&Actor::admin(), new_task(s.emp.id, None))
            .await
    );
}

#[tokio::test]
async fn concurrent_assignments_with_one_id_admit_exactly_one() {
    let s = shop("assignment_id_race.wal").await;
    let task = new_task(s.emp.id, None);

    let (a, b) = tokio::join!(
        s.engine.create_assignment(&s.boss, task.clone()),
        s.engine.create_assignment(&s.boss, task.clone()),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let all = s.engine.list_assignments(&Actor::admin(), AssignmentFilter::All).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn linked_assignment_assigns_and_completes_with_appointment() {
    let s = shop("linked_assignment.wal").await;
    let a = s
        .engine
        .book_appointment(&Actor::customer(Ulid::new()), request(s.service, day(2), TimeSlot::At1500))
        .await
        .unwrap();

    let task = s
        .engine
        .create_assignment(&s.boss, new_task(s.emp.id, Some(a.id)))
        .await
        .unwrap();
    let linked = &s.engine.list_appointments(&s.boss, AppointmentFilter::Id(a.id)).await[0];
    assert_eq!(linked.status, AppointmentStatus::Assigned);
    assert_eq!(linked.assigned_employee, Some(s.emp.id));

    // a second task for someone else cannot steal the appointment
    let err = s
        .engine
        .create_assignment(&s.boss, new_task(s.emp2.id, Some(a.id)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    s.engine
        .update_assignment(
            &s.emp,
            task.id,
            AssignmentUpdate {
                status: Some(TaskStatus::Accepted),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Start)
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp, a.id, AppointmentAction::Complete)
        .await
        .unwrap();

    let tasks = s
        .engine
        .list_assignments(&s.boss, AssignmentFilter::Appointment(a.id))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].progress, 100);
    assert!(tasks[0].completed_at.is_some());
    assert!(tasks[0].accepted_at.is_some());
}

#[tokio::test]
async fn assignment_progress_is_clamped() {
    let s = shop("progress_clamp.wal").await;
    let task = s
        .engine
        .create_assignment(&s.boss, new_task(s.emp.id, None))
        .await
        .unwrap();

    let update = |progress| AssignmentUpdate {
        progress: Some(progress),
        ..Default::default()
    };
    let t = s.engine.update_assignment(&s.emp, task.id, update(150)).await.unwrap();
    assert_eq!(t.progress, 100);
    let t = s.engine.update_assignment(&s.emp, task.id, update(-10)).await.unwrap();
    assert_eq!(t.progress, 0);

    let err = s
        .engine
        .update_assignment(&s.boss, task.id, update(10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));
}

#[tokio::test]
async fn customers_cannot_see_assignments() {
    let s = shop("assignment_visibility.wal").await;
    s.engine
        .create_assignment(&s.boss, new_task(s.emp.id, None))
        .await
        .unwrap();
    assert_err!(
        s.engine
            .list_assignments(&Actor::customer(Ulid::new()), AssignmentFilter::All)
            .await
    );
    let mine = s.engine.list_assignments(&s.emp, AssignmentFilter::All).await.unwrap();
    assert_eq!(mine.len(), 1);
    let theirs = s.engine.list_assignments(&s.emp2, AssignmentFilter::All).await.unwrap();
    assert!(theirs.is_empty());
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn employee_codes_are_unique_and_cycles_rejected() {
    let s = shop("directory_rules.wal").await;
    let admin = Actor::admin();

    let dup = Employee::new(Ulid::new(), "EMP001".into(), EmployeeKind::Regular);
    let err = s.engine.register_employee(&admin, dup).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let mid = Employee::new(Ulid::new(), "SUP002".into(), EmployeeKind::Super);
    s.engine.register_employee(&admin, mid.clone()).await.unwrap();
    s.engine
        .update_employee(
            &admin,
            mid.id,
            EmployeePatch {
                supervisor_id: Some(Some(s.boss.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = s
        .engine
        .update_employee(
            &admin,
            s.boss.id,
            EmployeePatch {
                supervisor_id: Some(Some(mid.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected(_)));

    let err = s
        .engine
        .register_employee(&s.boss, Employee::new(Ulid::new(), "EMP009".into(), EmployeeKind::Regular))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));
}

#[tokio::test]
async fn status_changes_need_self_or_supervisor() {
    let s = shop("employee_status.wal").await;
    let on_break = |status| EmployeePatch {
        status: Some(status),
        ..Default::default()
    };

    let e = s
        .engine
        .update_employee(&s.emp, s.emp.id, on_break(EmployeeStatus::Break))
        .await
        .unwrap();
    assert_eq!(e.status, EmployeeStatus::Break);

    let err = s
        .engine
        .update_employee(&s.emp2, s.emp.id, on_break(EmployeeStatus::OffDuty))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));

    let e = s
        .engine
        .update_employee(&s.boss, s.emp.id, on_break(EmployeeStatus::Busy))
        .await
        .unwrap();
    assert_eq!(e.status, EmployeeStatus::Busy);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn daily_detail_matches_availability() {
    let s = shop("daily_detail.wal").await;
    let date = day(8);
    let cust = Actor::customer(Ulid::new());
    let a = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At1100))
        .await
        .unwrap();

    let detail = s.engine.daily_detail(date).await;
    assert_eq!((detail.total, detail.occupied, detail.available), (5, 1, 4));
    assert_eq!(detail.available, s.engine.available_slots(date).await.len());
    let row = &detail.slots[TimeSlot::At1100.index()];
    let occupant = row.occupant.as_ref().unwrap();
    assert_eq!(occupant.appointment_id, a.id);
    assert_eq!(occupant.service, "Oil change");
    assert_eq!(occupant.vehicle, "Honda Civic");

    let summary = s.engine.daily_summary(date).await;
    assert!(summary.slots.is_empty());
    assert_eq!(summary.occupied, 1);
}

#[tokio::test]
async fn customers_only_see_their_own_appointments() {
    let s = shop("visibility.wal").await;
    let alice = Actor::customer(Ulid::new());
    let bob = Actor::customer(Ulid::new());
    s.engine
        .book_appointment(&alice, request(s.service, day(1), TimeSlot::At0900))
        .await
        .unwrap();
    s.engine
        .book_appointment(&bob, request(s.service, day(1), TimeSlot::At1100))
        .await
        .unwrap();

    assert_eq!(s.engine.list_appointments(&alice, AppointmentFilter::All).await.len(), 1);
    assert_eq!(s.engine.list_appointments(&s.emp, AppointmentFilter::All).await.len(), 2);
    assert!(
        s.engine
            .list_appointments(&alice, AppointmentFilter::Customer(bob.id))
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn available_work_lists_unassigned_bookings_in_order() {
    let s = shop("available_work.wal").await;
    let cust = Actor::customer(Ulid::new());
    let late = s
        .engine
        .book_appointment(&cust, request(s.service, day(2), TimeSlot::At0900))
        .await
        .unwrap();
    let early = s
        .engine
        .book_appointment(&cust, request(s.service, day(1), TimeSlot::At1500))
        .await
        .unwrap();
    let taken = s
        .engine
        .book_appointment(&cust, request(s.service, day(1), TimeSlot::At0900))
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp, taken.id, AppointmentAction::Assign { employee: s.emp.id })
        .await
        .unwrap();

    let ids: Vec<_> = s.engine.available_work().await.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
}

#[tokio::test]
async fn completions_without_a_start_are_not_counted() {
    let s = shop("unstarted_completion.wal").await;
    let cust = Actor::customer(Ulid::new());
    let a = s
        .engine
        .book_appointment(&cust, request(s.service, day(2), TimeSlot::At1700))
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp2, a.id, AppointmentAction::Assign { employee: s.emp2.id })
        .await
        .unwrap();
    let done = s
        .engine
        .transition_appointment(&s.emp2, a.id, AppointmentAction::Complete)
        .await
        .unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert!(done.work_started_at.is_none());

    let profile = &s.engine.employee_profiles(Some(s.emp2.id)).await[0];
    assert_eq!(profile.tasks_completed, 0);
    assert_eq!(profile.avg_completion_ms, None);
    assert_eq!(profile.pending_tasks, 0);
}

#[tokio::test]
async fn profiles_and_workload_are_derived() {
    let s = shop("profiles.wal").await;
    let cust = Actor::customer(Ulid::new());
    let date = day(1);

    let done = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap();
    let open = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At1100))
        .await
        .unwrap();
    for id in [done.id, open.id] {
        s.engine
            .transition_appointment(&s.emp, id, AppointmentAction::Assign { employee: s.emp.id })
            .await
            .unwrap();
    }
    s.engine
        .transition_appointment(&s.emp, done.id, AppointmentAction::Start)
        .await
        .unwrap();
    s.engine
        .transition_appointment(&s.emp, done.id, AppointmentAction::Complete)
        .await
        .unwrap();

    assert_eq!(s.engine.pending_task_count(s.emp.id).await, 1);
    let profile = &s.engine.employee_profiles(Some(s.emp.id)).await[0];
    assert_eq!(profile.pending_tasks, 1);
    assert_eq!(profile.tasks_completed, 1);
    assert!(profile.avg_completion_ms.is_some_and(|ms| ms >= 0));

    let mut overdue = new_task(s.emp2.id, None);
    overdue.due_at = guard::now_ms() - HOUR;
    s.engine.create_assignment(&s.boss, overdue).await.unwrap();

    let rows = s.engine.workload(&s.boss, s.boss.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].code.as_str(), rows[0].active_appointments), ("EMP001", 1));
    assert_eq!(
        (rows[1].code.as_str(), rows[1].open_assignments, rows[1].overdue_assignments),
        ("EMP002", 1, 1)
    );

    assert_err!(s.engine.workload(&s.emp, s.boss.id).await);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let admin = Actor::admin();
    let cust = Actor::customer(Ulid::new());
    let service = Ulid::new();
    let emp = Employee::new(Ulid::new(), "EMP100".into(), EmployeeKind::Regular);
    let date = day(4);

    let (booked_id, cancelled_id) = {
        let engine = Engine::new(path.clone(), 30).unwrap();
        engine
            .register_service(
                &admin,
                Service {
                    id: service,
                    name: "Tyres".into(),
                    estimated_duration: None,
                    active: true,
                },
            )
            .await
            .unwrap();
        engine.register_employee(&admin, emp.clone()).await.unwrap();
        let a = engine
            .book_appointment(&cust, request(service, date, TimeSlot::At0900))
            .await
            .unwrap();
        engine
            .transition_appointment(&Actor::employee(emp.id), a.id, AppointmentAction::Assign { employee: emp.id })
            .await
            .unwrap();
        let b = engine
            .book_appointment(&cust, request(service, date, TimeSlot::At1100))
            .await
            .unwrap();
        engine.cancel_appointment(&cust, b.id).await.unwrap();
        (a.id, b.id)
    };

    let engine = Engine::new(path, 30).unwrap();
    assert_eq!(
        engine.available_slots(date).await,
        vec![TimeSlot::At1100, TimeSlot::At1300, TimeSlot::At1500, TimeSlot::At1700]
    );
    let all = engine.list_appointments(&admin, AppointmentFilter::All).await;
    assert_eq!(all.len(), 2);
    let a = all.iter().find(|a| a.id == booked_id).unwrap();
    assert_eq!(a.status, AppointmentStatus::Assigned);
    assert_eq!(a.assigned_employee, Some(emp.id));
    let b = all.iter().find(|a| a.id == cancelled_id).unwrap();
    assert_eq!(b.status, AppointmentStatus::Cancelled);
    assert_eq!(engine.directory.employee(&emp.id).unwrap().code, "EMP100");

    // the replayed index still guards the slot
    let err = engine
        .book_appointment(&cust, request(service, date, TimeSlot::At0900))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotOccupied(_)));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let date = day(2);
    let (service, boss, emp, task_id) = {
        let engine = Engine::new(path.clone(), 30).unwrap();
        let admin = Actor::admin();
        let service = Ulid::new();
        engine
            .register_service(
                &admin,
                Service {
                    id: service,
                    name: "Battery".into(),
                    estimated_duration: Some(HOUR),
                    active: true,
                },
            )
            .await
            .unwrap();
        let boss = Employee::new(Ulid::new(), "SUP500".into(), EmployeeKind::Super);
        engine.register_employee(&admin, boss.clone()).await.unwrap();
        let mut emp = Employee::new(Ulid::new(), "EMP500".into(), EmployeeKind::Regular);
        emp.supervisor_id = Some(boss.id);
        engine.register_employee(&admin, emp.clone()).await.unwrap();

        let cust = Actor::customer(Ulid::new());
        for slot in [TimeSlot::At0900, TimeSlot::At1100] {
            let a = engine.book_appointment(&cust, request(service, date, slot)).await.unwrap();
            if slot == TimeSlot::At1100 {
                engine.cancel_appointment(&cust, a.id).await.unwrap();
            }
        }
        let task = engine
            .create_assignment(&Actor::supervisor(boss.id), new_task(emp.id, None))
            .await
            .unwrap();
        assert!(engine.appends_since_compact().await >= 6);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.appends_since_compact().await, 0);
        (service, boss, emp, task.id)
    };

    let engine = Engine::new(path, 30).unwrap();
    assert!(engine.directory.service(&service).is_some());
    assert_eq!(engine.directory.subordinates(&boss.id), vec![emp.id]);
    assert_eq!(engine.daily_summary(date).await.occupied, 1);
    assert_eq!(
        engine
            .list_appointments(&Actor::admin(), AppointmentFilter::Status(AppointmentStatus::Cancelled))
            .await
            .len(),
        1
    );
    assert!(engine.get_task(&task_id).is_some());
}

#[tokio::test]
async fn purge_drops_only_old_terminal_appointments() {
    let s = shop("purge.wal").await;
    let cust = Actor::customer(Ulid::new());
    let date = day(1);

    let cancelled = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At0900))
        .await
        .unwrap();
    s.engine.cancel_appointment(&cust, cancelled.id).await.unwrap();
    let active = s
        .engine
        .book_appointment(&cust, request(s.service, date, TimeSlot::At1100))
        .await
        .unwrap();

    // nothing is older than today
    assert_eq!(s.engine.purge_appointments(day(0)).await.unwrap(), 0);

    let purged = s.engine.purge_appointments(day(5)).await.unwrap();
    assert_eq!(purged, 1);
    let left = s.engine.list_appointments(&Actor::admin(), AppointmentFilter::All).await;
    assert_eq!(left.iter().map(|a| a.id).collect::<Vec<_>>(), vec![active.id]);
    assert!(s.engine.slot_for_appointment(&cancelled.id).is_none());
    assert!(s.engine.get_slot(&SlotKey::new(date, TimeSlot::At0900)).is_none());
}
