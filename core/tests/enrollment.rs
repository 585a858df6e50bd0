//! Enrollment: eligibility, daily cap, duplicates, reporting snapshot.

mod common;

use common::*;
use experiment_core::{
    clinical::Patient,
    config::ExperimentConfig,
    eligibility::{AxisFilter, FilterSpec},
    engine::ExperimentEngine,
    error::ExperimentError,
    event::ExperimentEvent,
    membership::{Membership, MembershipStatus},
    store::ExperimentStore,
};
use std::{sync::Barrier, thread};

fn enrolled(events: &[ExperimentEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ExperimentEvent::PatientEnrolled { .. }))
        .count()
}

#[test]
fn daily_cap_limits_enrollment_per_day() {
    let engine = engine();
    populate(engine.store(), 5);
    let mut s = seed("capped", &[(0, "notifications.basic")]);
    s.max_patients_per_day = 3;
    let experiment = insert(&engine, &s);

    let summary = engine.conduct_daily(day(1)).unwrap();
    assert_eq!(summary.enrolled, 3);
    assert_eq!(engine.store().count_enrolled_on(&experiment.experiment_id, day(1)).unwrap(), 3);

    // Same day again: the cap is already used up.
    let again = engine.conduct_daily(day(1)).unwrap();
    assert_eq!(again.enrolled, 0);
    assert_eq!(engine.store().count_memberships(&experiment.experiment_id, None).unwrap(), 3);

    // Next day the two remaining patients come in.
    let next = engine.conduct_daily(day(2)).unwrap();
    assert_eq!(next.enrolled, 2);
    assert_eq!(engine.store().count_enrolled_on(&experiment.experiment_id, day(2)).unwrap(), 2);
}

#[test]
fn requested_limit_is_clamped_by_remaining_cap() {
    let engine = engine();
    populate(engine.store(), 6);
    let mut s = seed("clamped", &[(0, "notifications.basic")]);
    s.max_patients_per_day = 4;
    insert(&engine, &s);

    let first = engine.enroll_patients("clamped", day(1), &FilterSpec::default(), 3).unwrap();
    assert_eq!(enrolled(&first), 3);

    // Only one slot left even though ten were asked for.
    let second = engine.enroll_patients("clamped", day(1), &FilterSpec::default(), 10).unwrap();
    assert_eq!(enrolled(&second), 1);

    let third = engine.enroll_patients("clamped", day(1), &FilterSpec::default(), 10).unwrap();
    assert!(matches!(third.as_slice(), [ExperimentEvent::DailyCapReached { enrolled: 4, cap: 4, .. }]));
}

#[test]
fn base_predicate_excludes_ineligible_patients() {
    let engine = engine();
    let store = engine.store();
    add_facility(store, "f1", "Punjab", "north");

    add_patient(store, "eligible", "f1");
    let variants: Vec<(&str, Box<dyn Fn(&mut Patient)>)> = vec![
        ("no-phone", Box::new(|p: &mut Patient| p.phone_number = None)),
        ("blank-phone", Box::new(|p: &mut Patient| p.phone_number = Some("  ".into()))),
        ("inactive-phone", Box::new(|p: &mut Patient| p.phone_active = false)),
        ("no-htn", Box::new(|p: &mut Patient| p.has_hypertension = false)),
        ("minor", Box::new(|p: &mut Patient| p.birth_date = day(1) - chrono::Duration::days(17 * 365))),
        ("deleted", Box::new(|p: &mut Patient| p.deleted_at = Some(at(1, 0)))),
        ("no-facility", Box::new(|p: &mut Patient| p.assigned_facility_id = None)),
    ];
    for (id, tweak) in &variants {
        let mut patient = eligible_patient(id, "f1");
        tweak(&mut patient);
        store.insert_patient(&patient).unwrap();
    }
    let experiment = insert(&engine, &seed("predicate", &[]));

    let summary = engine.conduct_daily(day(1)).unwrap();
    assert_eq!(summary.enrolled, 1);
    assert!(store.get_membership(&experiment.experiment_id, "eligible").unwrap().is_some());
}

#[test]
fn disjoint_axis_filters_select_nobody() {
    let engine = engine();
    let store = engine.store();
    add_facility(store, "fa", "Punjab", "north");
    add_facility(store, "fb", "Kerala", "south");
    add_patient(store, "pa", "fa");
    add_patient(store, "pb", "fb");
    insert(&engine, &seed("disjoint", &[]));

    let filters = FilterSpec {
        states: Some(AxisFilter::Include(vec!["Punjab".into()])),
        blocks: None,
        facilities: Some(AxisFilter::Include(vec!["fb".into()])),
    };
    let events = engine.enroll_patients("disjoint", day(1), &filters, 100).unwrap();
    assert!(events.is_empty(), "expected no enrollments, got {events:?}");
}

#[test]
fn include_and_exclude_axes_narrow_population() {
    let engine = engine();
    let store = engine.store();
    add_facility(store, "fa", "Punjab", "north");
    add_facility(store, "fb", "Punjab", "south");
    add_facility(store, "fc", "Kerala", "coast");
    add_patient(store, "pa", "fa");
    add_patient(store, "pb", "fb");
    add_patient(store, "pc", "fc");
    let mut s = seed("narrowed", &[]);
    s.filters = FilterSpec {
        states: Some(AxisFilter::Include(vec!["Punjab".into()])),
        blocks: Some(AxisFilter::Exclude(vec!["block-south".into()])),
        facilities: None,
    };
    let experiment = insert(&engine, &s);

    engine.conduct_daily(day(1)).unwrap();
    let members: Vec<bool> = ["pa", "pb", "pc"]
        .iter()
        .map(|p| store.get_membership(&experiment.experiment_id, p).unwrap().is_some())
        .collect();
    assert_eq!(members, vec![true, false, false]);
}

#[test]
fn invalid_filter_json_is_rejected() {
    let err = FilterSpec::from_json(r#"{"states": {"include": ["A"], "exclude": ["B"]}}"#).unwrap_err();
    assert!(matches!(err, ExperimentError::InvalidFilter { .. }), "got {err:?}");
}

#[test]
fn recent_membership_elsewhere_blocks_enrollment() {
    let engine = engine();
    populate(engine.store(), 1);

    // A finished experiment that enrolled p00 on March 1.
    let mut old = seed("finished", &[]);
    old.end_date = day(2);
    let old = insert(&engine, &old);
    engine.conduct_daily(day(1)).unwrap();
    assert!(engine.store().get_membership(&old.experiment_id, "p00").unwrap().is_some());

    // Starts after the old one ended, but inside the 14 day buffer.
    let mut fresh = seed("fresh", &[]);
    fresh.start_date = day(5);
    fresh.end_date = day(31);
    let fresh = insert(&engine, &fresh);
    engine.conduct_daily(day(10)).unwrap();
    assert!(engine.store().get_membership(&fresh.experiment_id, "p00").unwrap().is_none());

    // Past the buffer the patient is eligible again.
    engine.conduct_daily(day(16)).unwrap();
    assert!(engine.store().get_membership(&fresh.experiment_id, "p00").unwrap().is_some());
}

#[test]
fn second_membership_for_same_patient_is_skipped() {
    let engine = engine();
    populate(engine.store(), 2);
    let mut s = seed("preselected", &[]);
    s.state = experiment_core::experiment::ExperimentState::ActivePreselected;
    let experiment = insert(&engine, &s);

    let ids = vec!["p00".to_string(), "p01".to_string(), "p00".to_string()];
    let events = engine.enroll_preselected("preselected", day(1), &ids).unwrap();
    assert_eq!(enrolled(&events), 2);
    assert!(matches!(
        &events[2],
        ExperimentEvent::DuplicateEnrollmentSkipped { patient_id, .. } if patient_id == "p00"
    ));
    assert_eq!(engine.store().count_memberships(&experiment.experiment_id, None).unwrap(), 2);
}

#[test]
fn unique_index_violation_maps_to_duplicate_enrollment() {
    let engine = engine();
    populate(engine.store(), 1);
    let experiment = insert(&engine, &seed("direct", &[]));
    engine.conduct_daily(day(1)).unwrap();

    let existing = membership(&engine, &experiment, "p00");
    let copy = Membership {
        membership_id: "another-id".into(),
        ..existing
    };
    let err = engine.store().insert_membership(&copy).unwrap_err();
    assert!(
        matches!(&err, ExperimentError::DuplicateEnrollment { patient_id, .. } if patient_id == "p00"),
        "got {err:?}"
    );

    // A primary key clash is a different constraint and is not swallowed.
    let same_id = Membership {
        patient_id: "p-other".into(),
        ..membership(&engine, &experiment, "p00")
    };
    let err = engine.store().insert_membership(&same_id).unwrap_err();
    assert!(matches!(err, ExperimentError::Database(_)), "got {err:?}");
}

#[test]
fn unknown_preselected_patient_is_skipped_not_fatal() {
    let engine = engine();
    populate(engine.store(), 1);
    insert(&engine, &seed("with-ghost", &[]));

    let ids = vec!["ghost".to_string(), "p00".to_string()];
    let events = engine.enroll_preselected("with-ghost", day(1), &ids).unwrap();
    assert!(matches!(&events[0], ExperimentEvent::RecordSkipped { record_id, .. } if record_id == "ghost"));
    assert_eq!(enrolled(&events), 1);
}

#[test]
fn membership_snapshots_appointment_and_reporting_data() {
    let engine = engine();
    let store = engine.store();
    add_facility(store, "f1", "Punjab", "north");
    add_facility(store, "f2", "Punjab", "north");
    add_patient(store, "p1", "f1");

    // Older appointment, then the latest one at f2 with an explicit reminder date.
    store
        .insert_appointment(&scheduled_appointment("a-old", "p1", "f1", day(15), at(1, 7)))
        .unwrap();
    let mut latest = scheduled_appointment("a-new", "p1", "f2", day(25), at(1, 9));
    latest.remind_on = Some(day(27));
    store.insert_appointment(&latest).unwrap();
    add_blood_pressure(store, "bp-0", "p1", chrono::NaiveDate::from_ymd_opt(2024, 2, 20).unwrap().and_hms_opt(9, 0, 0).unwrap());

    let experiment = insert(&engine, &seed("snapshot", &[]));
    engine.conduct_daily(day(1)).unwrap();

    let m = membership(&engine, &experiment, "p1");
    assert_eq!(m.status, MembershipStatus::Enrolled);
    assert_eq!(m.experiment_inclusion_date, day(1));
    assert_eq!(m.appointment_id.as_deref(), Some("a-new"));
    assert_eq!(m.expected_return_date, Some(day(27)));
    assert!(m.messages.is_empty());

    let r = &m.reporting;
    assert_eq!(r.gender.as_deref(), Some("female"));
    assert_eq!(r.age, Some(53));
    assert_eq!(r.risk_level.as_deref(), Some("elevated"));
    assert!(r.diagnosed_htn);
    assert_eq!(r.appointment_creation_time, Some(at(1, 9)));
    assert_eq!(r.expected_return_facility.facility_id.as_deref(), Some("f2"));
    assert_eq!(r.expected_return_facility.name.as_deref(), Some("PHC f2"));
    assert_eq!(r.assigned_facility.state.as_deref(), Some("Punjab"));
    assert_eq!(r.registration_facility.block.as_deref(), Some("north"));
}

fn race_db_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("enrollment-race-{}.db", uuid::Uuid::new_v4()))
}

fn remove_db(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[test]
fn overlapping_runs_never_exceed_daily_cap() {
    init_logging();
    for trial in 0..5 {
        let path = race_db_path();
        let path_str = path.to_string_lossy().to_string();

        let store = ExperimentStore::open(&path_str).unwrap();
        store.migrate().unwrap();
        populate(&store, 60);
        let mut s = seed("race", &[(0, "only")]);
        s.max_patients_per_day = 10;
        let experiment = s.build();
        store.insert_experiment(&experiment).unwrap();

        let barrier = Barrier::new(2);
        let enrolled_by_run: Vec<usize> = thread::scope(|scope| {
            let runs: Vec<_> = (0..2)
                .map(|_| {
                    let barrier = &barrier;
                    let path_str = &path_str;
                    scope.spawn(move || {
                        let config = ExperimentConfig {
                            batch_size: 1,
                            ..ExperimentConfig::default_test()
                        };
                        let engine = ExperimentEngine::build(
                            config,
                            ExperimentStore::open(path_str).unwrap(),
                        );
                        barrier.wait();
                        let events = engine
                            .enroll_patients("race", day(1), &FilterSpec::default(), 10)
                            .unwrap();
                        enrolled(&events)
                    })
                })
                .collect();
            runs.into_iter().map(|run| run.join().unwrap()).collect()
        });

        let total = store.count_enrolled_on(&experiment.experiment_id, day(1)).unwrap();
        assert_eq!(total, 10, "trial {trial}: {enrolled_by_run:?}");
        assert_eq!(enrolled_by_run.iter().sum::<usize>(), 10, "trial {trial}");

        drop(store);
        remove_db(&path);
    }
}

#[test]
fn capped_insert_refuses_once_day_is_full() {
    let engine = engine();
    populate(engine.store(), 3);
    let mut s = seed("full", &[(0, "only")]);
    s.max_patients_per_day = 2;
    let experiment = insert(&engine, &s);

    engine.enroll_preselected("full", day(1), &["p00".to_string(), "p01".to_string()]).unwrap();
    let third = Membership {
        membership_id: "m-third".into(),
        patient_id: "p02".into(),
        ..membership(&engine, &experiment, "p00")
    };
    assert!(!engine.store().insert_membership_within_cap(&third, 2).unwrap());
    assert!(engine.store().get_membership(&experiment.experiment_id, "p02").unwrap().is_none());

    // A new day has room again.
    let next_day = Membership { experiment_inclusion_date: day(2), ..third };
    assert!(engine.store().insert_membership_within_cap(&next_day, 2).unwrap());
}
