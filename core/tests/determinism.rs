//! Same master seed, same group assignments.

mod common;

use common::*;
use experiment_core::{config::GroupSeed, engine::ExperimentEngine};
use std::collections::BTreeMap;

fn assignments(master_seed: u64) -> BTreeMap<String, String> {
    init_logging();
    let engine = ExperimentEngine::build_test(master_seed).unwrap();
    let patients = populate(engine.store(), 40);

    let mut two_arms = seed("split", &[(0, "only")]);
    two_arms.treatment_groups.push(GroupSeed {
        description: "control".into(),
        weight: 1.0,
        reminder_templates: Vec::new(),
    });
    let experiment = insert(&engine, &two_arms);
    assert_eq!(engine.conduct_daily(day(1)).unwrap().enrolled, 40);

    patients
        .into_iter()
        .map(|patient_id| {
            let m = membership(&engine, &experiment, &patient_id);
            let group = experiment.group(&m.treatment_group_id).expect("known group");
            (patient_id, group.description.clone())
        })
        .collect()
}

#[test]
fn same_seed_same_assignments() {
    assert_eq!(assignments(42), assignments(42));
}

#[test]
fn different_seeds_diverge() {
    assert_ne!(assignments(42), assignments(7));
}

#[test]
fn both_arms_receive_patients() {
    let by_group = assignments(42);
    for arm in ["reminders", "control"] {
        assert!(by_group.values().any(|g| g == arm), "{arm} got nobody");
    }
}
