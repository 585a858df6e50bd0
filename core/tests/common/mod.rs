//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use experiment_core::{
    clinical::{Appointment, AppointmentStatus, BloodPressure, Facility, Patient},
    config::{ExperimentSeed, GroupSeed, TemplateSeed},
    delivery::{DeliveryChannel, DispatchReceipt, OutboundMessage},
    eligibility::FilterSpec,
    engine::ExperimentEngine,
    error::{ExperimentError, ExperimentResult},
    experiment::{Experiment, ExperimentState, ExperimentType},
    membership::Membership,
    notification::{Channel, DeliveryStatus},
    store::ExperimentStore,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn engine() -> ExperimentEngine {
    init_logging();
    ExperimentEngine::build_test(42).expect("test engine")
}

/// March 2024.
pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

pub fn at(d: u32, hour: u32) -> NaiveDateTime {
    day(d).and_hms_opt(hour, 0, 0).unwrap()
}

// ── Clinical data ──────────────────────────────────────────────

pub fn add_facility(store: &ExperimentStore, id: &str, state: &str, block: &str) {
    store
        .insert_facility(&Facility {
            facility_id: id.into(),
            name: format!("PHC {id}"),
            facility_type: "PHC".into(),
            block_region_id: format!("block-{block}"),
            block: block.into(),
            district: "Bathinda".into(),
            state: state.into(),
        })
        .expect("insert facility");
}

pub fn eligible_patient(id: &str, facility_id: &str) -> Patient {
    Patient {
        patient_id: id.into(),
        full_name: format!("Patient {id}"),
        gender: "female".into(),
        birth_date: NaiveDate::from_ymd_opt(1970, 6, 15).unwrap(),
        phone_number: Some("+919800000000".into()),
        phone_active: true,
        has_hypertension: true,
        assigned_facility_id: Some(facility_id.into()),
        registration_facility_id: Some(facility_id.into()),
        deleted_at: None,
    }
}

pub fn add_patient(store: &ExperimentStore, id: &str, facility_id: &str) {
    store.insert_patient(&eligible_patient(id, facility_id)).expect("insert patient");
}

pub fn scheduled_appointment(
    id: &str,
    patient_id: &str,
    facility_id: &str,
    scheduled_date: NaiveDate,
    created_at: NaiveDateTime,
) -> Appointment {
    Appointment {
        appointment_id: id.into(),
        patient_id: patient_id.into(),
        facility_id: facility_id.into(),
        creation_facility_id: Some(facility_id.into()),
        scheduled_date,
        remind_on: None,
        status: AppointmentStatus::Scheduled,
        created_at,
    }
}

pub fn add_appointment(store: &ExperimentStore, id: &str, patient_id: &str, facility_id: &str) {
    store
        .insert_appointment(&scheduled_appointment(id, patient_id, facility_id, day(20), at(1, 8)))
        .expect("insert appointment");
}

/// Facility "f1" in Punjab plus `n` eligible patients p00.. each with an appointment.
pub fn populate(store: &ExperimentStore, n: usize) -> Vec<String> {
    add_facility(store, "f1", "Punjab", "north");
    (0..n)
        .map(|i| {
            let id = format!("p{i:02}");
            add_patient(store, &id, "f1");
            add_appointment(store, &format!("a-{id}"), &id, "f1");
            id
        })
        .collect()
}

pub fn add_blood_pressure(store: &ExperimentStore, id: &str, patient_id: &str, recorded_at: NaiveDateTime) {
    store
        .insert_blood_pressure(&BloodPressure {
            id: id.into(),
            patient_id: patient_id.into(),
            facility_id: "f1".into(),
            systolic: 150,
            diastolic: 95,
            recorded_at,
            deleted_at: None,
        })
        .expect("insert blood pressure");
}

// ── Experiments ────────────────────────────────────────────────

/// Active, selecting, March 1-10, one group with the given (offset, message) templates.
pub fn seed(lookup_name: &str, templates: &[(i64, &str)]) -> ExperimentSeed {
    ExperimentSeed {
        lookup_name: lookup_name.into(),
        experiment_type: ExperimentType::CurrentPatientReminder,
        state: ExperimentState::ActiveSelecting,
        start_date: day(1),
        end_date: day(10),
        max_patients_per_day: 100,
        filters: FilterSpec::default(),
        treatment_groups: vec![GroupSeed {
            description: "reminders".into(),
            weight: 1.0,
            reminder_templates: templates
                .iter()
                .map(|(days, message)| TemplateSeed {
                    remind_on_in_days: *days,
                    message: (*message).into(),
                })
                .collect(),
        }],
    }
}

pub fn insert(engine: &ExperimentEngine, seed: &ExperimentSeed) -> Experiment {
    let experiment = seed.build();
    engine.store().insert_experiment(&experiment).expect("insert experiment");
    experiment
}

pub fn membership(engine: &ExperimentEngine, experiment: &Experiment, patient_id: &str) -> Membership {
    engine
        .store()
        .get_membership(&experiment.experiment_id, patient_id)
        .expect("query membership")
        .unwrap_or_else(|| panic!("no membership for {patient_id}"))
}

pub fn template_id(experiment: &Experiment, offset: i64) -> String {
    experiment
        .templates()
        .find(|t| t.remind_on_in_days == offset)
        .map(|t| t.template_id.clone())
        .unwrap_or_else(|| panic!("no template with offset {offset}"))
}

// ── Delivery channels ──────────────────────────────────────────

/// Accepts every message; fails those whose message key is in `reject`.
pub struct FakeChannel {
    pub reject: Vec<String>,
}

impl FakeChannel {
    pub fn accepting() -> Self {
        Self { reject: Vec::new() }
    }

    pub fn rejecting(message: &str) -> Self {
        Self { reject: vec![message.into()] }
    }
}

impl DeliveryChannel for FakeChannel {
    fn send(&self, message: &OutboundMessage) -> ExperimentResult<DispatchReceipt> {
        if self.reject.contains(&message.message) {
            return Err(ExperimentError::Delivery {
                reason: format!("provider rejected {}", message.notification_id),
            });
        }
        Ok(DispatchReceipt {
            provider_message_id: format!("SM-{}", message.notification_id),
            initial_status: DeliveryStatus::Queued,
            channel: Channel::Whatsapp,
        })
    }
}
