//! Enrollment phase.
//!
//! Streams eligible patients in keyset pages, assigns each a treatment
//! group and persists a membership with a frozen reporting snapshot.
//! The daily cap is checked by the membership insert itself, so concurrent
//! runs never push a day past it. Racing enrollments of the same patient
//! collapse on the (patient, experiment) unique index and the loser is
//! skipped.

use crate::{
    clinical::{risk_level, Patient},
    cohort::CohortAssigner,
    eligibility::{EligibilityQuery, FilterSpec},
    error::{ExperimentError, ExperimentResult},
    event::ExperimentEvent,
    experiment::{Experiment, TreatmentGroup},
    ledger::MessageLedger,
    membership::{FacilitySnapshot, Membership, MembershipStatus, ReportingSnapshot},
    phase::{skip_record, DailyPhase, PhaseContext},
    rng::RandomSource,
    store::ExperimentStore,
    types::{new_id, now, PatientId},
};
use chrono::NaiveDate;

pub struct EnrollmentPhase;

impl DailyPhase for EnrollmentPhase {
    fn name(&self) -> &'static str {
        "enroll_patients"
    }

    fn applies(&self, experiment: &Experiment, date: NaiveDate) -> bool {
        experiment.is_enrolling(date)
    }

    fn run(
        &self,
        ctx: &PhaseContext<'_>,
        experiment: &Experiment,
        rng: &mut dyn RandomSource,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        enroll_patients(ctx, experiment, &experiment.filters, experiment.max_patients_per_day, rng)
    }
}

/// Enroll up to `min(requested_limit, cap - already enrolled today)` patients
/// matching `filters`.
pub fn enroll_patients(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    filters: &FilterSpec,
    requested_limit: i64,
    rng: &mut dyn RandomSource,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let assigner = CohortAssigner::new(experiment)?;
    let mut events = Vec::new();

    let already = ctx.store.count_enrolled_on(&experiment.experiment_id, ctx.date)?;
    let remaining = experiment.max_patients_per_day - already;
    if remaining <= 0 {
        log::debug!(
            "{}: daily cap of {} reached on {}",
            experiment.lookup_name,
            experiment.max_patients_per_day,
            ctx.date
        );
        events.push(ExperimentEvent::DailyCapReached {
            experiment_id: experiment.experiment_id.clone(),
            date:          ctx.date,
            enrolled:      already,
            cap:           experiment.max_patients_per_day,
        });
        return Ok(events);
    }
    let limit = remaining.min(requested_limit);
    if limit <= 0 {
        return Ok(events);
    }

    let query = EligibilityQuery::new(
        ctx.date,
        ctx.config.min_patient_age,
        ctx.config.monitoring_buffer_days,
        filters.clone(),
    );

    let mut enrolled = 0i64;
    let mut day_full = false;
    let mut cursor: Option<PatientId> = None;
    while enrolled < limit && !day_full {
        let page_size = ctx.config.batch_size.min((limit - enrolled) as usize);
        let page = ctx.store.eligible_patients_page(&query, cursor.as_ref(), page_size)?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.patient_id.clone());

        for patient in &page {
            let group = assigner.assign(rng);
            let inserted = new_membership(ctx.store, experiment, group, patient, ctx.date)
                .and_then(|membership| {
                    let cap = experiment.max_patients_per_day;
                    let inserted = ctx.store.insert_membership_within_cap(&membership, cap)?;
                    Ok(inserted.then_some(membership))
                });
            match inserted {
                Ok(Some(membership)) => {
                    enrolled += 1;
                    events.push(enrolled_event(experiment, group, &membership));
                }
                Ok(None) => {
                    day_full = true;
                    break;
                }
                Err(err) => events.push(enrollment_failure(experiment, &patient.patient_id, err)?),
            }
        }
    }

    if day_full {
        // Another run filled the day while this one was scanning.
        let total = ctx.store.count_enrolled_on(&experiment.experiment_id, ctx.date)?;
        log::info!(
            "{}: daily cap of {} filled concurrently on {}",
            experiment.lookup_name,
            experiment.max_patients_per_day,
            ctx.date
        );
        events.push(ExperimentEvent::DailyCapReached {
            experiment_id: experiment.experiment_id.clone(),
            date:          ctx.date,
            enrolled:      total,
            cap:           experiment.max_patients_per_day,
        });
    }

    log::info!(
        "{}: enrolled {enrolled} of {limit} patients on {}",
        experiment.lookup_name,
        ctx.date
    );
    Ok(events)
}

/// Enroll a fixed population. Eligibility filters and the daily cap do not
/// apply; the one-membership-per-patient rule still does.
pub fn enroll_preselected(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    patient_ids: &[PatientId],
    rng: &mut dyn RandomSource,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let assigner = CohortAssigner::new(experiment)?;
    let mut events = Vec::new();
    for patient_id in patient_ids {
        let result = ctx
            .store
            .get_patient(patient_id)?
            .ok_or_else(|| ExperimentError::not_found("patient", patient_id))
            .and_then(|patient| {
                let group = assigner.assign(rng);
                let membership = new_membership(ctx.store, experiment, group, &patient, ctx.date)?;
                ctx.store.insert_membership(&membership)?;
                Ok((group, membership))
            });
        match result {
            Ok((group, membership)) => events.push(enrolled_event(experiment, group, &membership)),
            Err(err) => events.push(enrollment_failure(experiment, patient_id, err)?),
        }
    }
    Ok(events)
}

/// Build the membership with its reporting snapshot. Nothing is written.
fn new_membership(
    store: &ExperimentStore,
    experiment: &Experiment,
    group: &TreatmentGroup,
    patient: &Patient,
    date: NaiveDate,
) -> ExperimentResult<Membership> {
    let appointment = store.latest_scheduled_appointment(&patient.patient_id)?;
    let latest_bp = store.latest_blood_pressure(&patient.patient_id)?;

    let reporting = ReportingSnapshot {
        gender: Some(patient.gender.clone()),
        age: Some(patient.age_on(date)),
        risk_level: risk_level(latest_bp.as_ref()),
        diagnosed_htn: patient.has_hypertension,
        appointment_creation_time: appointment.as_ref().map(|a| a.created_at),
        expected_return_facility: facility_snapshot(
            store,
            appointment.as_ref().map(|a| a.facility_id.as_str()),
        )?,
        appointment_creation_facility: facility_snapshot(
            store,
            appointment.as_ref().and_then(|a| a.creation_facility_id.as_deref()),
        )?,
        assigned_facility: facility_snapshot(store, patient.assigned_facility_id.as_deref())?,
        registration_facility: facility_snapshot(store, patient.registration_facility_id.as_deref())?,
    };

    Ok(Membership {
        membership_id: new_id(),
        experiment_id: experiment.experiment_id.clone(),
        treatment_group_id: group.group_id.clone(),
        patient_id: patient.patient_id.clone(),
        status: MembershipStatus::Enrolled,
        status_reason: None,
        experiment_inclusion_date: date,
        expected_return_date: appointment.as_ref().map(|a| a.expected_return_date()),
        appointment_id: appointment.map(|a| a.appointment_id),
        messages: MessageLedger::default(),
        visit: None,
        reporting,
        created_at: now(),
    })
}

fn facility_snapshot(
    store: &ExperimentStore,
    facility_id: Option<&str>,
) -> ExperimentResult<FacilitySnapshot> {
    let Some(facility_id) = facility_id else {
        return Ok(FacilitySnapshot::default());
    };
    let facility = store.get_facility(facility_id)?;
    Ok(FacilitySnapshot {
        facility_id: Some(facility_id.to_string()),
        name: facility.as_ref().map(|f| f.name.clone()),
        facility_type: facility.as_ref().map(|f| f.facility_type.clone()),
        block: facility.as_ref().map(|f| f.block.clone()),
        district: facility.as_ref().map(|f| f.district.clone()),
        state: facility.map(|f| f.state),
    })
}

fn enrolled_event(
    experiment: &Experiment,
    group: &TreatmentGroup,
    membership: &Membership,
) -> ExperimentEvent {
    log::debug!(
        "{}: enrolled patient {} into group '{}'",
        experiment.lookup_name,
        membership.patient_id,
        group.description
    );
    ExperimentEvent::PatientEnrolled {
        experiment_id:      membership.experiment_id.clone(),
        membership_id:      membership.membership_id.clone(),
        patient_id:         membership.patient_id.clone(),
        treatment_group_id: membership.treatment_group_id.clone(),
        inclusion_date:     membership.experiment_inclusion_date,
    }
}

/// Duplicate enrollments are expected under concurrent runs and are skipped.
fn enrollment_failure(
    experiment: &Experiment,
    patient_id: &str,
    err: ExperimentError,
) -> ExperimentResult<ExperimentEvent> {
    match err {
        ExperimentError::DuplicateEnrollment { patient_id, experiment_id } => {
            log::info!(
                "{}: patient {patient_id} already enrolled, skipping",
                experiment.lookup_name
            );
            Ok(ExperimentEvent::DuplicateEnrollmentSkipped { experiment_id, patient_id })
        }
        other => skip_record(experiment, patient_id, other),
    }
}
