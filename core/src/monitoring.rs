//! Monitoring phase.
//!
//! Three passes per experiment, always in this order:
//!   1. result recording: fold notification outcomes into ledgers
//!   2. visit marking: enrolled -> visited on the first clinical event
//!   3. eviction: enrolled -> evicted on the first matching trigger
//!
//! Each pass is safe to re-run on the same day. Status changes are guarded
//! by the `enrolled` precondition in SQL; result recording only moves
//! entries from open to terminal.

use crate::{
    error::{ExperimentError, ExperimentResult},
    event::ExperimentEvent,
    eviction::{EvictionContext, EvictionReason},
    experiment::Experiment,
    membership::{Membership, MembershipStatus},
    notification::NotificationOutcome,
    phase::{skip_record, DailyPhase, PhaseContext},
    rng::RandomSource,
    store::MembershipScope,
    types::{now, start_of_day},
};
use chrono::NaiveDate;

pub struct MonitoringPhase;

impl DailyPhase for MonitoringPhase {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn applies(&self, experiment: &Experiment, date: NaiveDate) -> bool {
        experiment.is_monitoring(date)
    }

    fn run(
        &self,
        ctx: &PhaseContext<'_>,
        experiment: &Experiment,
        _rng: &mut dyn RandomSource,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        let mut events = record_results(ctx, experiment)?;
        events.extend(mark_visits(ctx, experiment)?);
        events.extend(evict_patients(ctx, experiment)?);
        Ok(events)
    }
}

/// Walk every membership of `experiment` matching `scope`, one page at a time.
fn for_each_membership(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    scope: MembershipScope,
    mut visit: impl FnMut(&Membership) -> ExperimentResult<Vec<ExperimentEvent>>,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let mut events = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = ctx.store.memberships_page(
            &experiment.experiment_id,
            scope,
            cursor.as_deref(),
            ctx.config.batch_size,
        )?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.membership_id.clone());

        for membership in &page {
            match visit(membership) {
                Ok(produced) => events.extend(produced),
                Err(err) => events.push(skip_record(experiment, &membership.membership_id, err)?),
            }
        }
    }
    Ok(events)
}

// ── Result recording ───────────────────────────────────────────

/// Fold each open ledger entry's notification outcome into the ledger.
/// Memberships in every status are visited so late outcomes still land.
pub fn record_results(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let events = for_each_membership(ctx, experiment, MembershipScope::All, |membership| {
        record_membership_results(ctx, experiment, membership)
    })?;
    log::debug!(
        "{}: recorded {} terminal results",
        experiment.lookup_name,
        events.iter().filter(|e| matches!(e, ExperimentEvent::ResultRecorded { .. })).count()
    );
    Ok(events)
}

fn record_membership_results(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    membership: &Membership,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let awaiting = membership.messages.awaiting_results();
    if awaiting.is_empty() {
        return Ok(Vec::new());
    }

    let recorded_at = now();
    let mut ledger = membership.messages.clone();
    let mut events = Vec::new();
    for (template_id, notification_id) in awaiting {
        let outcome = ctx
            .store
            .get_notification(&notification_id)?
            .ok_or_else(|| ExperimentError::not_found("notification", &notification_id))
            .and_then(|notification| {
                let communications = ctx.store.communications_for(&notification_id)?;
                let outcome = NotificationOutcome::classify(&notification, &communications);
                Ok((notification, outcome))
            });
        let (notification, outcome) = match outcome {
            Ok(found) => found,
            Err(err) => {
                events.push(skip_record(experiment, &notification_id, err)?);
                continue;
            }
        };

        let Some(entry) = ledger.get_mut(&template_id) else { continue };
        entry.apply_outcome(notification.status, notification.updated_at, &outcome, recorded_at);
        if let Some(result) = entry.result {
            events.push(ExperimentEvent::ResultRecorded {
                experiment_id: experiment.experiment_id.clone(),
                membership_id: membership.membership_id.clone(),
                template_id,
                notification_id,
                result,
            });
        }
    }

    ctx.store.update_membership_messages(&membership.membership_id, &ledger)?;
    Ok(events)
}

// ── Visit marking ──────────────────────────────────────────────

/// Mark memberships whose patient came back after enrollment, then cancel
/// the reminders still pending for visited patients.
pub fn mark_visits(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let marked_at = now();
    let mut events =
        for_each_membership(ctx, experiment, MembershipScope::AwaitingVisit, |membership| {
            let after = start_of_day(membership.experiment_inclusion_date);
            let Some(visit) = ctx.store.earliest_visit_after(&membership.patient_id, &after)? else {
                return Ok(Vec::new());
            };
            if !ctx.store.record_membership_visit(&membership.membership_id, &visit, marked_at)? {
                return Ok(Vec::new());
            }
            let transitioned = membership.status == MembershipStatus::Enrolled;
            log::debug!(
                "{}: patient {} visited ({})",
                experiment.lookup_name,
                membership.patient_id,
                visit.kind.as_str()
            );
            Ok(vec![ExperimentEvent::MembershipVisited {
                experiment_id: experiment.experiment_id.clone(),
                membership_id: membership.membership_id.clone(),
                patient_id:    membership.patient_id.clone(),
                kind:          visit.kind,
                transitioned,
            }])
        })?;

    let cancelled = ctx.store.cancel_pending_notifications_for_status(
        &experiment.experiment_id,
        MembershipStatus::Visited,
        marked_at,
    )?;
    events.extend(cancelled_event(experiment, "visited", cancelled));
    Ok(events)
}

// ── Eviction ───────────────────────────────────────────────────

/// Evict enrolled memberships on their first matching trigger, then cancel
/// the reminders still pending for evicted patients.
pub fn evict_patients(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let evicted_at = now();
    let mut events = for_each_membership(ctx, experiment, MembershipScope::Enrolled, |membership| {
        let eviction = eviction_context(ctx, experiment, membership)?;
        let Some(reason) = EvictionReason::first_match(&eviction) else {
            return Ok(Vec::new());
        };
        if !ctx.store.evict_membership(&membership.membership_id, reason, evicted_at)? {
            return Ok(Vec::new());
        }
        log::debug!(
            "{}: evicted patient {} ({})",
            experiment.lookup_name,
            membership.patient_id,
            reason.as_str()
        );
        Ok(vec![ExperimentEvent::MembershipEvicted {
            experiment_id: experiment.experiment_id.clone(),
            membership_id: membership.membership_id.clone(),
            patient_id:    membership.patient_id.clone(),
            reason,
        }])
    })?;

    let cancelled = ctx.store.cancel_pending_notifications_for_status(
        &experiment.experiment_id,
        MembershipStatus::Evicted,
        evicted_at,
    )?;
    events.extend(cancelled_event(experiment, "evicted", cancelled));
    Ok(events)
}

/// Gather what the triggers look at. Lookups feed separate triggers: a
/// vanished snapshot appointment only means `appointment_moved` cannot
/// match, and a vanished patient row counts as deleted.
fn eviction_context(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    membership: &Membership,
) -> ExperimentResult<EvictionContext> {
    let snapshot_appointment = match &membership.appointment_id {
        Some(id) => {
            let found = ctx.store.get_appointment(id)?;
            if found.is_none() {
                log::warn!(
                    "{}: snapshot appointment {id} of patient {} is gone",
                    experiment.lookup_name,
                    membership.patient_id
                );
            }
            found
        }
        None => None,
    };
    let latest = ctx.store.latest_scheduled_appointment(&membership.patient_id)?;
    let patient_deleted = match ctx.store.get_patient(&membership.patient_id)? {
        Some(patient) => patient.is_deleted(),
        None => {
            log::warn!(
                "{}: patient {} no longer exists",
                experiment.lookup_name,
                membership.patient_id
            );
            true
        }
    };

    Ok(EvictionContext {
        snapshot_appointment_id: membership.appointment_id.clone(),
        snapshot_appointment,
        expected_return_date: membership.expected_return_date,
        latest_scheduled_appointment_id: latest.map(|a| a.appointment_id),
        notification_failed: membership
            .messages
            .any_failed(experiment.templates().map(|t| t.template_id.as_str())),
        patient_deleted,
    })
}

fn cancelled_event(experiment: &Experiment, cause: &str, count: usize) -> Option<ExperimentEvent> {
    if count == 0 {
        return None;
    }
    log::info!(
        "{}: cancelled {count} pending notifications of {cause} patients",
        experiment.lookup_name
    );
    Some(ExperimentEvent::NotificationsCancelled {
        experiment_id: experiment.experiment_id.clone(),
        cause:         cause.to_string(),
        count,
    })
}
