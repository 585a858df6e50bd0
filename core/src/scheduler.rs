//! Notification scheduling phase.
//!
//! For every enrolled membership and every template of its treatment
//! group that is due today, make sure exactly one pending notification
//! exists. The notification row and its ledger entry are written in one
//! transaction. Delivery is someone else's job (see delivery.rs).

use crate::{
    error::{ExperimentError, ExperimentResult},
    event::ExperimentEvent,
    experiment::{Experiment, ReminderTemplate},
    ledger::{LedgerEntry, MessageLedger},
    membership::Membership,
    notification::{Notification, NotificationStatus, APPOINTMENT_SUBJECT, EXPERIMENT_REMINDER_PURPOSE},
    phase::{skip_record, DailyPhase, PhaseContext},
    rng::RandomSource,
    store::MembershipScope,
    types::{new_id, now},
};
use chrono::NaiveDate;

pub struct SchedulingPhase;

impl DailyPhase for SchedulingPhase {
    fn name(&self) -> &'static str {
        "schedule_notifications"
    }

    fn applies(&self, experiment: &Experiment, date: NaiveDate) -> bool {
        experiment.is_notifying(date)
    }

    fn run(
        &self,
        ctx: &PhaseContext<'_>,
        experiment: &Experiment,
        _rng: &mut dyn RandomSource,
    ) -> ExperimentResult<Vec<ExperimentEvent>> {
        schedule_notifications(ctx, experiment)
    }
}

pub fn schedule_notifications(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let mut events = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = ctx.store.memberships_page(
            &experiment.experiment_id,
            MembershipScope::Enrolled,
            cursor.as_deref(),
            ctx.config.batch_size,
        )?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.membership_id.clone());

        for membership in &page {
            match schedule_for_membership(ctx, experiment, membership) {
                Ok(produced) => events.extend(produced),
                Err(err) => events.push(skip_record(experiment, &membership.membership_id, err)?),
            }
        }
    }
    log::info!(
        "{}: scheduled {} notifications for {}",
        experiment.lookup_name,
        events.iter().filter(|e| matches!(e, ExperimentEvent::NotificationScheduled { .. })).count(),
        ctx.date
    );
    Ok(events)
}

fn schedule_for_membership(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    membership: &Membership,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let group = experiment
        .group(&membership.treatment_group_id)
        .ok_or_else(|| ExperimentError::not_found("treatment group", &membership.treatment_group_id))?;

    let mut ledger = membership.messages.clone();
    let mut events = Vec::new();
    for template in &group.templates {
        if !template.is_due(
            membership.experiment_inclusion_date,
            ctx.date,
            ctx.config.schedule_catch_up_days,
        ) {
            continue;
        }
        if ctx.store.notification_exists(
            &experiment.experiment_id,
            &template.template_id,
            &membership.patient_id,
        )? {
            continue;
        }
        if let Some((next, event)) = schedule_one(ctx, experiment, membership, template, &ledger)? {
            ledger = next;
            events.push(event);
        }
    }
    Ok(events)
}

/// Create the notification and record it in the ledger, atomically.
/// Returns None when a concurrent run created the notification first.
fn schedule_one(
    ctx: &PhaseContext<'_>,
    experiment: &Experiment,
    membership: &Membership,
    template: &ReminderTemplate,
    ledger: &MessageLedger,
) -> ExperimentResult<Option<(MessageLedger, ExperimentEvent)>> {
    let created_at = now();
    let notification = Notification {
        notification_id: new_id(),
        experiment_id: experiment.experiment_id.clone(),
        patient_id: membership.patient_id.clone(),
        reminder_template_id: template.template_id.clone(),
        purpose: EXPERIMENT_REMINDER_PURPOSE.to_string(),
        message: template.message.clone(),
        subject_type: APPOINTMENT_SUBJECT.to_string(),
        subject_id: membership.appointment_id.clone(),
        remind_on: ctx.date,
        status: NotificationStatus::Pending,
        created_at,
        updated_at: created_at,
    };

    let mut next = ledger.clone();
    next.record(
        template.template_id.clone(),
        LedgerEntry::scheduled(notification.notification_id.clone(), created_at),
    );

    let inserted = ctx.store.in_transaction(|store| {
        if !store.insert_notification(&notification)? {
            return Ok(false);
        }
        store.update_membership_messages(&membership.membership_id, &next)?;
        Ok(true)
    })?;
    if !inserted {
        return Ok(None);
    }

    log::debug!(
        "{}: scheduled template {} for patient {}",
        experiment.lookup_name,
        template.template_id,
        membership.patient_id
    );
    let event = ExperimentEvent::NotificationScheduled {
        experiment_id:   experiment.experiment_id.clone(),
        notification_id: notification.notification_id,
        patient_id:      membership.patient_id.clone(),
        template_id:     template.template_id.clone(),
        remind_on:       notification.remind_on,
    };
    Ok(Some((next, event)))
}
