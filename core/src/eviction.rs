//! Eviction triggers.
//!
//! Each reason is an independent predicate over an `EvictionContext`.
//! They are evaluated in `EvictionReason::IN_ORDER`; the first match wins
//! and is the only reason recorded on the membership.

use crate::{
    clinical::{Appointment, AppointmentStatus},
    error::ExperimentError,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    AppointmentMoved,
    NewAppointmentCreatedAfterEnrollment,
    NotificationFailed,
    PatientSoftDeleted,
}

impl EvictionReason {
    /// Evaluation order. Never reorder: recorded reasons depend on it.
    pub const IN_ORDER: [EvictionReason; 4] = [
        Self::AppointmentMoved,
        Self::NewAppointmentCreatedAfterEnrollment,
        Self::NotificationFailed,
        Self::PatientSoftDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppointmentMoved => "appointment_moved",
            Self::NewAppointmentCreatedAfterEnrollment => "new_appointment_created_after_enrollment",
            Self::NotificationFailed => "notification_failed",
            Self::PatientSoftDeleted => "patient_soft_deleted",
        }
    }

    pub fn applies(&self, ctx: &EvictionContext) -> bool {
        match self {
            Self::AppointmentMoved => match &ctx.snapshot_appointment {
                Some(appt) => {
                    appt.status != AppointmentStatus::Scheduled
                        || matches!(
                            (appt.remind_on, ctx.expected_return_date),
                            (Some(remind_on), Some(expected)) if remind_on > expected
                        )
                }
                None => false,
            },
            Self::NewAppointmentCreatedAfterEnrollment => matches!(
                (&ctx.snapshot_appointment_id, &ctx.latest_scheduled_appointment_id),
                (Some(snap), Some(latest)) if snap != latest
            ),
            Self::NotificationFailed => ctx.notification_failed,
            Self::PatientSoftDeleted => ctx.patient_deleted,
        }
    }

    pub fn first_match(ctx: &EvictionContext) -> Option<EvictionReason> {
        Self::IN_ORDER.into_iter().find(|r| r.applies(ctx))
    }
}

impl FromStr for EvictionReason {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::IN_ORDER
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ExperimentError::UnknownValue {
                kind: "eviction reason",
                value: s.to_string(),
            })
    }
}

/// Everything the triggers look at for one enrolled membership.
#[derive(Debug, Clone, Default)]
pub struct EvictionContext {
    pub snapshot_appointment_id:         Option<String>,
    pub snapshot_appointment:            Option<Appointment>,
    pub expected_return_date:            Option<NaiveDate>,
    pub latest_scheduled_appointment_id: Option<String>,
    pub notification_failed:             bool,
    pub patient_deleted:                 bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn appointment(status: AppointmentStatus, remind_on: Option<NaiveDate>) -> Appointment {
        Appointment {
            appointment_id: "a1".into(),
            patient_id: "p1".into(),
            facility_id: "f1".into(),
            creation_facility_id: None,
            scheduled_date: date(10),
            remind_on,
            status,
            created_at: NaiveDateTime::default(),
        }
    }

    fn healthy() -> EvictionContext {
        EvictionContext {
            snapshot_appointment_id: Some("a1".into()),
            snapshot_appointment: Some(appointment(AppointmentStatus::Scheduled, Some(date(10)))),
            expected_return_date: Some(date(10)),
            latest_scheduled_appointment_id: Some("a1".into()),
            notification_failed: false,
            patient_deleted: false,
        }
    }

    #[test]
    fn healthy_membership_stays() {
        assert_eq!(EvictionReason::first_match(&healthy()), None);
    }

    #[test]
    fn rescheduled_reminder_counts_as_moved() {
        let mut ctx = healthy();
        ctx.snapshot_appointment = Some(appointment(AppointmentStatus::Scheduled, Some(date(12))));
        assert_eq!(EvictionReason::first_match(&ctx), Some(EvictionReason::AppointmentMoved));

        ctx.snapshot_appointment = Some(appointment(AppointmentStatus::Cancelled, Some(date(10))));
        assert_eq!(EvictionReason::first_match(&ctx), Some(EvictionReason::AppointmentMoved));
    }

    #[test]
    fn new_appointment_requires_both_ids() {
        let mut ctx = healthy();
        ctx.latest_scheduled_appointment_id = Some("a2".into());
        assert_eq!(
            EvictionReason::first_match(&ctx),
            Some(EvictionReason::NewAppointmentCreatedAfterEnrollment)
        );

        ctx.snapshot_appointment_id = None;
        ctx.snapshot_appointment = None;
        assert_eq!(EvictionReason::first_match(&ctx), None);
    }

    #[test]
    fn failed_notification_outranks_soft_delete() {
        let mut ctx = healthy();
        ctx.notification_failed = true;
        ctx.patient_deleted = true;
        assert_eq!(EvictionReason::first_match(&ctx), Some(EvictionReason::NotificationFailed));

        ctx.notification_failed = false;
        assert_eq!(EvictionReason::first_match(&ctx), Some(EvictionReason::PatientSoftDeleted));
    }

    #[test]
    fn reasons_round_trip_through_their_codes() {
        for reason in EvictionReason::IN_ORDER {
            assert_eq!(reason.as_str().parse::<EvictionReason>().unwrap(), reason);
        }
    }
}
