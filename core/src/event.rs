//! Everything the daily phases do, as data.
//!
//! RULE: Phases report outcomes ONLY through events.
//! The engine persists every event to the event log; operators read
//! outcomes from the log and from entity state, never from phase internals.

use crate::{
    eviction::EvictionReason,
    experiment::ExperimentState,
    ledger::DeliveryResult,
    membership::VisitKind,
    notification::{Channel, DeliveryStatus},
    types::{ExperimentId, GroupId, MembershipId, NotificationId, PatientId, TemplateId},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Variants are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExperimentEvent {
    // ── Enrollment ─────────────────────────────────
    PatientEnrolled {
        experiment_id:      ExperimentId,
        membership_id:      MembershipId,
        patient_id:         PatientId,
        treatment_group_id: GroupId,
        inclusion_date:     NaiveDate,
    },
    DuplicateEnrollmentSkipped {
        experiment_id: ExperimentId,
        patient_id:    PatientId,
    },
    DailyCapReached {
        experiment_id: ExperimentId,
        date:          NaiveDate,
        enrolled:      i64,
        cap:           i64,
    },

    // ── Monitoring ─────────────────────────────────
    ResultRecorded {
        experiment_id:   ExperimentId,
        membership_id:   MembershipId,
        template_id:     TemplateId,
        notification_id: NotificationId,
        result:          DeliveryResult,
    },
    MembershipVisited {
        experiment_id: ExperimentId,
        membership_id: MembershipId,
        patient_id:    PatientId,
        kind:          VisitKind,
        /// False when an already-evicted membership only gained the marker.
        transitioned:  bool,
    },
    MembershipEvicted {
        experiment_id: ExperimentId,
        membership_id: MembershipId,
        patient_id:    PatientId,
        reason:        EvictionReason,
    },
    NotificationsCancelled {
        experiment_id: ExperimentId,
        cause:         String, // "visited" | "evicted" | "experiment_cancelled"
        count:         usize,
    },
    RecordSkipped {
        experiment_id: ExperimentId,
        record_id:     String,
        reason:        String,
    },

    // ── Scheduling and dispatch ────────────────────
    NotificationScheduled {
        experiment_id:   ExperimentId,
        notification_id: NotificationId,
        patient_id:      PatientId,
        template_id:     TemplateId,
        remind_on:       NaiveDate,
    },
    NotificationDispatched {
        notification_id:     NotificationId,
        channel:             Channel,
        provider_message_id: String,
    },
    NotificationDispatchFailed {
        notification_id: NotificationId,
        reason:          String,
    },
    DeliveryStatusUpdated {
        notification_id:     NotificationId,
        provider_message_id: String,
        status:              DeliveryStatus,
    },

    // ── Operator commands ──────────────────────────
    ExperimentStateChanged {
        experiment_id: ExperimentId,
        from:          ExperimentState,
        to:            ExperimentState,
    },
    ExperimentCancelled {
        experiment_id:           ExperimentId,
        notifications_cancelled: usize,
    },
}

impl ExperimentEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PatientEnrolled { .. }            => "patient_enrolled",
            Self::DuplicateEnrollmentSkipped { .. } => "duplicate_enrollment_skipped",
            Self::DailyCapReached { .. }            => "daily_cap_reached",
            Self::ResultRecorded { .. }             => "result_recorded",
            Self::MembershipVisited { .. }          => "membership_visited",
            Self::MembershipEvicted { .. }          => "membership_evicted",
            Self::NotificationsCancelled { .. }     => "notifications_cancelled",
            Self::RecordSkipped { .. }              => "record_skipped",
            Self::NotificationScheduled { .. }      => "notification_scheduled",
            Self::NotificationDispatched { .. }     => "notification_dispatched",
            Self::NotificationDispatchFailed { .. } => "notification_dispatch_failed",
            Self::DeliveryStatusUpdated { .. }      => "delivery_status_updated",
            Self::ExperimentStateChanged { .. }     => "experiment_state_changed",
            Self::ExperimentCancelled { .. }        => "experiment_cancelled",
        }
    }

    /// The experiment this event belongs to, when it names one.
    pub fn experiment_id(&self) -> Option<&str> {
        match self {
            Self::PatientEnrolled { experiment_id, .. }
            | Self::DuplicateEnrollmentSkipped { experiment_id, .. }
            | Self::DailyCapReached { experiment_id, .. }
            | Self::ResultRecorded { experiment_id, .. }
            | Self::MembershipVisited { experiment_id, .. }
            | Self::MembershipEvicted { experiment_id, .. }
            | Self::NotificationsCancelled { experiment_id, .. }
            | Self::RecordSkipped { experiment_id, .. }
            | Self::NotificationScheduled { experiment_id, .. }
            | Self::ExperimentStateChanged { experiment_id, .. }
            | Self::ExperimentCancelled { experiment_id, .. } => Some(experiment_id),
            Self::NotificationDispatched { .. }
            | Self::NotificationDispatchFailed { .. }
            | Self::DeliveryStatusUpdated { .. } => None,
        }
    }
}

/// A persisted event_log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:            Option<i64>,
    pub run_date:      NaiveDate,
    pub experiment_id: Option<ExperimentId>,
    pub phase:         String,
    pub event_type:    String,
    pub payload:       String, // JSON-serialized ExperimentEvent
}

impl EventLogEntry {
    pub fn from_event(
        run_date: NaiveDate,
        phase: &str,
        event: &ExperimentEvent,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            id:            None,
            run_date,
            experiment_id: event.experiment_id().map(str::to_string),
            phase:         phase.to_string(),
            event_type:    event.type_name().to_string(),
            payload:       serde_json::to_string(event)?,
        })
    }

    pub fn event(&self) -> serde_json::Result<ExperimentEvent> {
        serde_json::from_str(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_keeps_type_and_experiment() {
        let event = ExperimentEvent::MembershipEvicted {
            experiment_id: "e1".into(),
            membership_id: "m1".into(),
            patient_id: "p1".into(),
            reason: EvictionReason::NotificationFailed,
        };
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let entry = EventLogEntry::from_event(date, "monitor", &event).unwrap();
        assert_eq!(entry.event_type, "membership_evicted");
        assert_eq!(entry.experiment_id.as_deref(), Some("e1"));
        assert!(entry.payload.contains(r#""reason":"notification_failed""#));
        assert_eq!(entry.event().unwrap(), event);
    }
}
