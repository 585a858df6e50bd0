//! Outbound reminder records and their delivery attempts.

use crate::{
    error::ExperimentError,
    types::{AppointmentId, ExperimentId, NotificationId, PatientId, TemplateId},
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const EXPERIMENT_REMINDER_PURPOSE: &str = "experimental_appointment_reminder";
pub const APPOINTMENT_SUBJECT: &str = "appointment";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Cancelled,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending   => "pending",
            Self::Sent      => "sent",
            Self::Cancelled => "cancelled",
            Self::Failed    => "failed",
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "sent"      => Ok(Self::Sent),
            "cancelled" => Ok(Self::Cancelled),
            "failed"    => Ok(Self::Failed),
            other => Err(ExperimentError::UnknownValue {
                kind: "notification status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub notification_id:      NotificationId,
    pub experiment_id:        ExperimentId,
    pub patient_id:           PatientId,
    pub reminder_template_id: TemplateId,
    pub purpose:              String,
    pub message:              String,
    pub subject_type:         String,
    pub subject_id:           Option<AppointmentId>,
    pub remind_on:            NaiveDate,
    pub status:               NotificationStatus,
    pub created_at:           NaiveDateTime,
    pub updated_at:           NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Whatsapp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms      => "sms",
            Self::Whatsapp => "whatsapp",
        }
    }
}

impl FromStr for Channel {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms"      => Ok(Self::Sms),
            "whatsapp" => Ok(Self::Whatsapp),
            other => Err(ExperimentError::UnknownValue {
                kind: "channel",
                value: other.to_string(),
            }),
        }
    }
}

/// Provider-reported state of a single delivery attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
    Undelivered,
    Unknown,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued      => "queued",
            Self::Sent        => "sent",
            Self::Delivered   => "delivered",
            Self::Read        => "read",
            Self::Failed      => "failed",
            Self::Undelivered => "undelivered",
            Self::Unknown     => "unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered | Self::Read)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Undelivered)
    }

    /// Lenient mapping for provider callbacks; anything unrecognised is `Unknown`.
    pub fn from_provider(raw: &str) -> Self {
        raw.parse().unwrap_or(Self::Unknown)
    }
}

impl FromStr for DeliveryStatus {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" | "accepted" | "sending" => Ok(Self::Queued),
            "sent"        => Ok(Self::Sent),
            "delivered"   => Ok(Self::Delivered),
            "read"        => Ok(Self::Read),
            "failed"      => Ok(Self::Failed),
            "undelivered" => Ok(Self::Undelivered),
            "unknown"     => Ok(Self::Unknown),
            other => Err(ExperimentError::UnknownValue {
                kind: "delivery status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Communication {
    pub communication_id:    String,
    pub notification_id:     NotificationId,
    pub channel:             Channel,
    pub provider_message_id: String,
    pub delivery_status:     DeliveryStatus,
    pub delivered_at:        Option<NaiveDateTime>,
    pub created_at:          NaiveDateTime,
}

/// Terminal view of a notification's delivery, derived from its attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    Success(Communication),
    Failed,
    Unknown,
}

impl NotificationOutcome {
    /// Success wins over failure: one delivered attempt is enough.
    /// A notification counts as failed when the dispatcher marked it so, or
    /// when it went out and every attempt bounced.
    pub fn classify(notification: &Notification, communications: &[Communication]) -> Self {
        let first_success = communications
            .iter()
            .filter(|c| c.delivery_status.is_success())
            .min_by_key(|c| c.created_at);
        if let Some(c) = first_success {
            return Self::Success(c.clone());
        }

        let all_bounced = !communications.is_empty()
            && communications.iter().all(|c| c.delivery_status.is_failure());
        match notification.status {
            NotificationStatus::Failed => Self::Failed,
            NotificationStatus::Sent if all_bounced => Self::Failed,
            _ => Self::Unknown,
        }
    }
}
