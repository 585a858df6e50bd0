//! Treatment group membership: one patient's enrollment in one experiment.

use crate::{
    error::ExperimentError,
    eviction::EvictionReason,
    ledger::MessageLedger,
    types::{AppointmentId, ExperimentId, FacilityId, GroupId, MembershipId, PatientId},
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// enrolled -> evicted | visited. Both exits are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Enrolled,
    Evicted,
    Visited,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Evicted  => "evicted",
            Self::Visited  => "visited",
        }
    }

    pub fn can_transition_to(&self, next: MembershipStatus) -> bool {
        matches!(
            (self, next),
            (Self::Enrolled, Self::Evicted) | (Self::Enrolled, Self::Visited)
        )
    }
}

impl FromStr for MembershipStatus {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrolled" => Ok(Self::Enrolled),
            "evicted"  => Ok(Self::Evicted),
            "visited"  => Ok(Self::Visited),
            other => Err(ExperimentError::UnknownValue {
                kind: "membership status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisitKind {
    BloodPressure,
    BloodSugar,
    PrescriptionDrug,
}

impl VisitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BloodPressure    => "blood_pressure",
            Self::BloodSugar       => "blood_sugar",
            Self::PrescriptionDrug => "prescription_drug",
        }
    }
}

impl FromStr for VisitKind {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blood_pressure"    => Ok(Self::BloodPressure),
            "blood_sugar"       => Ok(Self::BloodSugar),
            "prescription_drug" => Ok(Self::PrescriptionDrug),
            other => Err(ExperimentError::UnknownValue {
                kind: "visit kind",
                value: other.to_string(),
            }),
        }
    }
}

/// The earliest qualifying clinical event after enrollment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisitMarker {
    pub kind:        VisitKind,
    pub event_id:    String,
    pub facility_id: Option<FacilityId>,
    pub visited_at:  NaiveDateTime,
}

/// Facility lineage captured for reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FacilitySnapshot {
    pub facility_id:   Option<FacilityId>,
    pub name:          Option<String>,
    pub facility_type: Option<String>,
    pub block:         Option<String>,
    pub district:      Option<String>,
    pub state:         Option<String>,
}

/// Frozen at enrollment so later edits to patient data don't skew analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportingSnapshot {
    pub gender:                    Option<String>,
    pub age:                       Option<i64>,
    pub risk_level:                Option<String>,
    pub diagnosed_htn:             bool,
    pub appointment_creation_time: Option<NaiveDateTime>,
    pub expected_return_facility:  FacilitySnapshot,
    pub appointment_creation_facility: FacilitySnapshot,
    pub assigned_facility:         FacilitySnapshot,
    pub registration_facility:     FacilitySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub membership_id:             MembershipId,
    pub experiment_id:             ExperimentId,
    pub treatment_group_id:        GroupId,
    pub patient_id:                PatientId,
    pub status:                    MembershipStatus,
    pub status_reason:             Option<EvictionReason>,
    pub experiment_inclusion_date: NaiveDate,
    pub expected_return_date:      Option<NaiveDate>,
    pub appointment_id:            Option<AppointmentId>,
    pub messages:                  MessageLedger,
    pub visit:                     Option<VisitMarker>,
    pub reporting:                 ReportingSnapshot,
    pub created_at:                NaiveDateTime,
}
