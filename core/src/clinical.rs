//! Records owned by the wider patient/clinical system.
//!
//! The experiment core only reads these. Insert helpers on the store exist
//! so seeders and tests can stand the population up.

use crate::{
    error::ExperimentError,
    types::{AppointmentId, FacilityId, PatientId},
};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Facility {
    pub facility_id:     FacilityId,
    pub name:            String,
    pub facility_type:   String,
    pub block_region_id: String,
    pub block:           String,
    pub district:        String,
    pub state:           String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub patient_id:               PatientId,
    pub full_name:                String,
    pub gender:                   String,
    pub birth_date:               NaiveDate,
    pub phone_number:             Option<String>,
    pub phone_active:             bool,
    pub has_hypertension:         bool,
    pub assigned_facility_id:     Option<FacilityId>,
    pub registration_facility_id: Option<FacilityId>,
    pub deleted_at:               Option<NaiveDateTime>,
}

impl Patient {
    /// Whole years on `date`.
    pub fn age_on(&self, date: NaiveDate) -> i64 {
        let mut years = date.year() as i64 - self.birth_date.year() as i64;
        if (date.month(), date.day()) < (self.birth_date.month(), self.birth_date.day()) {
            years -= 1;
        }
        years
    }

    pub fn is_contactable(&self) -> bool {
        self.phone_active
            && self.phone_number.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
    Visited,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
            Self::Visited   => "visited",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "cancelled" => Ok(Self::Cancelled),
            "visited"   => Ok(Self::Visited),
            other => Err(ExperimentError::UnknownValue {
                kind: "appointment status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub appointment_id:       AppointmentId,
    pub patient_id:           PatientId,
    pub facility_id:          FacilityId,
    pub creation_facility_id: Option<FacilityId>,
    pub scheduled_date:       NaiveDate,
    pub remind_on:            Option<NaiveDate>,
    pub status:               AppointmentStatus,
    pub created_at:           NaiveDateTime,
}

impl Appointment {
    /// The date the patient is expected back: the reminder date when set.
    pub fn expected_return_date(&self) -> NaiveDate {
        self.remind_on.unwrap_or(self.scheduled_date)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodPressure {
    pub id:          String,
    pub patient_id:  PatientId,
    pub facility_id: FacilityId,
    pub systolic:    i64,
    pub diastolic:   i64,
    pub recorded_at: NaiveDateTime,
    pub deleted_at:  Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodSugar {
    pub id:          String,
    pub patient_id:  PatientId,
    pub facility_id: FacilityId,
    pub sugar_type:  String,
    pub value:       f64,
    pub recorded_at: NaiveDateTime,
    pub deleted_at:  Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrescriptionDrug {
    pub id:                String,
    pub patient_id:        PatientId,
    pub facility_id:       FacilityId,
    pub name:              String,
    pub device_created_at: NaiveDateTime,
    pub deleted_at:        Option<NaiveDateTime>,
}

/// Coarse risk bucket from the latest blood pressure reading.
pub fn risk_level(latest: Option<&BloodPressure>) -> Option<String> {
    let bp = latest?;
    let level = if bp.systolic >= 180 || bp.diastolic >= 110 {
        "high"
    } else if bp.systolic >= 140 || bp.diastolic >= 90 {
        "elevated"
    } else {
        "controlled"
    };
    Some(level.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(birth: NaiveDate, phone: Option<&str>, active: bool) -> Patient {
        Patient {
            patient_id: "p1".into(),
            full_name: "Test Patient".into(),
            gender: "female".into(),
            birth_date: birth,
            phone_number: phone.map(String::from),
            phone_active: active,
            has_hypertension: true,
            assigned_facility_id: None,
            registration_facility_id: None,
            deleted_at: None,
        }
    }

    #[test]
    fn age_counts_completed_years() {
        let p = patient(NaiveDate::from_ymd_opt(2006, 3, 15).unwrap(), None, false);
        assert_eq!(p.age_on(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()), 17);
        assert_eq!(p.age_on(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()), 18);
    }

    #[test]
    fn contactable_needs_an_active_non_blank_number() {
        let birth = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert!(patient(birth, Some("9876543210"), true).is_contactable());
        assert!(!patient(birth, Some("9876543210"), false).is_contactable());
        assert!(!patient(birth, Some("  "), true).is_contactable());
        assert!(!patient(birth, None, true).is_contactable());
    }
}
