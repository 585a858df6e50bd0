//! Experiment, treatment group and reminder template records.
//!
//! An experiment owns its treatment groups; each group owns its reminder
//! templates. Records are read from the store once per phase and treated as
//! immutable values while the phase runs.

use crate::{
    eligibility::FilterSpec,
    error::{ExperimentError, ExperimentResult},
    types::{ExperimentId, GroupId, TemplateId},
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Inactive,
    /// Pulls new enrollees every day.
    ActiveSelecting,
    /// Fixed population; enrollment is closed.
    ActivePreselected,
}

impl ExperimentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive          => "inactive",
            Self::ActiveSelecting   => "active_selecting",
            Self::ActivePreselected => "active_preselected",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

impl FromStr for ExperimentState {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive"           => Ok(Self::Inactive),
            "active_selecting"   => Ok(Self::ActiveSelecting),
            "active_preselected" => Ok(Self::ActivePreselected),
            other => Err(ExperimentError::UnknownValue {
                kind: "experiment state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    CurrentPatientReminder,
    StalePatientReminder,
}

impl ExperimentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentPatientReminder => "current_patient_reminder",
            Self::StalePatientReminder   => "stale_patient_reminder",
        }
    }
}

impl FromStr for ExperimentType {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current_patient_reminder" => Ok(Self::CurrentPatientReminder),
            "stale_patient_reminder"   => Ok(Self::StalePatientReminder),
            other => Err(ExperimentError::UnknownValue {
                kind: "experiment type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderTemplate {
    pub template_id:        TemplateId,
    pub treatment_group_id: GroupId,
    /// Days after the membership's inclusion date when this reminder is due.
    pub remind_on_in_days:  i64,
    pub message:            String,
}

impl ReminderTemplate {
    pub fn due_on(&self, inclusion_date: NaiveDate) -> NaiveDate {
        inclusion_date + Duration::days(self.remind_on_in_days)
    }

    /// The look-ahead window: due day plus `catch_up_days` trailing days.
    pub fn is_due(&self, inclusion_date: NaiveDate, date: NaiveDate, catch_up_days: i64) -> bool {
        let due = self.due_on(inclusion_date);
        date >= due && date <= due + Duration::days(catch_up_days.max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentGroup {
    pub group_id:      GroupId,
    pub experiment_id: ExperimentId,
    pub description:   String,
    pub weight:        f64,
    pub templates:     Vec<ReminderTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub experiment_id:        ExperimentId,
    pub lookup_name:          String,
    pub state:                ExperimentState,
    pub experiment_type:      ExperimentType,
    pub start_date:           NaiveDate,
    pub end_date:             NaiveDate,
    pub max_patients_per_day: i64,
    pub filters:              FilterSpec,
    pub cancelled_at:         Option<NaiveDateTime>,
    pub treatment_groups:     Vec<TreatmentGroup>,
}

impl Experiment {
    pub fn templates(&self) -> impl Iterator<Item = &ReminderTemplate> {
        self.treatment_groups.iter().flat_map(|g| g.templates.iter())
    }

    pub fn has_templates(&self) -> bool {
        self.templates().next().is_some()
    }

    pub fn earliest_remind_on(&self) -> i64 {
        self.templates().map(|t| t.remind_on_in_days).min().unwrap_or(0)
    }

    pub fn last_remind_on(&self) -> i64 {
        self.templates().map(|t| t.remind_on_in_days).max().unwrap_or(0)
    }

    /// Selecting experiments take new enrollees only inside their window.
    pub fn is_enrolling(&self, date: NaiveDate) -> bool {
        self.state == ExperimentState::ActiveSelecting
            && self.start_date <= date
            && date <= self.end_date
    }

    /// Memberships enrolled on the last day still need every reminder,
    /// so the window extends by the template spread.
    pub fn is_notifying(&self, date: NaiveDate) -> bool {
        if !self.state.is_active() || !self.has_templates() {
            return false;
        }
        let buffer = Duration::days(self.last_remind_on() - self.earliest_remind_on());
        self.start_date <= date && date <= self.end_date + buffer
    }

    pub fn is_monitoring(&self, date: NaiveDate) -> bool {
        self.is_notifying(date)
    }

    pub fn group(&self, group_id: &str) -> Option<&TreatmentGroup> {
        self.treatment_groups.iter().find(|g| g.group_id == group_id)
    }
}

pub fn require_groups(experiment: &Experiment) -> ExperimentResult<()> {
    if experiment.treatment_groups.is_empty() {
        return Err(ExperimentError::NoTreatmentGroups {
            experiment_id: experiment.experiment_id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn template(days: i64) -> ReminderTemplate {
        ReminderTemplate {
            template_id: format!("t{days}"),
            treatment_group_id: "g".into(),
            remind_on_in_days: days,
            message: "msg".into(),
        }
    }

    fn experiment(state: ExperimentState, offsets: &[i64]) -> Experiment {
        Experiment {
            experiment_id: "e".into(),
            lookup_name: "exp".into(),
            state,
            experiment_type: ExperimentType::StalePatientReminder,
            start_date: date(3, 1),
            end_date: date(3, 10),
            max_patients_per_day: 10,
            filters: FilterSpec::default(),
            cancelled_at: None,
            treatment_groups: vec![TreatmentGroup {
                group_id: "g".into(),
                experiment_id: "e".into(),
                description: "group".into(),
                weight: 1.0,
                templates: offsets.iter().map(|d| template(*d)).collect(),
            }],
        }
    }

    #[test]
    fn notifying_window_extends_by_template_spread() {
        let exp = experiment(ExperimentState::ActiveSelecting, &[0, 3]);
        assert!(exp.is_notifying(date(3, 13)));
        assert!(!exp.is_notifying(date(3, 14)));
        assert!(!exp.is_notifying(date(2, 29)));
    }

    #[test]
    fn preselected_experiments_do_not_enroll() {
        let exp = experiment(ExperimentState::ActivePreselected, &[0]);
        assert!(!exp.is_enrolling(date(3, 5)));
        assert!(exp.is_notifying(date(3, 5)));
    }

    #[test]
    fn experiments_without_templates_never_notify() {
        let exp = experiment(ExperimentState::ActiveSelecting, &[]);
        assert!(!exp.is_notifying(date(3, 5)));
        assert!(exp.is_enrolling(date(3, 5)));
    }

    #[test]
    fn template_due_window_honours_catch_up() {
        let t = template(3);
        assert!(!t.is_due(date(3, 1), date(3, 3), 0));
        assert!(t.is_due(date(3, 1), date(3, 4), 0));
        assert!(!t.is_due(date(3, 1), date(3, 5), 0));
        assert!(t.is_due(date(3, 1), date(3, 5), 1));
    }
}
