//! Eligibility filter.
//!
//! Base predicate: hypertensive, contactable, adult, has an assigned
//! facility, not soft-deleted, and not in any experiment whose window is
//! still open or whose membership started inside the contamination buffer.
//!
//! On top of that, up to three axis filters (states, blocks, facilities)
//! narrow the population. Axes combine with AND. Two axes that select
//! disjoint populations legitimately produce an empty result.

use crate::{
    error::{ExperimentError, ExperimentResult},
    types::{fmt_date, PatientId},
};
use chrono::{Duration, Months, NaiveDate};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisFilter {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAxis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    states: Option<RawAxis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blocks: Option<RawAxis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    facilities: Option<RawAxis>,
}

/// Validated filter specification. Each axis is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFilterSpec", into = "RawFilterSpec")]
pub struct FilterSpec {
    pub states:     Option<AxisFilter>,
    pub blocks:     Option<AxisFilter>,
    pub facilities: Option<AxisFilter>,
}

impl FilterSpec {
    /// Parse the JSON form (`{"states": {"include": [..]}, ...}`).
    /// Malformed specs surface as `InvalidFilter`.
    pub fn from_json(json: &str) -> ExperimentResult<Self> {
        let raw: RawFilterSpec =
            serde_json::from_str(json).map_err(|e| ExperimentError::InvalidFilter {
                axis: "filters".into(),
                reason: e.to_string(),
            })?;
        Self::try_from(raw)
    }

    pub fn to_json(&self) -> ExperimentResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn validate_axis(axis: &str, raw: Option<RawAxis>) -> ExperimentResult<Option<AxisFilter>> {
    let Some(raw) = raw else { return Ok(None) };
    match (raw.include, raw.exclude) {
        (Some(_), Some(_)) => Err(ExperimentError::InvalidFilter {
            axis: axis.into(),
            reason: "include and exclude are mutually exclusive".into(),
        }),
        (Some(list), None) => Ok(Some(AxisFilter::Include(list))),
        (None, Some(list)) => Ok(Some(AxisFilter::Exclude(list))),
        (None, None) => Ok(None),
    }
}

impl TryFrom<RawFilterSpec> for FilterSpec {
    type Error = ExperimentError;

    fn try_from(raw: RawFilterSpec) -> Result<Self, Self::Error> {
        Ok(Self {
            states:     validate_axis("states", raw.states)?,
            blocks:     validate_axis("blocks", raw.blocks)?,
            facilities: validate_axis("facilities", raw.facilities)?,
        })
    }
}

fn raw_axis(axis: Option<AxisFilter>) -> Option<RawAxis> {
    axis.map(|a| match a {
        AxisFilter::Include(list) => RawAxis { include: Some(list), exclude: None },
        AxisFilter::Exclude(list) => RawAxis { include: None, exclude: Some(list) },
    })
}

impl From<FilterSpec> for RawFilterSpec {
    fn from(spec: FilterSpec) -> Self {
        Self {
            states:     raw_axis(spec.states),
            blocks:     raw_axis(spec.blocks),
            facilities: raw_axis(spec.facilities),
        }
    }
}

/// Column list shared with the store's patient row mapper.
pub const PATIENT_COLUMNS: &str = "p.patient_id, p.full_name, p.gender, p.birth_date,
    p.phone_number, p.phone_active, p.has_hypertension, p.assigned_facility_id,
    p.registration_facility_id, p.deleted_at";

/// Builds the paginated eligibility query. Pure: no database access.
#[derive(Debug, Clone)]
pub struct EligibilityQuery {
    pub as_of:                  NaiveDate,
    pub min_age:                u32,
    pub monitoring_buffer_days: i64,
    pub filters:                FilterSpec,
}

impl EligibilityQuery {
    pub fn new(
        as_of: NaiveDate,
        min_age: u32,
        monitoring_buffer_days: i64,
        filters: FilterSpec,
    ) -> Self {
        Self { as_of, min_age, monitoring_buffer_days, filters }
    }

    /// Latest birth date that is still `min_age` on `as_of`.
    pub fn birth_date_cutoff(&self) -> NaiveDate {
        self.as_of
            .checked_sub_months(Months::new(self.min_age * 12))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Keyset-paginated by patient id so large populations stream in batches.
    pub fn to_sql(&self, after: Option<&PatientId>, limit: usize) -> (String, Vec<Value>) {
        let buffer_start = self.as_of - Duration::days(self.monitoring_buffer_days);
        let mut params: Vec<Value> = vec![
            Value::Text(fmt_date(self.birth_date_cutoff())),
            Value::Text(fmt_date(self.as_of)),
            Value::Text(fmt_date(buffer_start)),
        ];

        let mut sql = format!(
            "SELECT {PATIENT_COLUMNS}
             FROM patients p
             JOIN facilities f ON f.facility_id = p.assigned_facility_id
             WHERE p.deleted_at IS NULL
               AND p.has_hypertension = 1
               AND p.phone_active = 1
               AND p.phone_number IS NOT NULL
               AND TRIM(p.phone_number) <> ''
               AND p.birth_date <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM treatment_group_memberships m
                   JOIN experiments e ON e.experiment_id = m.experiment_id
                   WHERE m.patient_id = p.patient_id
                     AND (e.end_date >= ?2 OR m.experiment_inclusion_date > ?3)
               )"
        );

        push_axis(&mut sql, &mut params, "f.state", self.filters.states.as_ref());
        push_axis(&mut sql, &mut params, "f.block_region_id", self.filters.blocks.as_ref());
        push_axis(&mut sql, &mut params, "p.assigned_facility_id", self.filters.facilities.as_ref());

        if let Some(cursor) = after {
            params.push(Value::Text(cursor.clone()));
            sql.push_str(&format!("\n               AND p.patient_id > ?{}", params.len()));
        }

        params.push(Value::Integer(limit as i64));
        sql.push_str(&format!("\n             ORDER BY p.patient_id ASC LIMIT ?{}", params.len()));
        (sql, params)
    }
}

fn push_axis(sql: &mut String, params: &mut Vec<Value>, column: &str, axis: Option<&AxisFilter>) {
    let (negate, values) = match axis {
        None => return,
        Some(AxisFilter::Include(v)) => (false, v),
        Some(AxisFilter::Exclude(v)) => (true, v),
    };
    if values.is_empty() {
        // Including nothing admits nobody; excluding nothing is a no-op.
        if !negate {
            sql.push_str("\n               AND 0");
        }
        return;
    }
    let placeholders: Vec<String> = values
        .iter()
        .map(|v| {
            params.push(Value::Text(v.clone()));
            format!("?{}", params.len())
        })
        .collect();
    let op = if negate { "NOT IN" } else { "IN" };
    sql.push_str(&format!("\n               AND {column} {op} ({})", placeholders.join(", ")));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn parses_include_and_exclude_axes() {
        let spec = FilterSpec::from_json(
            r#"{"states": {"include": ["Punjab"]}, "facilities": {"exclude": ["f9"]}}"#,
        )
        .unwrap();
        assert_eq!(spec.states, Some(AxisFilter::Include(vec!["Punjab".into()])));
        assert_eq!(spec.blocks, None);
        assert_eq!(spec.facilities, Some(AxisFilter::Exclude(vec!["f9".into()])));
    }

    #[test]
    fn rejects_axis_with_both_lists() {
        let err = FilterSpec::from_json(r#"{"blocks": {"include": ["b1"], "exclude": ["b2"]}}"#)
            .unwrap_err();
        match err {
            ExperimentError::InvalidFilter { axis, .. } => assert_eq!(axis, "blocks"),
            other => panic!("expected InvalidFilter, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_axis() {
        assert!(matches!(
            FilterSpec::from_json(r#"{"districts": {"include": ["d1"]}}"#),
            Err(ExperimentError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn empty_axis_object_is_ignored() {
        let spec = FilterSpec::from_json(r#"{"states": {}}"#).unwrap();
        assert_eq!(spec, FilterSpec::default());
    }

    #[test]
    fn json_form_survives_a_store_round_trip() {
        let spec = FilterSpec {
            states: Some(AxisFilter::Exclude(vec!["Kerala".into()])),
            blocks: None,
            facilities: Some(AxisFilter::Include(vec!["f1".into(), "f2".into()])),
        };
        let json = spec.to_json().unwrap();
        assert_eq!(FilterSpec::from_json(&json).unwrap(), spec);
    }

    #[test]
    fn every_supplied_axis_becomes_a_conjunct() {
        let spec = FilterSpec {
            states: Some(AxisFilter::Include(vec!["A".into()])),
            blocks: Some(AxisFilter::Exclude(vec!["b1".into(), "b2".into()])),
            facilities: Some(AxisFilter::Include(vec!["f1".into()])),
        };
        let query = EligibilityQuery::new(as_of(), 18, 14, spec);
        let (sql, params) = query.to_sql(None, 50);

        assert!(sql.contains("AND f.state IN (?4)"));
        assert!(sql.contains("AND f.block_region_id NOT IN (?5, ?6)"));
        assert!(sql.contains("AND p.assigned_facility_id IN (?7)"));
        assert!(sql.ends_with("LIMIT ?8"));
        assert_eq!(params.len(), 8);
        assert_eq!(params[7], Value::Integer(50));
    }

    #[test]
    fn empty_include_admits_nobody() {
        let spec = FilterSpec {
            facilities: Some(AxisFilter::Include(vec![])),
            ..FilterSpec::default()
        };
        let (sql, _) = EligibilityQuery::new(as_of(), 18, 14, spec).to_sql(None, 10);
        assert!(sql.contains("AND 0"));
    }

    #[test]
    fn cursor_and_buffer_parameters() {
        let query = EligibilityQuery::new(as_of(), 18, 30, FilterSpec::default());
        let (sql, params) = query.to_sql(Some(&"p-000100".to_string()), 10);
        assert!(sql.contains("AND p.patient_id > ?4"));
        assert_eq!(params[0], Value::Text("2006-03-01".into()));
        assert_eq!(params[2], Value::Text("2024-01-31".into()));
        assert_eq!(params[3], Value::Text("p-000100".into()));
    }
}
