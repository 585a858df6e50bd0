use super::{col_date, col_enum, col_opt_ts, opt_ts, ExperimentStore};
use crate::{
    eligibility::FilterSpec,
    error::{ExperimentError, ExperimentResult},
    experiment::{Experiment, ExperimentState, ReminderTemplate, TreatmentGroup},
    types::{fmt_date, fmt_timestamp, now},
};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};

const EXPERIMENT_COLUMNS: &str = "experiment_id, lookup_name, state, experiment_type, start_date,
    end_date, max_patients_per_day, filters, cancelled_at";

// Groups are attached afterwards by `with_groups`.
fn experiment_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Experiment, String)> {
    Ok((
        Experiment {
            experiment_id: row.get(0)?,
            lookup_name: row.get(1)?,
            state: col_enum(row, 2)?,
            experiment_type: col_enum(row, 3)?,
            start_date: col_date(row, 4)?,
            end_date: col_date(row, 5)?,
            max_patients_per_day: row.get(6)?,
            filters: FilterSpec::default(),
            cancelled_at: col_opt_ts(row, 8)?,
            treatment_groups: Vec::new(),
        },
        row.get(7)?,
    ))
}

impl ExperimentStore {
    // ── Experiments ────────────────────────────────────────────

    /// Insert an experiment with its groups and templates atomically.
    pub fn insert_experiment(&self, e: &Experiment) -> ExperimentResult<()> {
        let filters = e.filters.to_json()?;
        let created_at = fmt_timestamp(now());
        self.in_transaction(|store| {
            store.conn.execute(
                "INSERT INTO experiments (
                    experiment_id, lookup_name, state, experiment_type, start_date, end_date,
                    max_patients_per_day, filters, cancelled_at, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    &e.experiment_id,
                    &e.lookup_name,
                    e.state.as_str(),
                    e.experiment_type.as_str(),
                    fmt_date(e.start_date),
                    fmt_date(e.end_date),
                    e.max_patients_per_day,
                    filters,
                    opt_ts(e.cancelled_at),
                    created_at,
                ],
            )?;
            for group in &e.treatment_groups {
                store.conn.execute(
                    "INSERT INTO treatment_groups (group_id, experiment_id, description, weight)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![&group.group_id, &e.experiment_id, &group.description, group.weight],
                )?;
                for t in &group.templates {
                    store.conn.execute(
                        "INSERT INTO reminder_templates (template_id, treatment_group_id, remind_on_in_days, message)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![&t.template_id, &group.group_id, t.remind_on_in_days, &t.message],
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn experiment_by_lookup_name(&self, lookup_name: &str) -> ExperimentResult<Option<Experiment>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE lookup_name = ?1"),
                params![lookup_name],
                experiment_row_mapper,
            )
            .optional()?;
        row.map(|r| self.with_groups(r)).transpose()
    }

    pub fn get_experiment(&self, experiment_id: &str) -> ExperimentResult<Option<Experiment>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE experiment_id = ?1"),
                params![experiment_id],
                experiment_row_mapper,
            )
            .optional()?;
        row.map(|r| self.with_groups(r)).transpose()
    }

    /// Experiments in any active state, oldest start first.
    pub fn active_experiments(&self) -> ExperimentResult<Vec<Experiment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments
             WHERE state <> ?1
             ORDER BY start_date ASC, lookup_name ASC"
        ))?;
        let rows = stmt
            .query_map(params![ExperimentState::Inactive.as_str()], experiment_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|r| self.with_groups(r)).collect()
    }

    pub fn set_experiment_state(
        &self,
        experiment_id: &str,
        state: ExperimentState,
        at: NaiveDateTime,
    ) -> ExperimentResult<()> {
        let changed = self.conn.execute(
            "UPDATE experiments SET state = ?2, updated_at = ?3 WHERE experiment_id = ?1",
            params![experiment_id, state.as_str(), fmt_timestamp(at)],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("experiment", experiment_id));
        }
        Ok(())
    }

    /// Deactivate and stamp the cancellation time. Callers own the transaction.
    pub fn mark_experiment_cancelled(
        &self,
        experiment_id: &str,
        at: NaiveDateTime,
    ) -> ExperimentResult<()> {
        let changed = self.conn.execute(
            "UPDATE experiments SET state = ?2, cancelled_at = ?3, updated_at = ?3
             WHERE experiment_id = ?1",
            params![experiment_id, ExperimentState::Inactive.as_str(), fmt_timestamp(at)],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("experiment", experiment_id));
        }
        Ok(())
    }

    fn with_groups(&self, (mut experiment, filters): (Experiment, String)) -> ExperimentResult<Experiment> {
        experiment.filters = FilterSpec::from_json(&filters)?;
        experiment.treatment_groups = self.treatment_groups(&experiment.experiment_id)?;
        Ok(experiment)
    }

    fn treatment_groups(&self, experiment_id: &str) -> ExperimentResult<Vec<TreatmentGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, experiment_id, description, weight
             FROM treatment_groups WHERE experiment_id = ?1
             ORDER BY group_id ASC",
        )?;
        let mut groups = stmt
            .query_map(params![experiment_id], |row| {
                Ok(TreatmentGroup {
                    group_id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    description: row.get(2)?,
                    weight: row.get(3)?,
                    templates: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT template_id, treatment_group_id, remind_on_in_days, message
             FROM reminder_templates WHERE treatment_group_id = ?1
             ORDER BY remind_on_in_days ASC, template_id ASC",
        )?;
        for group in &mut groups {
            group.templates = stmt
                .query_map(params![&group.group_id], |row| {
                    Ok(ReminderTemplate {
                        template_id: row.get(0)?,
                        treatment_group_id: row.get(1)?,
                        remind_on_in_days: row.get(2)?,
                        message: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(groups)
    }
}
