use super::{clinical::patient_row_mapper, ExperimentStore};
use crate::{clinical::Patient, eligibility::EligibilityQuery, error::ExperimentResult};
use rusqlite::params_from_iter;

impl ExperimentStore {
    // ── Eligibility ────────────────────────────────────────────

    /// One keyset page of eligible patients, ordered by patient id.
    pub fn eligible_patients_page(
        &self,
        query: &EligibilityQuery,
        after: Option<&String>,
        limit: usize,
    ) -> ExperimentResult<Vec<Patient>> {
        let (sql, values) = query.to_sql(after, limit);
        let mut stmt = self.conn.prepare(&sql)?;
        let patients = stmt
            .query_map(params_from_iter(values.iter()), patient_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(patients)
    }
}
