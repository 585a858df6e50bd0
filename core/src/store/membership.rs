use super::{col_date, col_enum, col_json, col_opt_date, col_opt_enum, col_opt_ts, col_ts, is_unique_violation, opt_date, ExperimentStore};
use crate::{
    error::{ExperimentError, ExperimentResult},
    eviction::EvictionReason,
    ledger::MessageLedger,
    membership::{Membership, MembershipStatus, VisitKind, VisitMarker},
    types::{fmt_date, fmt_timestamp},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};

/// Which memberships a paged scan walks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipScope {
    All,
    Enrolled,
    /// Enrolled, or evicted before any visit was recorded.
    AwaitingVisit,
}

impl MembershipScope {
    fn clause(&self) -> &'static str {
        match self {
            Self::All => "1",
            Self::Enrolled => "status = 'enrolled'",
            Self::AwaitingVisit => {
                "(status = 'enrolled' OR (status = 'evicted' AND visited_at IS NULL))"
            }
        }
    }
}

const MEMBERSHIP_COLUMNS: &str = "membership_id, experiment_id, treatment_group_id, patient_id,
    status, status_reason, experiment_inclusion_date, expected_return_date, appointment_id,
    messages, visit_kind, visit_event_id, visit_facility_id, visited_at, reporting_data, created_at";

fn membership_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Membership> {
    let visit_kind: Option<VisitKind> = col_opt_enum(row, 10)?;
    let visit_event_id: Option<String> = row.get(11)?;
    let visited_at = col_opt_ts(row, 13)?;
    let visit = match (visit_kind, visit_event_id, visited_at) {
        (Some(kind), Some(event_id), Some(visited_at)) => Some(VisitMarker {
            kind,
            event_id,
            facility_id: row.get(12)?,
            visited_at,
        }),
        _ => None,
    };
    Ok(Membership {
        membership_id: row.get(0)?,
        experiment_id: row.get(1)?,
        treatment_group_id: row.get(2)?,
        patient_id: row.get(3)?,
        status: col_enum(row, 4)?,
        status_reason: col_opt_enum::<EvictionReason>(row, 5)?,
        experiment_inclusion_date: col_date(row, 6)?,
        expected_return_date: col_opt_date(row, 7)?,
        appointment_id: row.get(8)?,
        messages: col_json(row, 9)?,
        visit,
        reporting: col_json(row, 14)?,
        created_at: col_ts(row, 15)?,
    })
}

impl ExperimentStore {
    // ── Memberships ────────────────────────────────────────────

    /// Insert a new membership. A second membership for the same
    /// (patient, experiment) surfaces as `DuplicateEnrollment`.
    pub fn insert_membership(&self, m: &Membership) -> ExperimentResult<()> {
        self.insert_membership_capped(m, None).map(|_| ())
    }

    /// Insert a membership only while fewer than `cap` memberships of the
    /// experiment share its inclusion date. Count and insert are a single
    /// statement, so the cap holds across connections.
    /// Returns false when the day is already full.
    pub fn insert_membership_within_cap(&self, m: &Membership, cap: i64) -> ExperimentResult<bool> {
        self.insert_membership_capped(m, Some(cap))
    }

    fn insert_membership_capped(&self, m: &Membership, cap: Option<i64>) -> ExperimentResult<bool> {
        let messages = serde_json::to_string(&m.messages)?;
        let reporting = serde_json::to_string(&m.reporting)?;
        let visit = m.visit.as_ref();
        let result = self.conn.execute(
            &format!(
                "INSERT INTO treatment_group_memberships ({MEMBERSHIP_COLUMNS})
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16
                 WHERE ?17 IS NULL
                    OR (SELECT COUNT(*) FROM treatment_group_memberships
                        WHERE experiment_id = ?2 AND experiment_inclusion_date = ?7) < ?17"
            ),
            params![
                &m.membership_id,
                &m.experiment_id,
                &m.treatment_group_id,
                &m.patient_id,
                m.status.as_str(),
                m.status_reason.map(|r| r.as_str()),
                fmt_date(m.experiment_inclusion_date),
                opt_date(m.expected_return_date),
                m.appointment_id.as_deref(),
                messages,
                visit.map(|v| v.kind.as_str()),
                visit.map(|v| v.event_id.as_str()),
                visit.and_then(|v| v.facility_id.as_deref()),
                visit.map(|v| fmt_timestamp(v.visited_at)),
                reporting,
                fmt_timestamp(m.created_at),
                cap,
            ],
        );
        match result {
            Ok(inserted) => Ok(inserted == 1),
            Err(e) if is_unique_violation(&e) => Err(ExperimentError::DuplicateEnrollment {
                patient_id: m.patient_id.clone(),
                experiment_id: m.experiment_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_membership(
        &self,
        experiment_id: &str,
        patient_id: &str,
    ) -> ExperimentResult<Option<Membership>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {MEMBERSHIP_COLUMNS} FROM treatment_group_memberships
                     WHERE experiment_id = ?1 AND patient_id = ?2"
                ),
                params![experiment_id, patient_id],
                membership_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    /// One keyset page of an experiment's memberships, ordered by membership id.
    pub fn memberships_page(
        &self,
        experiment_id: &str,
        scope: MembershipScope,
        after: Option<&str>,
        limit: usize,
    ) -> ExperimentResult<Vec<Membership>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM treatment_group_memberships
             WHERE experiment_id = ?1 AND {} AND membership_id > ?2
             ORDER BY membership_id ASC
             LIMIT ?3",
            scope.clause()
        ))?;
        let rows = stmt
            .query_map(
                params![experiment_id, after.unwrap_or(""), limit as i64],
                membership_row_mapper,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Memberships created for `date`, whatever their current status.
    pub fn count_enrolled_on(&self, experiment_id: &str, date: NaiveDate) -> ExperimentResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM treatment_group_memberships
             WHERE experiment_id = ?1 AND experiment_inclusion_date = ?2",
            params![experiment_id, fmt_date(date)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_memberships(
        &self,
        experiment_id: &str,
        status: Option<MembershipStatus>,
    ) -> ExperimentResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM treatment_group_memberships
             WHERE experiment_id = ?1 AND (?2 IS NULL OR status = ?2)",
            params![experiment_id, status.map(|s| s.as_str())],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn update_membership_messages(
        &self,
        membership_id: &str,
        messages: &MessageLedger,
    ) -> ExperimentResult<()> {
        let changed = self.conn.execute(
            "UPDATE treatment_group_memberships SET messages = ?2 WHERE membership_id = ?1",
            params![membership_id, serde_json::to_string(messages)?],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("membership", membership_id));
        }
        Ok(())
    }

    /// enrolled -> evicted. Returns false when the membership already left `enrolled`.
    pub fn evict_membership(
        &self,
        membership_id: &str,
        reason: EvictionReason,
        at: NaiveDateTime,
    ) -> ExperimentResult<bool> {
        let changed = self.conn.execute(
            "UPDATE treatment_group_memberships
             SET status = 'evicted', status_reason = ?2, status_updated_at = ?3
             WHERE membership_id = ?1 AND status = 'enrolled'",
            params![membership_id, reason.as_str(), fmt_timestamp(at)],
        )?;
        Ok(changed > 0)
    }

    /// Record a visit. Enrolled memberships move to `visited`; evicted ones
    /// keep their status and only gain the marker. Returns false when the
    /// membership was not awaiting a visit.
    pub fn record_membership_visit(
        &self,
        membership_id: &str,
        visit: &VisitMarker,
        at: NaiveDateTime,
    ) -> ExperimentResult<bool> {
        let changed = self.conn.execute(
            "UPDATE treatment_group_memberships
             SET status_updated_at = CASE WHEN status = 'enrolled' THEN ?6 ELSE status_updated_at END,
                 status            = CASE WHEN status = 'enrolled' THEN 'visited' ELSE status END,
                 visit_kind = ?2, visit_event_id = ?3, visit_facility_id = ?4, visited_at = ?5
             WHERE membership_id = ?1
               AND (status = 'enrolled' OR (status = 'evicted' AND visited_at IS NULL))",
            params![
                membership_id,
                visit.kind.as_str(),
                &visit.event_id,
                visit.facility_id.as_deref(),
                fmt_timestamp(visit.visited_at),
                fmt_timestamp(at),
            ],
        )?;
        Ok(changed > 0)
    }
}
