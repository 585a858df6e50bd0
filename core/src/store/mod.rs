//! SQLite persistence layer.
//!
//! RULE: only store/ talks to the database.
//! Phases call store methods; they never execute SQL directly.

use crate::{
    error::{ExperimentError, ExperimentResult},
    event::EventLogEntry,
    types::{fmt_date, DATE_FORMAT, TIMESTAMP_FORMAT},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use std::str::FromStr;

mod clinical;
mod eligibility;
mod experiment;
mod membership;
mod notification;

pub use membership::MembershipScope;

pub struct ExperimentStore {
    conn: Connection,
}

impl ExperimentStore {
    pub fn open(path: &str) -> ExperimentResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> ExperimentResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order. Safe to call repeatedly.
    pub fn migrate(&self) -> ExperimentResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_clinical.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_experiments.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_notifications.sql"))?;
        Ok(())
    }

    /// Run `f` inside one transaction. Any error rolls everything back.
    /// Not reentrant: `f` must not open another transaction.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> ExperimentResult<T>,
    ) -> ExperimentResult<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_date, experiment_id, phase, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fmt_date(entry.run_date),
                entry.experiment_id,
                entry.phase,
                entry.event_type,
                entry.payload,
                crate::types::fmt_timestamp(crate::types::now()),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_date(&self, run_date: NaiveDate) -> ExperimentResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_date, experiment_id, phase, event_type, payload
             FROM event_log WHERE run_date = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![fmt_date(run_date)], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_date: col_date(row, 1)?,
                    experiment_id: row.get(2)?,
                    phase: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, experiment_id: &str, event_type: &str) -> ExperimentResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE experiment_id = ?1 AND event_type = ?2",
            params![experiment_id, event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ── Row helpers ────────────────────────────────────────────────
// Dates and timestamps are stored as text; enums as their snake_case code.

fn conversion_failure(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn col_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn col_opt_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

pub(crate) fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| {
            NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
                .map_err(|e| conversion_failure(idx, e))
        })
        .transpose()
}

pub(crate) fn col_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ExperimentError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn col_opt_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = ExperimentError>,
{
    row.get::<_, Option<String>>(idx)?
        .map(|raw| raw.parse().map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

pub(crate) fn col_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn opt_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(fmt_date)
}

pub(crate) fn opt_ts(ts: Option<NaiveDateTime>) -> Option<String> {
    ts.map(crate::types::fmt_timestamp)
}

/// True for a UNIQUE index/constraint violation (not primary key, not FK).
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
