use super::{col_date, col_enum, col_opt_date, col_opt_ts, col_ts, opt_date, opt_ts, ExperimentStore};
use crate::{
    clinical::{Appointment, AppointmentStatus, BloodPressure, BloodSugar, Facility, Patient, PrescriptionDrug},
    eligibility::PATIENT_COLUMNS,
    error::{ExperimentError, ExperimentResult},
    membership::{VisitKind, VisitMarker},
    types::{fmt_date, fmt_timestamp},
};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};

pub(super) fn patient_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        patient_id: row.get(0)?,
        full_name: row.get(1)?,
        gender: row.get(2)?,
        birth_date: col_date(row, 3)?,
        phone_number: row.get(4)?,
        phone_active: row.get::<_, i32>(5)? != 0,
        has_hypertension: row.get::<_, i32>(6)? != 0,
        assigned_facility_id: row.get(7)?,
        registration_facility_id: row.get(8)?,
        deleted_at: col_opt_ts(row, 9)?,
    })
}

fn facility_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Facility> {
    Ok(Facility {
        facility_id: row.get(0)?,
        name: row.get(1)?,
        facility_type: row.get(2)?,
        block_region_id: row.get(3)?,
        block: row.get(4)?,
        district: row.get(5)?,
        state: row.get(6)?,
    })
}

const APPOINTMENT_COLUMNS: &str = "appointment_id, patient_id, facility_id, creation_facility_id,
    scheduled_date, remind_on, status, created_at";

fn appointment_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        appointment_id: row.get(0)?,
        patient_id: row.get(1)?,
        facility_id: row.get(2)?,
        creation_facility_id: row.get(3)?,
        scheduled_date: col_date(row, 4)?,
        remind_on: col_opt_date(row, 5)?,
        status: col_enum(row, 6)?,
        created_at: col_ts(row, 7)?,
    })
}

impl ExperimentStore {
    // ── Facilities ─────────────────────────────────────────────

    pub fn insert_facility(&self, f: &Facility) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO facilities (facility_id, name, facility_type, block_region_id, block, district, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &f.facility_id,
                &f.name,
                &f.facility_type,
                &f.block_region_id,
                &f.block,
                &f.district,
                &f.state,
            ],
        )?;
        Ok(())
    }

    pub fn get_facility(&self, facility_id: &str) -> ExperimentResult<Option<Facility>> {
        self.conn
            .query_row(
                "SELECT facility_id, name, facility_type, block_region_id, block, district, state
                 FROM facilities WHERE facility_id = ?1",
                params![facility_id],
                facility_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    // ── Patients ───────────────────────────────────────────────

    pub fn insert_patient(&self, p: &Patient) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO patients (
                patient_id, full_name, gender, birth_date, phone_number, phone_active,
                has_hypertension, assigned_facility_id, registration_facility_id, deleted_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &p.patient_id,
                &p.full_name,
                &p.gender,
                fmt_date(p.birth_date),
                p.phone_number.as_deref(),
                if p.phone_active { 1i32 } else { 0i32 },
                if p.has_hypertension { 1i32 } else { 0i32 },
                p.assigned_facility_id.as_deref(),
                p.registration_facility_id.as_deref(),
                opt_ts(p.deleted_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_patient(&self, patient_id: &str) -> ExperimentResult<Option<Patient>> {
        self.conn
            .query_row(
                &format!("SELECT {PATIENT_COLUMNS} FROM patients p WHERE p.patient_id = ?1"),
                params![patient_id],
                patient_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn soft_delete_patient(&self, patient_id: &str, at: NaiveDateTime) -> ExperimentResult<()> {
        let changed = self.conn.execute(
            "UPDATE patients SET deleted_at = ?2 WHERE patient_id = ?1",
            params![patient_id, fmt_timestamp(at)],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("patient", patient_id));
        }
        Ok(())
    }

    // ── Appointments ───────────────────────────────────────────

    pub fn insert_appointment(&self, a: &Appointment) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO appointments (
                appointment_id, patient_id, facility_id, creation_facility_id,
                scheduled_date, remind_on, status, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &a.appointment_id,
                &a.patient_id,
                &a.facility_id,
                a.creation_facility_id.as_deref(),
                fmt_date(a.scheduled_date),
                opt_date(a.remind_on),
                a.status.as_str(),
                fmt_timestamp(a.created_at),
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable parts of an appointment (status and reminder date).
    pub fn update_appointment(&self, a: &Appointment) -> ExperimentResult<()> {
        let changed = self.conn.execute(
            "UPDATE appointments SET status = ?2, remind_on = ?3, scheduled_date = ?4
             WHERE appointment_id = ?1",
            params![
                &a.appointment_id,
                a.status.as_str(),
                opt_date(a.remind_on),
                fmt_date(a.scheduled_date),
            ],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("appointment", &a.appointment_id));
        }
        Ok(())
    }

    /// Hard-delete an appointment row. Returns false when it did not exist.
    pub fn delete_appointment(&self, appointment_id: &str) -> ExperimentResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM appointments WHERE appointment_id = ?1",
            params![appointment_id],
        )?;
        Ok(removed > 0)
    }

    pub fn get_appointment(&self, appointment_id: &str) -> ExperimentResult<Option<Appointment>> {
        self.conn
            .query_row(
                &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE appointment_id = ?1"),
                params![appointment_id],
                appointment_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    /// The patient's most recent scheduled appointment: latest scheduled date,
    /// newest creation breaking ties.
    pub fn latest_scheduled_appointment(
        &self,
        patient_id: &str,
    ) -> ExperimentResult<Option<Appointment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {APPOINTMENT_COLUMNS} FROM appointments
                     WHERE patient_id = ?1 AND status = ?2
                     ORDER BY scheduled_date DESC, created_at DESC, appointment_id DESC
                     LIMIT 1"
                ),
                params![patient_id, AppointmentStatus::Scheduled.as_str()],
                appointment_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    // ── Clinical events ────────────────────────────────────────

    pub fn insert_blood_pressure(&self, bp: &BloodPressure) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO blood_pressures (id, patient_id, facility_id, systolic, diastolic, recorded_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &bp.id,
                &bp.patient_id,
                &bp.facility_id,
                bp.systolic,
                bp.diastolic,
                fmt_timestamp(bp.recorded_at),
                opt_ts(bp.deleted_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_blood_sugar(&self, bs: &BloodSugar) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO blood_sugars (id, patient_id, facility_id, sugar_type, value, recorded_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &bs.id,
                &bs.patient_id,
                &bs.facility_id,
                &bs.sugar_type,
                bs.value,
                fmt_timestamp(bs.recorded_at),
                opt_ts(bs.deleted_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_prescription_drug(&self, pd: &PrescriptionDrug) -> ExperimentResult<()> {
        self.conn.execute(
            "INSERT INTO prescription_drugs (id, patient_id, facility_id, name, device_created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &pd.id,
                &pd.patient_id,
                &pd.facility_id,
                &pd.name,
                fmt_timestamp(pd.device_created_at),
                opt_ts(pd.deleted_at),
            ],
        )?;
        Ok(())
    }

    pub fn latest_blood_pressure(&self, patient_id: &str) -> ExperimentResult<Option<BloodPressure>> {
        self.conn
            .query_row(
                "SELECT id, patient_id, facility_id, systolic, diastolic, recorded_at, deleted_at
                 FROM blood_pressures
                 WHERE patient_id = ?1 AND deleted_at IS NULL
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT 1",
                params![patient_id],
                |row| {
                    Ok(BloodPressure {
                        id: row.get(0)?,
                        patient_id: row.get(1)?,
                        facility_id: row.get(2)?,
                        systolic: row.get(3)?,
                        diastolic: row.get(4)?,
                        recorded_at: col_ts(row, 5)?,
                        deleted_at: col_opt_ts(row, 6)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Earliest non-deleted blood pressure, blood sugar or prescription
    /// strictly after `after` (a stored timestamp string).
    pub fn earliest_visit_after(
        &self,
        patient_id: &str,
        after: &str,
    ) -> ExperimentResult<Option<VisitMarker>> {
        self.conn
            .query_row(
                "SELECT kind, id, facility_id, occurred_at FROM (
                    SELECT 'blood_pressure' AS kind, id, facility_id, recorded_at AS occurred_at
                    FROM blood_pressures
                    WHERE patient_id = ?1 AND recorded_at > ?2 AND deleted_at IS NULL
                    UNION ALL
                    SELECT 'blood_sugar', id, facility_id, recorded_at
                    FROM blood_sugars
                    WHERE patient_id = ?1 AND recorded_at > ?2 AND deleted_at IS NULL
                    UNION ALL
                    SELECT 'prescription_drug', id, facility_id, device_created_at
                    FROM prescription_drugs
                    WHERE patient_id = ?1 AND device_created_at > ?2 AND deleted_at IS NULL
                 )
                 ORDER BY occurred_at ASC, kind ASC
                 LIMIT 1",
                params![patient_id, after],
                |row| {
                    Ok(VisitMarker {
                        kind: col_enum::<VisitKind>(row, 0)?,
                        event_id: row.get(1)?,
                        facility_id: row.get(2)?,
                        visited_at: col_ts(row, 3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }
}
