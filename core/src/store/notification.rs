use super::{col_date, col_enum, col_opt_ts, col_ts, opt_ts, ExperimentStore};
use crate::{
    error::{ExperimentError, ExperimentResult},
    membership::MembershipStatus,
    notification::{Communication, DeliveryStatus, Notification, NotificationStatus},
    types::{fmt_date, fmt_timestamp},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};

const NOTIFICATION_COLUMNS: &str = "notification_id, experiment_id, patient_id, reminder_template_id,
    purpose, message, subject_type, subject_id, remind_on, status, created_at, updated_at";

fn notification_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        notification_id: row.get(0)?,
        experiment_id: row.get(1)?,
        patient_id: row.get(2)?,
        reminder_template_id: row.get(3)?,
        purpose: row.get(4)?,
        message: row.get(5)?,
        subject_type: row.get(6)?,
        subject_id: row.get(7)?,
        remind_on: col_date(row, 8)?,
        status: col_enum(row, 9)?,
        created_at: col_ts(row, 10)?,
        updated_at: col_ts(row, 11)?,
    })
}

const COMMUNICATION_COLUMNS: &str = "communication_id, notification_id, channel, provider_message_id,
    delivery_status, delivered_at, created_at";

fn communication_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Communication> {
    Ok(Communication {
        communication_id: row.get(0)?,
        notification_id: row.get(1)?,
        channel: col_enum(row, 2)?,
        provider_message_id: row.get(3)?,
        delivery_status: col_enum(row, 4)?,
        delivered_at: col_opt_ts(row, 5)?,
        created_at: col_ts(row, 6)?,
    })
}

impl ExperimentStore {
    // ── Notifications ──────────────────────────────────────────

    pub fn notification_exists(
        &self,
        experiment_id: &str,
        template_id: &str,
        patient_id: &str,
    ) -> ExperimentResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM notifications
                 WHERE experiment_id = ?1 AND reminder_template_id = ?2 AND patient_id = ?3",
                params![experiment_id, template_id, patient_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns false when a notification for the same
    /// (experiment, template, patient) already exists.
    pub fn insert_notification(&self, n: &Notification) -> ExperimentResult<bool> {
        let changed = self.conn.execute(
            &format!(
                "INSERT INTO notifications ({NOTIFICATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (experiment_id, reminder_template_id, patient_id) DO NOTHING"
            ),
            params![
                &n.notification_id,
                &n.experiment_id,
                &n.patient_id,
                &n.reminder_template_id,
                &n.purpose,
                &n.message,
                &n.subject_type,
                n.subject_id.as_deref(),
                fmt_date(n.remind_on),
                n.status.as_str(),
                fmt_timestamp(n.created_at),
                fmt_timestamp(n.updated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_notification(&self, notification_id: &str) -> ExperimentResult<Option<Notification>> {
        self.conn
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE notification_id = ?1"),
                params![notification_id],
                notification_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn notifications_for_experiment(&self, experiment_id: &str) -> ExperimentResult<Vec<Notification>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE experiment_id = ?1
             ORDER BY remind_on ASC, patient_id ASC, reminder_template_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![experiment_id], notification_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// One keyset page of pending notifications whose reminder date has arrived.
    pub fn pending_notifications_due(
        &self,
        date: NaiveDate,
        after: Option<&str>,
        limit: usize,
    ) -> ExperimentResult<Vec<Notification>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE status = 'pending' AND remind_on <= ?1 AND notification_id > ?2
             ORDER BY notification_id ASC
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![fmt_date(date), after.unwrap_or(""), limit as i64],
                notification_row_mapper,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_notification_status(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        at: NaiveDateTime,
    ) -> ExperimentResult<()> {
        let changed = self.conn.execute(
            "UPDATE notifications SET status = ?2, updated_at = ?3 WHERE notification_id = ?1",
            params![notification_id, status.as_str(), fmt_timestamp(at)],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("notification", notification_id));
        }
        Ok(())
    }

    /// Cancel pending notifications of patients whose membership in this
    /// experiment is in `status`. Returns the number cancelled.
    pub fn cancel_pending_notifications_for_status(
        &self,
        experiment_id: &str,
        status: MembershipStatus,
        at: NaiveDateTime,
    ) -> ExperimentResult<usize> {
        let changed = self.conn.execute(
            "UPDATE notifications SET status = 'cancelled', updated_at = ?3
             WHERE experiment_id = ?1 AND status = 'pending'
               AND patient_id IN (
                   SELECT patient_id FROM treatment_group_memberships
                   WHERE experiment_id = ?1 AND status = ?2
               )",
            params![experiment_id, status.as_str(), fmt_timestamp(at)],
        )?;
        Ok(changed)
    }

    /// Cancel every pending notification of the experiment.
    pub fn cancel_pending_notifications(
        &self,
        experiment_id: &str,
        at: NaiveDateTime,
    ) -> ExperimentResult<usize> {
        let changed = self.conn.execute(
            "UPDATE notifications SET status = 'cancelled', updated_at = ?2
             WHERE experiment_id = ?1 AND status = 'pending'",
            params![experiment_id, fmt_timestamp(at)],
        )?;
        Ok(changed)
    }

    pub fn count_notifications(
        &self,
        experiment_id: &str,
        status: Option<NotificationStatus>,
    ) -> ExperimentResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications
             WHERE experiment_id = ?1 AND (?2 IS NULL OR status = ?2)",
            params![experiment_id, status.map(|s| s.as_str())],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Communications ─────────────────────────────────────────

    pub fn insert_communication(&self, c: &Communication) -> ExperimentResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO communications ({COMMUNICATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                &c.communication_id,
                &c.notification_id,
                c.channel.as_str(),
                &c.provider_message_id,
                c.delivery_status.as_str(),
                opt_ts(c.delivered_at),
                fmt_timestamp(c.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn communications_for(&self, notification_id: &str) -> ExperimentResult<Vec<Communication>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMUNICATION_COLUMNS} FROM communications
             WHERE notification_id = ?1
             ORDER BY created_at ASC, communication_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![notification_id], communication_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Apply a provider status callback. `delivered_at` is only set once.
    pub fn update_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        delivered_at: Option<NaiveDateTime>,
    ) -> ExperimentResult<Communication> {
        let changed = self.conn.execute(
            "UPDATE communications
             SET delivery_status = ?2, delivered_at = COALESCE(delivered_at, ?3)
             WHERE provider_message_id = ?1",
            params![provider_message_id, status.as_str(), opt_ts(delivered_at)],
        )?;
        if changed == 0 {
            return Err(ExperimentError::not_found("communication", provider_message_id));
        }
        self.conn
            .query_row(
                &format!("SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE provider_message_id = ?1"),
                params![provider_message_id],
                communication_row_mapper,
            )
            .map_err(Into::into)
    }
}
