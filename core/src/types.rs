//! Shared primitive types used across the experiment core.

use chrono::{NaiveDate, NaiveDateTime};

/// Stable identifiers. Experiments, groups, templates, memberships and
/// notifications use v4 UUID strings; clinical ids come from the outer system.
pub type ExperimentId   = String;
pub type GroupId        = String;
pub type TemplateId     = String;
pub type MembershipId   = String;
pub type NotificationId = String;
pub type PatientId      = String;
pub type FacilityId     = String;
pub type AppointmentId  = String;

/// On-disk formats. Both sort lexically in chronological order.
pub const DATE_FORMAT:      &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn fmt_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Midnight at the start of `date`, as stored text.
pub fn start_of_day(date: NaiveDate) -> String {
    fmt_timestamp(date.and_time(chrono::NaiveTime::MIN))
}

pub fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
