//! Per-membership ledger: reminder template id -> delivery status record.
//!
//! Scheduling writes the initial entry when a notification is created.
//! Result recording is the only writer of the terminal result fields.

use crate::{
    notification::{Channel, DeliveryStatus, NotificationOutcome, NotificationStatus},
    types::{NotificationId, TemplateId},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub notification_id:     NotificationId,
    pub notification_status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_status_updated_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DeliveryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_communication_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_communication_type: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_communication_created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_delivery_status: Option<DeliveryStatus>,
    pub recorded_at: NaiveDateTime,
}

impl LedgerEntry {
    pub fn scheduled(notification_id: NotificationId, recorded_at: NaiveDateTime) -> Self {
        Self {
            notification_id,
            notification_status: NotificationStatus::Pending,
            notification_status_updated_at: None,
            result: None,
            successful_communication_id: None,
            successful_communication_type: None,
            successful_communication_created_at: None,
            successful_delivery_status: None,
            recorded_at,
        }
    }

    /// Entries stay open until a terminal result lands or the reminder is cancelled.
    pub fn awaiting_result(&self) -> bool {
        self.result.is_none() && self.notification_status != NotificationStatus::Cancelled
    }

    pub fn is_failed(&self) -> bool {
        self.result == Some(DeliveryResult::Failed)
    }

    /// Fold a notification's current state into this entry.
    pub fn apply_outcome(
        &mut self,
        status: NotificationStatus,
        status_updated_at: NaiveDateTime,
        outcome: &NotificationOutcome,
        recorded_at: NaiveDateTime,
    ) {
        self.notification_status = status;
        self.notification_status_updated_at = Some(status_updated_at);
        self.recorded_at = recorded_at;
        match outcome {
            NotificationOutcome::Success(comm) => {
                self.result = Some(DeliveryResult::Success);
                self.successful_communication_id = Some(comm.communication_id.clone());
                self.successful_communication_type = Some(comm.channel);
                self.successful_communication_created_at = Some(comm.created_at);
                self.successful_delivery_status = Some(comm.delivery_status);
            }
            NotificationOutcome::Failed => {
                self.result = Some(DeliveryResult::Failed);
            }
            NotificationOutcome::Unknown => {}
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MessageLedger(BTreeMap<TemplateId, LedgerEntry>);

impl MessageLedger {
    pub fn get(&self, template_id: &str) -> Option<&LedgerEntry> {
        self.0.get(template_id)
    }

    pub fn get_mut(&mut self, template_id: &str) -> Option<&mut LedgerEntry> {
        self.0.get_mut(template_id)
    }

    pub fn record(&mut self, template_id: TemplateId, entry: LedgerEntry) {
        self.0.insert(template_id, entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&TemplateId, &LedgerEntry)> {
        self.0.iter()
    }

    pub fn awaiting_results(&self) -> Vec<(TemplateId, NotificationId)> {
        self.0
            .iter()
            .filter(|(_, e)| e.awaiting_result())
            .map(|(t, e)| (t.clone(), e.notification_id.clone()))
            .collect()
    }

    /// True when any of the given templates recorded a failed delivery.
    pub fn any_failed<'a>(&self, template_ids: impl IntoIterator<Item = &'a str>) -> bool {
        template_ids
            .into_iter()
            .any(|t| self.0.get(t).is_some_and(LedgerEntry::is_failed))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Communication;
    use chrono::NaiveDate;

    fn ts(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 2).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn success_fills_communication_fields() {
        let mut entry = LedgerEntry::scheduled("n1".into(), ts(1));
        let comm = Communication {
            communication_id: "c1".into(),
            notification_id: "n1".into(),
            channel: Channel::Sms,
            provider_message_id: "SM1".into(),
            delivery_status: DeliveryStatus::Delivered,
            delivered_at: Some(ts(3)),
            created_at: ts(2),
        };
        entry.apply_outcome(NotificationStatus::Sent, ts(2), &NotificationOutcome::Success(comm), ts(4));

        assert_eq!(entry.result, Some(DeliveryResult::Success));
        assert_eq!(entry.successful_communication_id.as_deref(), Some("c1"));
        assert_eq!(entry.successful_communication_type, Some(Channel::Sms));
        assert_eq!(entry.successful_delivery_status, Some(DeliveryStatus::Delivered));
        assert!(!entry.awaiting_result());
    }

    #[test]
    fn unknown_outcome_only_refreshes_status() {
        let mut entry = LedgerEntry::scheduled("n1".into(), ts(1));
        entry.apply_outcome(NotificationStatus::Sent, ts(2), &NotificationOutcome::Unknown, ts(3));
        assert_eq!(entry.notification_status, NotificationStatus::Sent);
        assert_eq!(entry.result, None);
        assert!(entry.awaiting_result());
    }

    #[test]
    fn ledger_serializes_as_plain_map_without_empty_fields() {
        let mut ledger = MessageLedger::default();
        ledger.record("t1".into(), LedgerEntry::scheduled("n1".into(), ts(1)));
        let json = serde_json::to_value(&ledger).unwrap();
        let entry = json.get("t1").expect("keyed by template id");
        assert_eq!(entry["notification_status"], "pending");
        assert!(entry.get("result").is_none());

        let back: MessageLedger = serde_json::from_value(json).unwrap();
        assert_eq!(back, ledger);
    }

    #[test]
    fn any_failed_only_considers_listed_templates() {
        let mut ledger = MessageLedger::default();
        let mut failed = LedgerEntry::scheduled("n1".into(), ts(1));
        failed.apply_outcome(NotificationStatus::Failed, ts(2), &NotificationOutcome::Failed, ts(2));
        ledger.record("old-template".into(), failed);
        ledger.record("t1".into(), LedgerEntry::scheduled("n2".into(), ts(1)));

        assert!(!ledger.any_failed(["t1"]));
        assert!(ledger.any_failed(["t1", "old-template"]));
    }
}
