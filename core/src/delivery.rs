//! Bridge to the outbound delivery channel (SMS / WhatsApp).
//!
//! `dispatch_due` hands pending reminders whose date has arrived to a
//! `DeliveryChannel` and records the attempt. A channel error marks the
//! notification failed; there is no retry. The next monitoring run turns
//! that into a `failed` ledger result and evicts the membership.
//!
//! Provider callbacks arrive through `record_delivery_status`. Verifying
//! callback signatures is the transport's job, not this module's.

use crate::{
    error::{ExperimentError, ExperimentResult},
    event::ExperimentEvent,
    notification::{Channel, Communication, DeliveryStatus, Notification, NotificationStatus},
    store::ExperimentStore,
    types::{new_id, now, NotificationId, PatientId},
};
use chrono::{NaiveDate, NaiveDateTime};

/// What the channel needs to deliver one reminder.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub notification_id: NotificationId,
    pub patient_id:      PatientId,
    pub phone_number:    String,
    /// Message key; localisation happens downstream.
    pub message:         String,
    pub remind_on:       NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    pub provider_message_id: String,
    pub initial_status:      DeliveryStatus,
    pub channel:             Channel,
}

pub trait DeliveryChannel {
    fn send(&self, message: &OutboundMessage) -> ExperimentResult<DispatchReceipt>;
}

/// Send every pending notification with `remind_on <= date`.
pub fn dispatch_due(
    store: &ExperimentStore,
    date: NaiveDate,
    channel: &dyn DeliveryChannel,
    batch_size: usize,
) -> ExperimentResult<Vec<ExperimentEvent>> {
    let mut events = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store.pending_notifications_due(date, cursor.as_deref(), batch_size)?;
        let Some(last) = page.last() else { break };
        cursor = Some(last.notification_id.clone());

        for notification in &page {
            match dispatch_one(store, notification, channel) {
                Ok(event) => events.push(event),
                Err(err) if err.is_record_scoped() => {
                    log::warn!("Not dispatching {}: {err}", notification.notification_id);
                }
                Err(err) => return Err(err),
            }
        }
    }
    log::info!("Dispatched {} notifications due by {date}", events.len());
    Ok(events)
}

fn dispatch_one(
    store: &ExperimentStore,
    notification: &Notification,
    channel: &dyn DeliveryChannel,
) -> ExperimentResult<ExperimentEvent> {
    let patient = store
        .get_patient(&notification.patient_id)?
        .ok_or_else(|| ExperimentError::not_found("patient", &notification.patient_id))?;

    let phone_number = patient
        .is_contactable()
        .then(|| patient.phone_number.clone())
        .flatten();
    let sent = match phone_number {
        Some(phone_number) => channel.send(&OutboundMessage {
            notification_id: notification.notification_id.clone(),
            patient_id:      notification.patient_id.clone(),
            phone_number,
            message:         notification.message.clone(),
            remind_on:       notification.remind_on,
        }),
        None => Err(ExperimentError::Delivery {
            reason: format!("patient {} has no active phone number", patient.patient_id),
        }),
    };

    let at = now();
    match sent {
        Ok(receipt) => {
            let communication = Communication {
                communication_id:    new_id(),
                notification_id:     notification.notification_id.clone(),
                channel:             receipt.channel,
                provider_message_id: receipt.provider_message_id.clone(),
                delivery_status:     receipt.initial_status,
                delivered_at:        receipt.initial_status.is_success().then_some(at),
                created_at:          at,
            };
            store.in_transaction(|store| {
                store.insert_communication(&communication)?;
                store.set_notification_status(&notification.notification_id, NotificationStatus::Sent, at)
            })?;
            Ok(ExperimentEvent::NotificationDispatched {
                notification_id:     notification.notification_id.clone(),
                channel:             receipt.channel,
                provider_message_id: receipt.provider_message_id,
            })
        }
        Err(err) => {
            log::warn!("Dispatch of {} failed: {err}", notification.notification_id);
            store.set_notification_status(&notification.notification_id, NotificationStatus::Failed, at)?;
            Ok(ExperimentEvent::NotificationDispatchFailed {
                notification_id: notification.notification_id.clone(),
                reason:          err.to_string(),
            })
        }
    }
}

/// Apply a provider delivery callback. Successful statuses stamp `delivered_at`.
pub fn record_delivery_status(
    store: &ExperimentStore,
    provider_message_id: &str,
    status: DeliveryStatus,
    at: NaiveDateTime,
) -> ExperimentResult<ExperimentEvent> {
    let delivered_at = status.is_success().then_some(at);
    let communication = store.update_delivery_status(provider_message_id, status, delivered_at)?;
    log::debug!(
        "Delivery status for {provider_message_id} is now {}",
        status.as_str()
    );
    Ok(ExperimentEvent::DeliveryStatusUpdated {
        notification_id:     communication.notification_id,
        provider_message_id: communication.provider_message_id,
        status,
    })
}
