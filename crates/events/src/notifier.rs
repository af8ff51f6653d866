//! [`Notifier`] implementations.
//!
//! [`EmailNotifier`] mails every configured recipient; [`BusNotifier`]
//! republishes the notification on the [`EventBus`] and is the fallback when
//! SMTP is not configured.

use std::sync::Arc;

use async_trait::async_trait;
use stowage_core::notify::Notifier;

use crate::bus::{BackupEvent, EventBus, NOTIFICATION};
use crate::delivery::email::EmailDelivery;

// ---------------------------------------------------------------------------
// EmailNotifier
// ---------------------------------------------------------------------------

pub struct EmailNotifier {
    delivery: EmailDelivery,
    recipients: Vec<String>,
}

impl EmailNotifier {
    pub fn new(delivery: EmailDelivery, recipients: Vec<String>) -> Self {
        Self {
            delivery,
            recipients,
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    /// True only if every recipient was reached.
    async fn send(&self, subject: &str, payload: &serde_json::Value) -> bool {
        if self.recipients.is_empty() {
            tracing::warn!(subject, "No notification recipients configured");
            return false;
        }
        let mut all_sent = true;
        for to in &self.recipients {
            if let Err(e) = self.delivery.deliver(to, subject, payload).await {
                tracing::error!(to = %to, subject, error = %e, "Notification email failed");
                all_sent = false;
            }
        }
        all_sent
    }
}

// ---------------------------------------------------------------------------
// BusNotifier
// ---------------------------------------------------------------------------

pub struct BusNotifier {
    bus: Arc<EventBus>,
}

impl BusNotifier {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn send(&self, subject: &str, payload: &serde_json::Value) -> bool {
        tracing::warn!(subject, %payload, "Operator notification");
        self.bus.publish(BackupEvent::new(NOTIFICATION).with_payload(serde_json::json!({
            "subject": subject,
            "details": payload,
        })));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::email::EmailConfig;

    #[tokio::test]
    async fn bus_notifier_publishes_subject_and_details() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let notifier = BusNotifier::new(Arc::clone(&bus));

        assert!(notifier.send("Item 3 needs attention", &serde_json::json!({"item_id": 3})).await);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, NOTIFICATION);
        assert_eq!(event.payload["subject"], "Item 3 needs attention");
        assert_eq!(event.payload["details"]["item_id"], 3);
    }

    #[tokio::test]
    async fn email_notifier_without_recipients_reports_failure() {
        let delivery = EmailDelivery::new(EmailConfig {
            smtp_host: "localhost".into(),
            smtp_port: 2525,
            from_address: "stowage@localhost".into(),
            smtp_user: None,
            smtp_password: None,
        });
        let notifier = EmailNotifier::new(delivery, Vec::new());
        assert!(!notifier.send("subject", &serde_json::json!({})).await);
    }
}
