//! Outbound notification channel used for escalations.

use async_trait::async_trait;

/// Delivers operator-facing notifications.
///
/// Implementations report delivery as a plain `bool`: a failed notification
/// is logged by the implementation and must never abort the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, payload: &serde_json::Value) -> bool;
}
