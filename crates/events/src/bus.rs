//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans [`BackupEvent`]s out to any number of subscribers. It is
//! shared via `Arc<EventBus>` between the coordinator, the notifiers and
//! whatever the binary chooses to attach (log sinks, metrics).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_core::types::DbId;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const ITEM_QUEUED: &str = "item.queued";
pub const ITEM_UPLOADED: &str = "item.uploaded";
pub const ITEM_FAILED: &str = "item.failed";
pub const RUN_COMPLETED: &str = "run.completed";
pub const NOTIFICATION: &str = "notification";

// ---------------------------------------------------------------------------
// BackupEvent
// ---------------------------------------------------------------------------

/// A lifecycle event.
///
/// Constructed via [`BackupEvent::new`] and enriched with
/// [`for_item`](BackupEvent::for_item) and
/// [`with_payload`](BackupEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEvent {
    /// Dot-separated event name, e.g. `"item.uploaded"`.
    pub event_type: String,

    /// Item the event concerns, if any.
    pub item_id: Option<DbId>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl BackupEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            item_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn for_item(mut self, item_id: DbId) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// ```rust
/// use stowage_events::bus::{BackupEvent, EventBus};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(BackupEvent::new("item.queued").for_item(1));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    /// When the buffer is full the oldest messages are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers; dropped silently if there are none.
    pub fn publish(&self, event: BackupEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
