//! Stowage event bus and notification channels.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`BackupEvent`]: lifecycle event envelope for items and runs.
//! - [`delivery`]: SMTP delivery.
//! - [`notifier`]: [`Notifier`](stowage_core::notify::Notifier)
//!   implementations used for escalations.

pub mod bus;
pub mod delivery;
pub mod notifier;

pub use bus::{BackupEvent, EventBus};
pub use delivery::email::{EmailConfig, EmailDelivery};
pub use notifier::{BusNotifier, EmailNotifier};
