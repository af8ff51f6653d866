//! Domain model for the stowage offload pipeline.
//!
//! Everything in this crate is free of I/O except the in-memory item store:
//! item records and the stage machine, disk-space admission arithmetic, the
//! failure taxonomy with its recovery policy table, and the collaborator
//! traits (`ItemStore`, `Notifier`) that the pipeline is wired against.

pub mod error;
pub mod item;
pub mod notify;
pub mod recovery;
pub mod space;
pub mod store;
pub mod types;
