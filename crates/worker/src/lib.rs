//! Wiring for the `stowage-worker` binary.

pub mod config;

pub use config::{ConfigError, WorkerConfig};
