//! Space-bounded, verified offload pipeline.
//!
//! - [`ledger`]: disk-space admission control and reservations.
//! - [`hashing`], [`archive`], [`transport`]: blocking and async
//!   collaborators with their reference implementations.
//! - [`pipeline`]: the per-item stage machine.
//! - [`upload`]: upload queue and worker pool.
//! - [`recovery`]: failure records, delayed recovery, zombie reaping.
//! - [`classify`]: discovery of new items under source roots.
//! - [`coordinator`]: wires everything into runs.

pub mod archive;
pub mod artifacts;
pub mod classify;
pub mod coordinator;
pub mod error;
pub mod hashing;
pub mod ledger;
pub mod pipeline;
pub mod recovery;
pub mod retry;
pub mod transport;
pub mod upload;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorServices, RunStats};
pub use error::{StageError, StageFailure};
pub use ledger::{ReservationGuard, SpaceConfig, SpaceLedger};
pub use pipeline::{ItemPipeline, PipelineConfig, PipelineOutput};
pub use recovery::{RecoveryConfig, RecoveryEngine};
pub use upload::{UploadConfig, UploadService};
