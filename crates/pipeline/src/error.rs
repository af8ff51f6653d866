//! Stage errors and the failure report handed to the recovery engine.

use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::Serialize;
use stowage_core::item::ItemStage;
use stowage_core::recovery::ErrorType;
use stowage_core::store::StoreError;
use stowage_core::types::DbId;

use crate::archive::ArchiveError;
use crate::hashing::HashError;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Hashing failed: {0}")]
    Hash(#[from] HashError),

    #[error("Archive failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Insufficient disk space for {stage} stage: {required} bytes requested")]
    SpaceDenied { stage: ItemStage, required: u64 },

    #[error("Source not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Decompressed size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Decompressed hash mismatch against source")]
    DigestMismatch,

    #[error("Item {0} has no pipeline plan")]
    NotEligible(DbId),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

fn io_kind_type(kind: ErrorKind) -> Option<ErrorType> {
    match kind {
        ErrorKind::NotFound => Some(ErrorType::FileNotFound),
        ErrorKind::PermissionDenied => Some(ErrorType::PermissionDenied),
        _ => None,
    }
}

impl StageError {
    /// Error type known from the error's structure, if any. `None` defers
    /// to message classification.
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            StageError::Hash(HashError::NotFound(_)) => Some(ErrorType::FileNotFound),
            StageError::Hash(HashError::Io { source, .. }) => io_kind_type(source.kind()),
            StageError::Hash(HashError::NoAlgorithms) => Some(ErrorType::VerificationFailed),
            StageError::Archive(ArchiveError::SourceNotFound(_)) => Some(ErrorType::FileNotFound),
            StageError::Archive(ArchiveError::Io { source, .. }) => {
                io_kind_type(source.kind()).or(Some(ErrorType::CompressionFailed))
            }
            StageError::Archive(_) => Some(ErrorType::CompressionFailed),
            StageError::Store(_) => Some(ErrorType::StoreError),
            StageError::SpaceDenied { .. } => Some(ErrorType::SpaceInsufficient),
            StageError::SourceMissing(_) => Some(ErrorType::FileNotFound),
            StageError::SizeMismatch { .. } | StageError::DigestMismatch => {
                Some(ErrorType::VerificationFailed)
            }
            StageError::NotEligible(_) => Some(ErrorType::Unknown),
            StageError::Join(_) => None,
        }
    }

    /// Whether retrying the same stage shortly afterwards could help.
    pub fn is_transient(&self) -> bool {
        match self {
            StageError::Hash(HashError::Io { source, .. }) => io_kind_type(source.kind()).is_none(),
            StageError::Archive(ArchiveError::Io { source, .. }) => {
                io_kind_type(source.kind()).is_none()
            }
            StageError::Store(StoreError::Backend(_)) => true,
            StageError::Join(_) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// StageFailure
// ---------------------------------------------------------------------------

/// A stage failure reported to the recovery engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub item_id: DbId,
    pub stage: ItemStage,
    /// Structured type; `None` means classify `message`.
    pub error_type: Option<ErrorType>,
    pub message: String,
}

impl StageFailure {
    pub fn new(item_id: DbId, stage: ItemStage, error: &StageError) -> Self {
        Self {
            item_id,
            stage,
            error_type: error.error_type(),
            message: error.to_string(),
        }
    }

    /// A failure described only by its message.
    pub fn unclassified(item_id: DbId, stage: ItemStage, message: impl Into<String>) -> Self {
        Self {
            item_id,
            stage,
            error_type: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item {} failed at {}: {}", self.item_id, self.stage, self.message)
    }
}
