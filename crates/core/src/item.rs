//! Item records and the per-item stage machine.
//!
//! An item is a file or folder tracked through the offload pipeline. Its
//! [`ItemStage`] only ever moves forward while the pipeline drives it; the
//! recovery engine is the sole writer allowed to reset it to an earlier
//! stage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::recovery::ErrorType;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// ItemType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "file" => Ok(ItemType::File),
            "folder" => Ok(ItemType::Folder),
            other => Err(unknown("item type", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// ClassifyTag
// ---------------------------------------------------------------------------

/// Classification assigned when an item is first discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyTag {
    NormalFile,
    NormalFolder,
    /// A file that already is an archive (`.zip`, `.tar.gz`, ...).
    ArchiveFile,
    OversizeFile,
    OversizeFolder,
    EmptyFolder,
    OvercountFolder,
}

impl ClassifyTag {
    /// Tags that are allowed to enter the pipeline.
    pub const ELIGIBLE: [ClassifyTag; 3] = [
        ClassifyTag::NormalFile,
        ClassifyTag::NormalFolder,
        ClassifyTag::ArchiveFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifyTag::NormalFile => "normal_file",
            ClassifyTag::NormalFolder => "normal_folder",
            ClassifyTag::ArchiveFile => "archive_file",
            ClassifyTag::OversizeFile => "oversize_file",
            ClassifyTag::OversizeFolder => "oversize_folder",
            ClassifyTag::EmptyFolder => "empty_folder",
            ClassifyTag::OvercountFolder => "overcount_folder",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "normal_file" => Ok(ClassifyTag::NormalFile),
            "normal_folder" => Ok(ClassifyTag::NormalFolder),
            "archive_file" => Ok(ClassifyTag::ArchiveFile),
            "oversize_file" => Ok(ClassifyTag::OversizeFile),
            "oversize_folder" => Ok(ClassifyTag::OversizeFolder),
            "empty_folder" => Ok(ClassifyTag::EmptyFolder),
            "overcount_folder" => Ok(ClassifyTag::OvercountFolder),
            other => Err(unknown("classify tag", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemStage
// ---------------------------------------------------------------------------

/// Pipeline stage, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Classify,
    Hash,
    Zip,
    ZipHash,
    Unzip,
    UnzipHash,
    UploadQueue,
    Uploaded,
    Deleted,
}

impl ItemStage {
    pub const ALL: [ItemStage; 9] = [
        ItemStage::Classify,
        ItemStage::Hash,
        ItemStage::Zip,
        ItemStage::ZipHash,
        ItemStage::Unzip,
        ItemStage::UnzipHash,
        ItemStage::UploadQueue,
        ItemStage::Uploaded,
        ItemStage::Deleted,
    ];

    /// Stages where work has started but the item has not left the machine.
    /// Items parked here without progress are candidates for zombie reaping.
    pub const IN_PROGRESS: [ItemStage; 6] = [
        ItemStage::Hash,
        ItemStage::Zip,
        ItemStage::ZipHash,
        ItemStage::Unzip,
        ItemStage::UnzipHash,
        ItemStage::UploadQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStage::Classify => "classify",
            ItemStage::Hash => "hash",
            ItemStage::Zip => "zip",
            ItemStage::ZipHash => "zip_hash",
            ItemStage::Unzip => "unzip",
            ItemStage::UnzipHash => "unzip_hash",
            ItemStage::UploadQueue => "upload_queue",
            ItemStage::Uploaded => "uploaded",
            ItemStage::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| unknown("stage", s))
    }

    /// Whether the pipeline may move an item from `self` to `next`.
    pub fn can_advance_to(&self, next: ItemStage) -> bool {
        next > *self
    }

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    /// Whether the stage leaves an archive behind on local disk.
    pub fn has_archive(&self) -> bool {
        *self >= ItemStage::Zip && *self <= ItemStage::Uploaded
    }
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Processing outcome, orthogonal to the stage an item reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Waiting for (more) processing.
    Pending,
    /// Failed and owned by the recovery engine.
    Error,
    Success,
    Skipped,
    ManualIntervention,
    PermanentFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Error => "error",
            Outcome::Success => "success",
            Outcome::Skipped => "skipped",
            Outcome::ManualIntervention => "manual_intervention",
            Outcome::PermanentFailure => "permanent_failure",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Outcome::Pending),
            "error" => Ok(Outcome::Error),
            "success" => Ok(Outcome::Success),
            "skipped" => Ok(Outcome::Skipped),
            "manual_intervention" => Ok(Outcome::ManualIntervention),
            "permanent_failure" => Ok(Outcome::PermanentFailure),
            other => Err(unknown("outcome", other)),
        }
    }

    /// No further processing will happen without an operator.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Outcome::Success
                | Outcome::Skipped
                | Outcome::ManualIntervention
                | Outcome::PermanentFailure
        )
    }
}

// ---------------------------------------------------------------------------
// PipelinePlan
// ---------------------------------------------------------------------------

/// How an eligible item moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePlan {
    /// Hash, compress, verify by decompressing, then upload the archive.
    Compressible,
    /// Already an archive: its own hash doubles as the compressed hash and
    /// the file itself is uploaded.
    PrecompressedArchive,
}

impl PipelinePlan {
    /// Returns `None` for tags that never enter the pipeline.
    pub fn for_tag(tag: ClassifyTag) -> Option<Self> {
        match tag {
            ClassifyTag::NormalFile | ClassifyTag::NormalFolder => {
                Some(PipelinePlan::Compressible)
            }
            ClassifyTag::ArchiveFile => Some(PipelinePlan::PrecompressedArchive),
            _ => None,
        }
    }

    /// Stages the plan visits after `Classify`, in order.
    pub fn stages(&self) -> &'static [ItemStage] {
        match self {
            PipelinePlan::Compressible => &[
                ItemStage::Hash,
                ItemStage::Zip,
                ItemStage::ZipHash,
                ItemStage::Unzip,
                ItemStage::UnzipHash,
                ItemStage::UploadQueue,
            ],
            PipelinePlan::PrecompressedArchive => &[ItemStage::ZipHash, ItemStage::UploadQueue],
        }
    }
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(unknown("hash algorithm", other)),
        }
    }
}

/// Uppercase hex digests keyed by algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digests(BTreeMap<HashAlgorithm, String>);

impl Digests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, algorithm: HashAlgorithm, hex: impl Into<String>) {
        self.0.insert(algorithm, hex.into());
    }

    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.0.get(&algorithm).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, &str)> {
        self.0.iter().map(|(alg, hex)| (*alg, hex.as_str()))
    }

    /// True when both sides carry at least one common algorithm and every
    /// common algorithm agrees (case-insensitively).
    pub fn matches(&self, other: &Digests) -> bool {
        let mut compared = 0;
        for (alg, hex) in &self.0 {
            if let Some(theirs) = other.0.get(alg) {
                if !hex.eq_ignore_ascii_case(theirs) {
                    return false;
                }
                compared += 1;
            }
        }
        compared > 0
    }
}

impl FromIterator<(HashAlgorithm, String)> for Digests {
    fn from_iter<I: IntoIterator<Item = (HashAlgorithm, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// FailureReason
// ---------------------------------------------------------------------------

/// Structured reason persisted alongside a failed, skipped or reaped item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// `None` for failures outside the taxonomy, e.g. a reaped zombie.
    pub error_type: Option<ErrorType>,
    pub message: String,
    pub stage: ItemStage,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<Timestamp>,
    pub recorded_at: Timestamp,
}

// ---------------------------------------------------------------------------
// ItemRecord
// ---------------------------------------------------------------------------

/// One tracked file or folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: DbId,
    pub source_path: PathBuf,
    pub item_type: ItemType,
    pub size_bytes: u64,
    pub tag: ClassifyTag,
    pub stage: ItemStage,
    pub outcome: Outcome,
    pub source_digests: Option<Digests>,
    pub archive_path: Option<PathBuf>,
    pub archive_size: Option<u64>,
    pub archive_digests: Option<Digests>,
    pub unpacked_path: Option<PathBuf>,
    pub unpacked_size: Option<u64>,
    pub unpacked_digests: Option<Digests>,
    /// Set once decompressed content has been proven identical to the source.
    pub verified: bool,
    pub failure: Option<FailureReason>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ItemRecord {
    pub fn plan(&self) -> Option<PipelinePlan> {
        PipelinePlan::for_tag(self.tag)
    }

    /// File name used when naming artifacts derived from this item.
    pub fn display_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("item-{}", self.id))
    }
}

/// Input for registering a newly classified item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub source_path: PathBuf,
    pub item_type: ItemType,
    pub size_bytes: u64,
    pub tag: ClassifyTag,
}

fn unknown(kind: &'static str, value: &str) -> CoreError {
    CoreError::UnknownVariant {
        kind,
        value: value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // -- ItemStage ----------------------------------------------------------

    #[test]
    fn stages_only_advance_forward() {
        assert!(ItemStage::Hash.can_advance_to(ItemStage::Zip));
        assert!(ItemStage::ZipHash.can_advance_to(ItemStage::UploadQueue));
        assert!(!ItemStage::Unzip.can_advance_to(ItemStage::Zip));
        assert!(!ItemStage::Unzip.can_advance_to(ItemStage::Unzip));
    }

    #[test]
    fn stage_string_round_trip() {
        for stage in ItemStage::ALL {
            assert_eq!(ItemStage::parse(stage.as_str()).unwrap(), stage);
        }
        assert_matches!(
            ItemStage::parse("verify"),
            Err(CoreError::UnknownVariant { kind: "stage", .. })
        );
    }

    #[test]
    fn in_progress_excludes_entry_and_exit_stages() {
        assert!(!ItemStage::Classify.is_in_progress());
        assert!(ItemStage::UnzipHash.is_in_progress());
        assert!(!ItemStage::Uploaded.is_in_progress());
        assert!(!ItemStage::Deleted.is_in_progress());
    }

    // -- PipelinePlan -------------------------------------------------------

    #[test]
    fn plan_follows_classification() {
        assert_eq!(
            PipelinePlan::for_tag(ClassifyTag::NormalFolder),
            Some(PipelinePlan::Compressible)
        );
        assert_eq!(
            PipelinePlan::for_tag(ClassifyTag::ArchiveFile),
            Some(PipelinePlan::PrecompressedArchive)
        );
        assert_eq!(PipelinePlan::for_tag(ClassifyTag::OversizeFile), None);
        assert_eq!(PipelinePlan::for_tag(ClassifyTag::EmptyFolder), None);
    }

    #[test]
    fn precompressed_plan_skips_compression_stages() {
        let stages = PipelinePlan::PrecompressedArchive.stages();
        for skipped in [
            ItemStage::Hash,
            ItemStage::Zip,
            ItemStage::Unzip,
            ItemStage::UnzipHash,
        ] {
            assert!(!stages.contains(&skipped));
        }
        assert!(PipelinePlan::Compressible
            .stages()
            .windows(2)
            .all(|w| w[0].can_advance_to(w[1])));
    }

    // -- Digests ------------------------------------------------------------

    #[test]
    fn digests_match_on_common_algorithms() {
        let mut a = Digests::new();
        a.insert(HashAlgorithm::Sha256, "ABCD");
        a.insert(HashAlgorithm::Sha512, "EF01");
        let mut b = Digests::new();
        b.insert(HashAlgorithm::Sha256, "abcd");
        assert!(a.matches(&b));

        b.insert(HashAlgorithm::Sha512, "0000");
        assert!(!a.matches(&b));
    }

    #[test]
    fn disjoint_digests_never_match() {
        let mut a = Digests::new();
        a.insert(HashAlgorithm::Sha256, "AA");
        let mut b = Digests::new();
        b.insert(HashAlgorithm::Sha384, "AA");
        assert!(!a.matches(&b));
        assert!(!Digests::new().matches(&Digests::new()));
    }

    #[test]
    fn digests_serialize_as_plain_map() {
        let mut d = Digests::new();
        d.insert(HashAlgorithm::Sha256, "FF");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json, serde_json::json!({"sha256": "FF"}));
    }
}
