//! Per-item stage machine.
//!
//! [`ItemPipeline::process`] drives one eligible item from `Classify` to
//! `UploadQueue`, persisting every stage and its results through the
//! [`ItemStore`]. Disk use is claimed up front through the [`SpaceLedger`]
//! and held in a [`ReservationGuard`] that travels with the item until the
//! upload finishes. A failing stage never advances the item: the error is
//! returned as a [`StageFailure`] for the recovery engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use stowage_core::item::{Digests, HashAlgorithm, ItemRecord, ItemStage, PipelinePlan};
use stowage_core::space::stage_footprint;
use stowage_core::store::{ItemPatch, ItemStore};
use stowage_core::types::DbId;

use crate::archive::{ArchiveError, Archiver};
use crate::artifacts::{self, content_stats};
use crate::error::{StageError, StageFailure};
use crate::hashing::ContentHasher;
use crate::ledger::{ReservationGuard, SpaceLedger};
use crate::retry::LocalRetry;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Volume on which reservations are tracked.
    pub work_dir: PathBuf,
    /// Archives land in `archive_dir/YYYYMMDD/<item_id>/`.
    pub archive_dir: PathBuf,
    /// Verification extracts into `scratch_dir/<item_id>/`.
    pub scratch_dir: PathBuf,
    pub algorithms: Vec<HashAlgorithm>,
    pub password: Option<String>,
    pub local_retry: LocalRetry,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let work_dir = PathBuf::from("./data");
        Self {
            archive_dir: work_dir.join("archives"),
            scratch_dir: work_dir.join("scratch"),
            work_dir,
            algorithms: HashAlgorithm::ALL.to_vec(),
            password: None,
            local_retry: LocalRetry::default(),
        }
    }
}

/// What the pipeline hands to the upload service.
#[derive(Debug)]
pub struct PipelineOutput {
    pub item_id: DbId,
    pub archive_path: PathBuf,
    pub archive_size: u64,
    /// Space still held for the archive; `None` when the archive is the
    /// source itself.
    pub reservation: Option<ReservationGuard>,
}

pub struct ItemPipeline {
    config: PipelineConfig,
    store: Arc<dyn ItemStore>,
    ledger: Arc<SpaceLedger>,
    hasher: Arc<dyn ContentHasher>,
    archiver: Arc<dyn Archiver>,
}

/// Run blocking collaborator work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, StageError>
where
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StageError::Join(e.to_string()))?
}

impl ItemPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ItemStore>,
        ledger: Arc<SpaceLedger>,
        hasher: Arc<dyn ContentHasher>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            hasher,
            archiver,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Directory that receives the archive of `item_id` today.
    pub fn archive_dir_for(&self, item_id: DbId) -> PathBuf {
        self.config
            .archive_dir
            .join(Utc::now().format("%Y%m%d").to_string())
            .join(item_id.to_string())
    }

    pub fn scratch_dir_for(&self, item_id: DbId) -> PathBuf {
        self.config.scratch_dir.join(item_id.to_string())
    }

    /// Run every stage of the item's plan up to `UploadQueue`.
    pub async fn process(&self, item: &ItemRecord) -> Result<PipelineOutput, StageFailure> {
        let plan = item
            .plan()
            .ok_or_else(|| StageFailure::new(item.id, item.stage, &StageError::NotEligible(item.id)))?;

        let started = Instant::now();
        tracing::info!(
            item_id = item.id,
            path = %item.source_path.display(),
            bytes = item.size_bytes,
            plan = ?plan,
            "Processing item"
        );

        let output = match plan {
            PipelinePlan::Compressible => self.run_compressible(item).await,
            PipelinePlan::PrecompressedArchive => self.run_precompressed(item).await,
        };

        match &output {
            Ok(out) => tracing::info!(
                item_id = item.id,
                archive = %out.archive_path.display(),
                archive_bytes = out.archive_size,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Item ready for upload"
            ),
            Err(failure) => tracing::warn!(
                item_id = item.id,
                stage = %failure.stage,
                error = %failure.message,
                "Item pipeline failed"
            ),
        }
        output
    }

    async fn run_compressible(&self, item: &ItemRecord) -> Result<PipelineOutput, StageFailure> {
        let id = item.id;
        let size = item.size_bytes;
        let at = |stage: ItemStage| move |e: StageError| StageFailure::new(id, stage, &e);

        // -- hash ---
        self.enter(id, ItemStage::Hash).await.map_err(at(ItemStage::Hash))?;
        if !self.ledger.admit(size, &self.config.work_dir) {
            return Err(at(ItemStage::Hash)(StageError::SpaceDenied {
                stage: ItemStage::Hash,
                required: size,
            }));
        }
        let source_digests = self
            .stage_hash(id, &item.source_path)
            .await
            .map_err(at(ItemStage::Hash))?;
        self.persist(ItemPatch::new(id).source_digests(source_digests.clone()))
            .await
            .map_err(at(ItemStage::Hash))?;

        // -- zip ---
        self.enter(id, ItemStage::Zip).await.map_err(at(ItemStage::Zip))?;
        let footprint = stage_footprint(ItemStage::Zip, size, None);
        let mut guard = ReservationGuard::acquire(&self.ledger, &self.config.work_dir, footprint)
            .ok_or(StageError::SpaceDenied {
                stage: ItemStage::Zip,
                required: footprint,
            })
            .map_err(at(ItemStage::Zip))?;
        let (archive_path, archive_size) = self
            .stage_zip(id, &item.source_path)
            .await
            .map_err(at(ItemStage::Zip))?;
        self.persist(ItemPatch::new(id).archive(archive_path.clone(), archive_size))
            .await
            .map_err(at(ItemStage::Zip))?;
        guard.shrink_to(stage_footprint(ItemStage::Zip, size, Some(archive_size)));

        // -- zip_hash ---
        self.enter(id, ItemStage::ZipHash).await.map_err(at(ItemStage::ZipHash))?;
        let archive_digests = self
            .stage_hash(id, &archive_path)
            .await
            .map_err(at(ItemStage::ZipHash))?;
        self.persist(ItemPatch::new(id).archive_digests(archive_digests))
            .await
            .map_err(at(ItemStage::ZipHash))?;

        // -- unzip + unzip_hash ---
        let scratch = self.scratch_dir_for(id);
        let verified = self
            .verify(item, &archive_path, archive_size, &scratch, &source_digests, &mut guard)
            .await;
        artifacts::discard(&scratch, "extraction").await;
        verified?;

        // -- upload_queue ---
        self.enter(id, ItemStage::UploadQueue)
            .await
            .map_err(at(ItemStage::UploadQueue))?;
        guard.shrink_to(stage_footprint(ItemStage::UploadQueue, size, Some(archive_size)));

        Ok(PipelineOutput {
            item_id: id,
            archive_path,
            archive_size,
            reservation: Some(guard),
        })
    }

    /// Decompress into scratch and prove the content matches the source.
    async fn verify(
        &self,
        item: &ItemRecord,
        archive_path: &Path,
        archive_size: u64,
        scratch: &Path,
        source_digests: &Digests,
        guard: &mut ReservationGuard,
    ) -> Result<(), StageFailure> {
        let id = item.id;
        let size = item.size_bytes;
        let at = |stage: ItemStage| move |e: StageError| StageFailure::new(id, stage, &e);

        self.enter(id, ItemStage::Unzip).await.map_err(at(ItemStage::Unzip))?;
        if !guard.grow(size) {
            return Err(at(ItemStage::Unzip)(StageError::SpaceDenied {
                stage: ItemStage::Unzip,
                required: size,
            }));
        }
        artifacts::discard(scratch, "stale extraction").await;
        let root = self
            .stage_unzip(id, archive_path, scratch)
            .await
            .map_err(at(ItemStage::Unzip))?;
        let actual = self.measure(root.clone()).await.map_err(at(ItemStage::Unzip))?;
        if actual != size {
            return Err(at(ItemStage::Unzip)(StageError::SizeMismatch {
                expected: size,
                actual,
            }));
        }
        self.persist(ItemPatch::new(id).unpacked(root.clone(), actual))
            .await
            .map_err(at(ItemStage::Unzip))?;
        guard.shrink_to(stage_footprint(ItemStage::Zip, size, Some(archive_size)));

        self.enter(id, ItemStage::UnzipHash)
            .await
            .map_err(at(ItemStage::UnzipHash))?;
        let unpacked_digests = self
            .stage_hash(id, &root)
            .await
            .map_err(at(ItemStage::UnzipHash))?;
        if !source_digests.matches(&unpacked_digests) {
            tracing::error!(item_id = id, "Decompressed content differs from source");
            return Err(at(ItemStage::UnzipHash)(StageError::DigestMismatch));
        }
        self.persist(
            ItemPatch::new(id)
                .unpacked_digests(unpacked_digests)
                .verified(true),
        )
        .await
        .map_err(at(ItemStage::UnzipHash))?;
        Ok(())
    }

    /// The item is already an archive: hash it once and queue it as is.
    async fn run_precompressed(&self, item: &ItemRecord) -> Result<PipelineOutput, StageFailure> {
        let id = item.id;
        let at = |stage: ItemStage| move |e: StageError| StageFailure::new(id, stage, &e);

        self.enter(id, ItemStage::ZipHash).await.map_err(at(ItemStage::ZipHash))?;
        let digests = self
            .stage_hash(id, &item.source_path)
            .await
            .map_err(at(ItemStage::ZipHash))?;
        self.persist(
            ItemPatch::new(id)
                .source_digests(digests.clone())
                .archive_digests(digests)
                .archive(item.source_path.clone(), item.size_bytes),
        )
        .await
        .map_err(at(ItemStage::ZipHash))?;

        self.enter(id, ItemStage::UploadQueue)
            .await
            .map_err(at(ItemStage::UploadQueue))?;
        Ok(PipelineOutput {
            item_id: id,
            archive_path: item.source_path.clone(),
            archive_size: item.size_bytes,
            reservation: None,
        })
    }

    // -- stage work ---

    async fn stage_hash(&self, id: DbId, path: &Path) -> Result<Digests, StageError> {
        self.config
            .local_retry
            .run("hash", id, || {
                let hasher = Arc::clone(&self.hasher);
                let algorithms = self.config.algorithms.clone();
                let path = path.to_path_buf();
                blocking(move || Ok(hasher.calculate(&path, &algorithms)?))
            })
            .await
    }

    async fn stage_zip(&self, id: DbId, source: &Path) -> Result<(PathBuf, u64), StageError> {
        let target_dir = self.archive_dir_for(id);
        self.config
            .local_retry
            .run("zip", id, || {
                let archiver = Arc::clone(&self.archiver);
                let password = self.config.password.clone();
                let source = source.to_path_buf();
                let target_dir = target_dir.clone();
                blocking(move || {
                    let path = archiver.encode(&source, &target_dir, password.as_deref())?;
                    let size = std::fs::metadata(&path)
                        .map_err(|source| ArchiveError::Io {
                            path: path.clone(),
                            source,
                        })?
                        .len();
                    Ok((path, size))
                })
            })
            .await
    }

    async fn stage_unzip(&self, id: DbId, archive: &Path, scratch: &Path) -> Result<PathBuf, StageError> {
        self.config
            .local_retry
            .run("unzip", id, || {
                let archiver = Arc::clone(&self.archiver);
                let password = self.config.password.clone();
                let archive = archive.to_path_buf();
                let scratch = scratch.to_path_buf();
                blocking(move || Ok(archiver.decode(&archive, &scratch, password.as_deref())?))
            })
            .await
    }

    async fn measure(&self, root: PathBuf) -> Result<u64, StageError> {
        blocking(move || {
            content_stats(&root)
                .map(|stats| stats.bytes)
                .map_err(|source| StageError::Archive(ArchiveError::Io { path: root, source }))
        })
        .await
    }

    // -- persistence ---

    async fn enter(&self, id: DbId, stage: ItemStage) -> Result<(), StageError> {
        tracing::debug!(item_id = id, stage = %stage, "Entering stage");
        self.persist(ItemPatch::new(id).stage(stage)).await
    }

    async fn persist(&self, patch: ItemPatch) -> Result<(), StageError> {
        self.config
            .local_retry
            .run("persist", patch.id, || async {
                match self.store.update(patch.clone()).await? {
                    0 => Err(StageError::Store(stowage_core::store::StoreError::NotFound(patch.id))),
                    _ => Ok(()),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::SealedTarArchiver;
    use crate::hashing::Sha2Hasher;
    use crate::ledger::{DiskProbe, SpaceConfig};
    use stowage_core::space::DiskSpaceInfo;
    use stowage_core::store::MemoryItemStore;

    struct EmptyDisk;

    impl DiskProbe for EmptyDisk {
        fn probe(&self, _path: &Path) -> std::io::Result<DiskSpaceInfo> {
            Ok(DiskSpaceInfo {
                total_bytes: 1 << 40,
                used_bytes: 0,
                free_bytes: 1 << 40,
            })
        }
    }

    fn pipeline(root: &Path) -> ItemPipeline {
        let config = PipelineConfig {
            work_dir: root.to_path_buf(),
            archive_dir: root.join("archives"),
            scratch_dir: root.join("scratch"),
            ..PipelineConfig::default()
        };
        ItemPipeline::new(
            config,
            Arc::new(MemoryItemStore::new()),
            Arc::new(SpaceLedger::new(SpaceConfig::default(), Arc::new(EmptyDisk))),
            Arc::new(Sha2Hasher),
            Arc::new(SealedTarArchiver::default()),
        )
    }

    #[test]
    fn archive_dir_is_dated_and_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let path = p.archive_dir_for(17);
        assert!(path.starts_with(dir.path().join("archives")));
        assert!(path.ends_with("17"));
        let day = path.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(day.len(), 8);
        assert!(day.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn ineligible_item_is_rejected_without_progress() {
        use stowage_core::item::{ClassifyTag, ItemType, NewItem};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryItemStore::new());
        let item = store
            .create(NewItem {
                source_path: dir.path().join("huge.bin"),
                item_type: ItemType::File,
                size_bytes: 1,
                tag: ClassifyTag::OversizeFile,
            })
            .await
            .unwrap();
        let failure = pipeline(dir.path()).process(&item).await.unwrap_err();
        assert_eq!(failure.stage, ItemStage::Classify);
        assert_eq!(failure.item_id, item.id);
    }
}
