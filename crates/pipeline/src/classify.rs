//! Discovery of new items under the configured source roots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use stowage_core::item::{ClassifyTag, ItemType, NewItem};
use stowage_core::space::GIB;
use stowage_core::store::{ItemStore, StoreError};

use crate::artifacts::{content_stats, ContentStats};

/// File name suffixes treated as already-compressed archives.
pub const ARCHIVE_SUFFIXES: [&str; 10] = [
    ".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".tar", ".zip", ".rar", ".7z", ".gz", ".bz2",
];

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Classification task failed: {0}")]
    Join(String),
}

#[async_trait]
pub trait SourceClassifier: Send + Sync {
    /// Register every unseen source item. Returns how many were created.
    async fn classify_sources(&self) -> Result<usize, ClassifyError>;
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub source_roots: Vec<PathBuf>,
    /// Files or folders larger than this are tagged oversize.
    pub oversize_bytes: u64,
    /// Folders with more files than this are tagged overcount.
    pub overcount_files: u64,
    /// Paths never registered, e.g. the work directory when it sits inside
    /// a source root.
    pub excluded: Vec<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            source_roots: Vec::new(),
            oversize_bytes: 19 * GIB,
            overcount_files: 100,
            excluded: Vec::new(),
        }
    }
}

pub fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Tag for a discovered entry.
pub fn tag_for(item_type: ItemType, name: &str, stats: ContentStats, config: &ClassifierConfig) -> ClassifyTag {
    match item_type {
        ItemType::File if stats.bytes > config.oversize_bytes => ClassifyTag::OversizeFile,
        ItemType::File if is_archive_name(name) => ClassifyTag::ArchiveFile,
        ItemType::File => ClassifyTag::NormalFile,
        ItemType::Folder if stats.files == 0 => ClassifyTag::EmptyFolder,
        ItemType::Folder if stats.bytes > config.oversize_bytes => ClassifyTag::OversizeFolder,
        ItemType::Folder if stats.files > config.overcount_files => ClassifyTag::OvercountFolder,
        ItemType::Folder => ClassifyTag::NormalFolder,
    }
}

// ---------------------------------------------------------------------------
// FsSourceClassifier
// ---------------------------------------------------------------------------

/// Registers each top-level entry of every source root as one item.
pub struct FsSourceClassifier {
    config: ClassifierConfig,
    store: Arc<dyn ItemStore>,
}

impl FsSourceClassifier {
    pub fn new(config: ClassifierConfig, store: Arc<dyn ItemStore>) -> Self {
        Self { config, store }
    }

    async fn entries(&self, root: &Path) -> Vec<PathBuf> {
        let mut dir = match tokio::fs::read_dir(root).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Cannot read source root");
                return Vec::new();
            }
        };
        let mut paths = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_link = entry.file_type().await.map(|t| t.is_symlink()).unwrap_or(true);
                    if is_link || self.config.excluded.iter().any(|ex| path.starts_with(ex)) {
                        continue;
                    }
                    paths.push(path);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %e, "Source root listing interrupted");
                    break;
                }
            }
        }
        paths.sort();
        paths
    }

    async fn register(&self, path: PathBuf) -> Result<bool, ClassifyError> {
        if self.store.exists_by_path(&path).await? {
            return Ok(false);
        }
        let probe = path.clone();
        let measured = tokio::task::spawn_blocking(move || {
            let is_dir = std::fs::metadata(&probe)?.is_dir();
            content_stats(&probe).map(|stats| (is_dir, stats))
        })
        .await
        .map_err(|e| ClassifyError::Join(e.to_string()))?;
        let (is_dir, stats) = match measured {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable source entry");
                return Ok(false);
            }
        };

        let item_type = if is_dir { ItemType::Folder } else { ItemType::File };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tag = tag_for(item_type, &name, stats, &self.config);

        match self
            .store
            .create(NewItem {
                source_path: path.clone(),
                item_type,
                size_bytes: stats.bytes,
                tag,
            })
            .await
        {
            Ok(item) => {
                tracing::info!(
                    item_id = item.id,
                    path = %path.display(),
                    tag = tag.as_str(),
                    bytes = stats.bytes,
                    files = stats.files,
                    "Item classified"
                );
                Ok(true)
            }
            Err(StoreError::Duplicate(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SourceClassifier for FsSourceClassifier {
    async fn classify_sources(&self) -> Result<usize, ClassifyError> {
        let mut created = 0;
        for root in &self.config.source_roots {
            for path in self.entries(root).await {
                if self.register(path).await? {
                    created += 1;
                }
            }
        }
        if created > 0 {
            tracing::info!(created, "Source classification finished");
        }
        Ok(created)
    }
}
