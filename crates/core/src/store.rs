//! Persistent item ledger interface and an in-memory implementation.
//!
//! [`ItemStore`] is the only way pipeline components read or mutate item
//! records. The Postgres implementation lives in `stowage-db`;
//! [`MemoryItemStore`] backs tests and dry runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::item::{
    ClassifyTag, Digests, FailureReason, ItemRecord, ItemStage, NewItem, Outcome,
};
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Item {0} not found")]
    NotFound(DbId),

    #[error("Item already registered: {0}")]
    Duplicate(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Query / patch
// ---------------------------------------------------------------------------

/// Conjunctive filter; empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemQuery {
    pub stages: Vec<ItemStage>,
    pub tags: Vec<ClassifyTag>,
    pub outcomes: Vec<Outcome>,
    /// Only items whose `updated_at` is strictly older than this.
    pub updated_before: Option<Timestamp>,
    pub limit: Option<i64>,
}

impl ItemQuery {
    pub fn matches(&self, item: &ItemRecord) -> bool {
        (self.stages.is_empty() || self.stages.contains(&item.stage))
            && (self.tags.is_empty() || self.tags.contains(&item.tag))
            && (self.outcomes.is_empty() || self.outcomes.contains(&item.outcome))
            && self.updated_before.map_or(true, |cutoff| item.updated_at < cutoff)
    }
}

/// Partial update for one item. `None` leaves a field untouched; for
/// nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub id: DbId,
    pub stage: Option<ItemStage>,
    pub outcome: Option<Outcome>,
    pub source_digests: Option<Option<Digests>>,
    pub archive_path: Option<Option<PathBuf>>,
    pub archive_size: Option<Option<u64>>,
    pub archive_digests: Option<Option<Digests>>,
    pub unpacked_path: Option<Option<PathBuf>>,
    pub unpacked_size: Option<Option<u64>>,
    pub unpacked_digests: Option<Option<Digests>>,
    pub verified: Option<bool>,
    pub failure: Option<Option<FailureReason>>,
}

impl ItemPatch {
    pub fn new(id: DbId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn stage(mut self, stage: ItemStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn source_digests(mut self, digests: Digests) -> Self {
        self.source_digests = Some(Some(digests));
        self
    }

    pub fn archive(mut self, path: PathBuf, size: u64) -> Self {
        self.archive_path = Some(Some(path));
        self.archive_size = Some(Some(size));
        self
    }

    pub fn archive_digests(mut self, digests: Digests) -> Self {
        self.archive_digests = Some(Some(digests));
        self
    }

    pub fn unpacked(mut self, path: PathBuf, size: u64) -> Self {
        self.unpacked_path = Some(Some(path));
        self.unpacked_size = Some(Some(size));
        self
    }

    pub fn unpacked_digests(mut self, digests: Digests) -> Self {
        self.unpacked_digests = Some(Some(digests));
        self
    }

    pub fn verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn failure(mut self, reason: FailureReason) -> Self {
        self.failure = Some(Some(reason));
        self
    }

    pub fn clear_failure(mut self) -> Self {
        self.failure = Some(None);
        self
    }

    /// Forget every derived artifact (archive, extraction, their digests).
    pub fn clear_artifacts(mut self) -> Self {
        self.archive_path = Some(None);
        self.archive_size = Some(None);
        self.archive_digests = Some(None);
        self.unpacked_path = Some(None);
        self.unpacked_size = Some(None);
        self.unpacked_digests = Some(None);
        self.verified = Some(false);
        self
    }

    /// Apply this patch to a record in place.
    pub fn apply(&self, item: &mut ItemRecord) {
        if let Some(stage) = self.stage {
            item.stage = stage;
        }
        if let Some(outcome) = self.outcome {
            item.outcome = outcome;
        }
        if let Some(v) = &self.source_digests {
            item.source_digests = v.clone();
        }
        if let Some(v) = &self.archive_path {
            item.archive_path = v.clone();
        }
        if let Some(v) = self.archive_size {
            item.archive_size = v;
        }
        if let Some(v) = &self.archive_digests {
            item.archive_digests = v.clone();
        }
        if let Some(v) = &self.unpacked_path {
            item.unpacked_path = v.clone();
        }
        if let Some(v) = self.unpacked_size {
            item.unpacked_size = v;
        }
        if let Some(v) = &self.unpacked_digests {
            item.unpacked_digests = v.clone();
        }
        if let Some(v) = self.verified {
            item.verified = v;
        }
        if let Some(v) = &self.failure {
            item.failure = v.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// ItemStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn create(&self, item: NewItem) -> Result<ItemRecord, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<ItemRecord>, StoreError>;

    /// Items matching `query`, oldest first.
    async fn query(&self, query: &ItemQuery) -> Result<Vec<ItemRecord>, StoreError>;

    /// Whether a record already exists for `path`.
    async fn exists_by_path(&self, path: &std::path::Path) -> Result<bool, StoreError>;

    /// Apply each patch and bump `updated_at`. Returns the affected row count.
    async fn bulk_update(&self, patches: &[ItemPatch]) -> Result<u64, StoreError>;

    async fn update(&self, patch: ItemPatch) -> Result<u64, StoreError> {
        self.bulk_update(std::slice::from_ref(&patch)).await
    }
}

// ---------------------------------------------------------------------------
// MemoryItemStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<BTreeMap<DbId, ItemRecord>>,
    next_id: AtomicI64,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite `updated_at`, e.g. when importing records from elsewhere.
    pub fn set_updated_at(&self, id: DbId, at: Timestamp) -> Result<(), StoreError> {
        let mut items = self.write()?;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        item.updated_at = at;
        Ok(())
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Result<Vec<ItemRecord>, StoreError> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<DbId, ItemRecord>>, StoreError> {
        self.items
            .read()
            .map_err(|_| StoreError::Backend("item map lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<DbId, ItemRecord>>, StoreError> {
        self.items
            .write()
            .map_err(|_| StoreError::Backend("item map lock poisoned".into()))
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn create(&self, item: NewItem) -> Result<ItemRecord, StoreError> {
        let mut items = self.write()?;
        if items.values().any(|i| i.source_path == item.source_path) {
            return Err(StoreError::Duplicate(item.source_path.display().to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let record = ItemRecord {
            id,
            source_path: item.source_path,
            item_type: item.item_type,
            size_bytes: item.size_bytes,
            tag: item.tag,
            stage: ItemStage::Classify,
            outcome: Outcome::Pending,
            source_digests: None,
            archive_path: None,
            archive_size: None,
            archive_digests: None,
            unpacked_path: None,
            unpacked_size: None,
            unpacked_digests: None,
            verified: false,
            failure: None,
            created_at: now,
            updated_at: now,
        };
        items.insert(id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<ItemRecord>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<ItemRecord>, StoreError> {
        let items = self.read()?;
        let limit = query.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(items
            .values()
            .filter(|item| query.matches(item))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn exists_by_path(&self, path: &std::path::Path) -> Result<bool, StoreError> {
        Ok(self.read()?.values().any(|i| i.source_path == path))
    }

    async fn bulk_update(&self, patches: &[ItemPatch]) -> Result<u64, StoreError> {
        let mut items = self.write()?;
        let now = Utc::now();
        let mut affected = 0;
        for patch in patches {
            if let Some(item) = items.get_mut(&patch.id) {
                patch.apply(item);
                item.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemType;
    use assert_matches::assert_matches;

    fn new_item(path: &str, tag: ClassifyTag) -> NewItem {
        NewItem {
            source_path: PathBuf::from(path),
            item_type: ItemType::File,
            size_bytes: 10,
            tag,
        }
    }

    #[tokio::test]
    async fn create_starts_at_classify_pending() {
        let store = MemoryItemStore::new();
        let item = store.create(new_item("/a", ClassifyTag::NormalFile)).await.unwrap();
        assert_eq!(item.id, 1);
        assert_eq!(item.stage, ItemStage::Classify);
        assert_eq!(item.outcome, Outcome::Pending);
        assert_matches!(
            store.create(new_item("/a", ClassifyTag::NormalFile)).await,
            Err(StoreError::Duplicate(_))
        );
    }

    #[tokio::test]
    async fn query_filters_by_stage_tag_and_staleness() {
        let store = MemoryItemStore::new();
        let a = store.create(new_item("/a", ClassifyTag::NormalFile)).await.unwrap();
        let b = store.create(new_item("/b", ClassifyTag::OversizeFile)).await.unwrap();
        store.update(ItemPatch::new(a.id).stage(ItemStage::Zip)).await.unwrap();

        let eligible = ItemQuery {
            tags: ClassifyTag::ELIGIBLE.to_vec(),
            ..Default::default()
        };
        let found = store.query(&eligible).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        let stale = ItemQuery {
            updated_before: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(store.query(&stale).await.unwrap().is_empty());

        store
            .set_updated_at(b.id, Utc::now() - chrono::Duration::hours(2))
            .unwrap();
        let found = store.query(&stale).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id);
    }

    #[tokio::test]
    async fn bulk_update_counts_only_existing_rows() {
        let store = MemoryItemStore::new();
        let a = store.create(new_item("/a", ClassifyTag::NormalFile)).await.unwrap();
        let affected = store
            .bulk_update(&[
                ItemPatch::new(a.id).archive(PathBuf::from("/z/a.tgz"), 4),
                ItemPatch::new(99).stage(ItemStage::Hash),
            ])
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let item = store.find_by_id(a.id).await.unwrap().unwrap();
        assert_eq!(item.archive_size, Some(4));

        store
            .update(ItemPatch::new(a.id).clear_artifacts())
            .await
            .unwrap();
        let item = store.find_by_id(a.id).await.unwrap().unwrap();
        assert_eq!(item.archive_path, None);
        assert!(!item.verified);
    }
}
