//! [`ItemStore`] backed by Postgres.

use std::path::Path;

use async_trait::async_trait;
use stowage_core::error::CoreError;
use stowage_core::item::{ItemRecord, NewItem};
use stowage_core::store::{ItemPatch, ItemQuery, ItemStore, StoreError};
use stowage_core::types::DbId;

use crate::models::item::ItemRow;
use crate::repositories::ItemRepo;
use crate::DbPool;

#[derive(Clone)]
pub struct PgItemStore {
    pool: DbPool,
}

impl PgItemStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    tracing::error!(error = %e, "Item store query failed");
    StoreError::Backend(e.to_string())
}

fn decode(row: ItemRow) -> Result<ItemRecord, StoreError> {
    let id = row.id;
    ItemRecord::try_from(row).map_err(|e: CoreError| {
        tracing::error!(item_id = id, error = %e, "Undecodable item row");
        StoreError::Backend(e.to_string())
    })
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn create(&self, item: NewItem) -> Result<ItemRecord, StoreError> {
        match ItemRepo::create(&self.pool, &item).await.map_err(backend)? {
            Some(row) => decode(row),
            None => Err(StoreError::Duplicate(item.source_path.display().to_string())),
        }
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<ItemRecord>, StoreError> {
        ItemRepo::find_by_id(&self.pool, id)
            .await
            .map_err(backend)?
            .map(decode)
            .transpose()
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<ItemRecord>, StoreError> {
        ItemRepo::query(&self.pool, query)
            .await
            .map_err(backend)?
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn exists_by_path(&self, path: &Path) -> Result<bool, StoreError> {
        ItemRepo::exists_by_path(&self.pool, &path.to_string_lossy())
            .await
            .map_err(backend)
    }

    async fn bulk_update(&self, patches: &[ItemPatch]) -> Result<u64, StoreError> {
        if patches.is_empty() {
            return Ok(0);
        }
        ItemRepo::bulk_update(&self.pool, patches)
            .await
            .map_err(backend)
    }
}
