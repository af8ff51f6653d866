//! Repository for the `items` table.
//!
//! Filters and partial updates are assembled with [`QueryBuilder`] so a
//! single code path serves every combination of [`ItemQuery`] predicates and
//! [`ItemPatch`] fields.

use sqlx::{PgPool, Postgres, QueryBuilder};
use stowage_core::item::NewItem;
use stowage_core::store::{ItemPatch, ItemQuery};
use stowage_core::types::DbId;

use crate::models::item::{to_i64, ItemRow};

/// Column list for `items` queries.
const COLUMNS: &str = "\
    id, source_path, item_type, size_bytes, tag, stage, outcome, \
    source_digests, archive_path, archive_size, archive_digests, \
    unpacked_path, unpacked_size, unpacked_digests, verified, failure, \
    created_at, updated_at";

/// Upper bound on rows returned by one filtered query.
const MAX_LIMIT: i64 = 1000;

/// Provides persistence operations for item records.
pub struct ItemRepo;

impl ItemRepo {
    /// Insert a newly classified item. Returns `None` if the source path is
    /// already registered.
    pub async fn create(pool: &PgPool, input: &NewItem) -> Result<Option<ItemRow>, sqlx::Error> {
        let query = format!(
            "INSERT INTO items (source_path, item_type, size_bytes, tag) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (source_path) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(input.source_path.to_string_lossy().as_ref())
            .bind(input.item_type.as_str())
            .bind(to_i64(input.size_bytes))
            .bind(input.tag.as_str())
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<ItemRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM items WHERE id = $1");
        sqlx::query_as::<_, ItemRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn exists_by_path(pool: &PgPool, path: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM items WHERE source_path = $1)")
            .bind(path)
            .fetch_one(pool)
            .await
    }

    /// Items matching every predicate of `filter`, oldest first.
    pub async fn query(pool: &PgPool, filter: &ItemQuery) -> Result<Vec<ItemRow>, sqlx::Error> {
        build_select(filter)
            .build_query_as::<ItemRow>()
            .fetch_all(pool)
            .await
    }

    /// Apply every patch inside one transaction. Returns the number of rows
    /// touched.
    pub async fn bulk_update(pool: &PgPool, patches: &[ItemPatch]) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut affected = 0;
        for patch in patches {
            let mut builder = build_update(patch).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}

fn build_select(filter: &ItemQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM items WHERE TRUE"));
    if !filter.stages.is_empty() {
        let stages: Vec<String> = filter.stages.iter().map(|s| s.as_str().to_string()).collect();
        builder.push(" AND stage = ANY(").push_bind(stages).push(")");
    }
    if !filter.tags.is_empty() {
        let tags: Vec<String> = filter.tags.iter().map(|t| t.as_str().to_string()).collect();
        builder.push(" AND tag = ANY(").push_bind(tags).push(")");
    }
    if !filter.outcomes.is_empty() {
        let outcomes: Vec<String> = filter
            .outcomes
            .iter()
            .map(|o| o.as_str().to_string())
            .collect();
        builder.push(" AND outcome = ANY(").push_bind(outcomes).push(")");
    }
    if let Some(cutoff) = filter.updated_before {
        builder.push(" AND updated_at < ").push_bind(cutoff);
    }
    builder.push(" ORDER BY id ASC LIMIT ");
    builder.push_bind(filter.limit.unwrap_or(MAX_LIMIT).clamp(0, MAX_LIMIT));
    builder
}

fn build_update(patch: &ItemPatch) -> Result<QueryBuilder<'static, Postgres>, serde_json::Error> {
    let mut builder = QueryBuilder::new("UPDATE items SET updated_at = NOW()");
    if let Some(stage) = patch.stage {
        builder.push(", stage = ").push_bind(stage.as_str());
    }
    if let Some(outcome) = patch.outcome {
        builder.push(", outcome = ").push_bind(outcome.as_str());
    }
    if let Some(v) = &patch.source_digests {
        builder.push(", source_digests = ").push_bind(to_json(v)?);
    }
    if let Some(v) = &patch.archive_path {
        builder
            .push(", archive_path = ")
            .push_bind(v.as_ref().map(|p| p.to_string_lossy().into_owned()));
    }
    if let Some(v) = patch.archive_size {
        builder.push(", archive_size = ").push_bind(v.map(to_i64));
    }
    if let Some(v) = &patch.archive_digests {
        builder.push(", archive_digests = ").push_bind(to_json(v)?);
    }
    if let Some(v) = &patch.unpacked_path {
        builder
            .push(", unpacked_path = ")
            .push_bind(v.as_ref().map(|p| p.to_string_lossy().into_owned()));
    }
    if let Some(v) = patch.unpacked_size {
        builder.push(", unpacked_size = ").push_bind(v.map(to_i64));
    }
    if let Some(v) = &patch.unpacked_digests {
        builder.push(", unpacked_digests = ").push_bind(to_json(v)?);
    }
    if let Some(v) = patch.verified {
        builder.push(", verified = ").push_bind(v);
    }
    if let Some(v) = &patch.failure {
        builder.push(", failure = ").push_bind(to_json(v)?);
    }
    builder.push(" WHERE id = ").push_bind(patch.id);
    Ok(builder)
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, serde_json::Error> {
    value.as_ref().map(serde_json::to_value).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use stowage_core::item::{ClassifyTag, ItemStage, Outcome};

    #[test]
    fn update_only_sets_patched_columns() {
        let patch = ItemPatch::new(3)
            .stage(ItemStage::Zip)
            .archive(PathBuf::from("/z/a.tgz"), 10);
        let builder = build_update(&patch).unwrap();
        assert_eq!(
            builder.sql(),
            "UPDATE items SET updated_at = NOW(), stage = $1, archive_path = $2, \
             archive_size = $3 WHERE id = $4"
        );
    }

    #[test]
    fn clearing_artifacts_touches_every_artifact_column() {
        let builder = build_update(&ItemPatch::new(1).clear_artifacts()).unwrap();
        for column in [
            "archive_path",
            "archive_size",
            "archive_digests",
            "unpacked_path",
            "unpacked_size",
            "unpacked_digests",
            "verified",
        ] {
            assert!(builder.sql().contains(column), "{column}");
        }
    }

    #[test]
    fn select_adds_only_requested_predicates() {
        let filter = ItemQuery {
            stages: vec![ItemStage::Classify],
            tags: ClassifyTag::ELIGIBLE.to_vec(),
            outcomes: vec![Outcome::Pending],
            updated_before: None,
            limit: Some(5),
        };
        let builder = build_select(&filter);
        let sql = builder.sql();
        assert!(sql.contains("stage = ANY($1)"));
        assert!(sql.contains("tag = ANY($2)"));
        assert!(sql.contains("outcome = ANY($3)"));
        assert!(!sql.contains("updated_at <"));
        assert!(sql.ends_with("LIMIT $4"));
    }
}
