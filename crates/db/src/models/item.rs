//! Row model for the `items` table.

use std::path::PathBuf;

use serde::Serialize;
use sqlx::FromRow;
use stowage_core::error::CoreError;
use stowage_core::item::{
    ClassifyTag, Digests, FailureReason, ItemRecord, ItemStage, ItemType, Outcome,
};
use stowage_core::types::{DbId, Timestamp};

/// A row from the `items` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ItemRow {
    pub id: DbId,
    pub source_path: String,
    pub item_type: String,
    pub size_bytes: i64,
    pub tag: String,
    pub stage: String,
    pub outcome: String,
    pub source_digests: Option<serde_json::Value>,
    pub archive_path: Option<String>,
    pub archive_size: Option<i64>,
    pub archive_digests: Option<serde_json::Value>,
    pub unpacked_path: Option<String>,
    pub unpacked_size: Option<i64>,
    pub unpacked_digests: Option<serde_json::Value>,
    pub verified: bool,
    pub failure: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<ItemRow> for ItemRecord {
    type Error = CoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(ItemRecord {
            id: row.id,
            source_path: PathBuf::from(row.source_path),
            item_type: ItemType::parse(&row.item_type)?,
            size_bytes: to_u64(row.size_bytes, "size_bytes")?,
            tag: ClassifyTag::parse(&row.tag)?,
            stage: ItemStage::parse(&row.stage)?,
            outcome: Outcome::parse(&row.outcome)?,
            source_digests: decode_json::<Digests>(row.source_digests, "source_digests")?,
            archive_path: row.archive_path.map(PathBuf::from),
            archive_size: row
                .archive_size
                .map(|v| to_u64(v, "archive_size"))
                .transpose()?,
            archive_digests: decode_json::<Digests>(row.archive_digests, "archive_digests")?,
            unpacked_path: row.unpacked_path.map(PathBuf::from),
            unpacked_size: row
                .unpacked_size
                .map(|v| to_u64(v, "unpacked_size"))
                .transpose()?,
            unpacked_digests: decode_json::<Digests>(row.unpacked_digests, "unpacked_digests")?,
            verified: row.verified,
            failure: decode_json::<FailureReason>(row.failure, "failure")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_u64(value: i64, column: &str) -> Result<u64, CoreError> {
    u64::try_from(value).map_err(|_| CoreError::Validation(format!("negative {column}: {value}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
    column: &str,
) -> Result<Option<T>, CoreError> {
    value
        .map(|v| {
            serde_json::from_value(v)
                .map_err(|e| CoreError::Validation(format!("malformed {column}: {e}")))
        })
        .transpose()
}

/// Byte counts are stored as BIGINT.
pub fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
