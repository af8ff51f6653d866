//! Disk-space admission arithmetic.
//!
//! Pure functions over a [`DiskSpaceInfo`] snapshot and the bytes currently
//! held by reservations. The stateful ledger lives in the pipeline crate and
//! delegates every decision to [`SpaceLimits`].

use serde::{Deserialize, Serialize};

use crate::item::ItemStage;

/// Bytes per GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Default ceiling on logical disk usage (80 GiB).
pub const DEFAULT_MAX_USAGE_BYTES: u64 = 80 * GIB;

/// Default low-water mark kept free below the ceiling (5 GiB).
pub const DEFAULT_LOW_WATER_BYTES: u64 = 5 * GIB;

/// Default inflation applied to every admission request.
pub const DEFAULT_SAFETY_MARGIN_PERCENT: u32 = 10;

/// Compressed size assumed before the archive has been measured.
pub const ESTIMATED_COMPRESSION_PERCENT: u64 = 50;

// ---------------------------------------------------------------------------
// DiskSpaceInfo / SpaceStatus
// ---------------------------------------------------------------------------

/// Snapshot of a volume as reported by the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpaceInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    Sufficient,
    Warning,
    Critical,
    /// The volume could not be queried. Treated as a denial.
    Unavailable,
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceStatus::Sufficient => "sufficient",
            SpaceStatus::Warning => "warning",
            SpaceStatus::Critical => "critical",
            SpaceStatus::Unavailable => "unavailable",
        }
    }
}

// ---------------------------------------------------------------------------
// SpaceLimits
// ---------------------------------------------------------------------------

/// Ceiling, low-water mark and safety margin for one monitored volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceLimits {
    /// Hard ceiling on `used + reserved`.
    pub max_usage_bytes: u64,
    /// Headroom below the threshold under which status degrades to warning.
    pub low_water_bytes: u64,
    pub safety_margin_percent: u32,
}

impl Default for SpaceLimits {
    fn default() -> Self {
        Self {
            max_usage_bytes: DEFAULT_MAX_USAGE_BYTES,
            low_water_bytes: DEFAULT_LOW_WATER_BYTES,
            safety_margin_percent: DEFAULT_SAFETY_MARGIN_PERCENT,
        }
    }
}

impl SpaceLimits {
    /// Admission threshold: the ceiling minus the low-water mark.
    pub fn threshold_bytes(&self) -> u64 {
        self.max_usage_bytes.saturating_sub(self.low_water_bytes)
    }

    /// `required` inflated by the safety margin (margin rounded down).
    pub fn with_margin(&self, required: u64) -> u64 {
        let margin = (required as u128 * self.safety_margin_percent as u128) / 100;
        required.saturating_add(margin.min(u64::MAX as u128) as u64)
    }

    /// Whether `required` more bytes fit, given `reserved` bytes already held.
    ///
    /// Holds iff `used + reserved + required*(1+margin) <= threshold` and the
    /// inflated request also fits in the OS-reported free space net of
    /// reservations.
    pub fn admits(&self, info: &DiskSpaceInfo, reserved: u64, required: u64) -> bool {
        let needed = self.with_margin(required) as u128;
        let projected = info.used_bytes as u128 + reserved as u128 + needed;
        let physically_free = (info.free_bytes as u128).saturating_sub(reserved as u128);
        projected <= self.threshold_bytes() as u128 && needed <= physically_free
    }

    /// Classify `used + reserved` against the threshold and low-water mark.
    pub fn status(&self, info: &DiskSpaceInfo, reserved: u64) -> SpaceStatus {
        let effective_used = info.used_bytes.saturating_add(reserved);
        let threshold = self.threshold_bytes();
        if effective_used > threshold {
            SpaceStatus::Critical
        } else if threshold - effective_used < self.low_water_bytes {
            SpaceStatus::Warning
        } else {
            SpaceStatus::Sufficient
        }
    }
}

// ---------------------------------------------------------------------------
// Stage footprints
// ---------------------------------------------------------------------------

/// Expected compressed size, preferring the measured archive size.
pub fn compressed_estimate(source_bytes: u64, measured_archive: Option<u64>) -> u64 {
    measured_archive.unwrap_or_else(|| {
        source_bytes / 100 * ESTIMATED_COMPRESSION_PERCENT
            + source_bytes % 100 * ESTIMATED_COMPRESSION_PERCENT / 100
    })
}

/// Peak disk footprint of an item while it sits in `stage`, before margin.
///
/// Once the archive has been written its measured size replaces the
/// compression estimate.
pub fn stage_footprint(stage: ItemStage, source_bytes: u64, measured_archive: Option<u64>) -> u64 {
    let compressed = compressed_estimate(source_bytes, measured_archive);
    match stage {
        ItemStage::Classify | ItemStage::Deleted => 0,
        ItemStage::Hash => source_bytes,
        ItemStage::Zip => source_bytes.saturating_add(compressed),
        ItemStage::ZipHash | ItemStage::UploadQueue | ItemStage::Uploaded => compressed,
        ItemStage::Unzip | ItemStage::UnzipHash => source_bytes
            .saturating_add(compressed)
            .saturating_add(source_bytes),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
