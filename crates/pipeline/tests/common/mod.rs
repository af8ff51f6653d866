#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stowage_core::notify::Notifier;
use stowage_core::space::{DiskSpaceInfo, SpaceLimits};
use stowage_pipeline::ledger::{DiskProbe, SpaceConfig, SpaceLedger};
use stowage_core::types::DbId;
use stowage_pipeline::transport::{remote_key, TransportError, UploadReceipt, Uploader};
use stowage_pipeline::upload::{CallbackResult, UploadObserver, UploadTask};

pub const MB: u64 = 1024 * 1024;

/// Probe reporting a fixed usage on a very large volume.
pub struct FixedProbe {
    pub used: AtomicU64,
}

impl FixedProbe {
    pub fn new(used: u64) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicU64::new(used),
        })
    }
}

impl DiskProbe for FixedProbe {
    fn probe(&self, _path: &Path) -> std::io::Result<DiskSpaceInfo> {
        let used = self.used.load(Ordering::SeqCst);
        Ok(DiskSpaceInfo {
            total_bytes: 1 << 40,
            used_bytes: used,
            free_bytes: (1 << 40) - used,
        })
    }
}

/// Ledger with a `threshold`-byte budget on `work_dir` and no low-water mark.
pub fn ledger(work_dir: &Path, threshold: u64, margin_percent: u32, probe: Arc<FixedProbe>) -> Arc<SpaceLedger> {
    let config = SpaceConfig {
        enabled: true,
        limits: SpaceLimits {
            max_usage_bytes: threshold,
            low_water_bytes: 0,
            safety_margin_percent: margin_percent,
        },
        poll_interval: std::time::Duration::from_millis(10),
        max_wait: std::time::Duration::from_millis(50),
        monitored_paths: vec![work_dir.to_path_buf()],
    };
    Arc::new(SpaceLedger::new(config, probe))
}

/// Uploader failing its first `failures` calls with errno 1.
#[derive(Default)]
pub struct ScriptedUploader {
    pub failures: u32,
    pub calls: AtomicU32,
    pub uploaded: Mutex<Vec<PathBuf>>,
}

impl ScriptedUploader {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn upload(&self, item_id: DbId, path: &Path) -> Result<UploadReceipt, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Ok(UploadReceipt::failed(1, "remote busy"));
        }
        self.uploaded.lock().unwrap().push(path.to_path_buf());
        Ok(UploadReceipt::ok(format!("remote://{}", remote_key(item_id, path))))
    }
}

/// Observer that remembers every terminal task.
#[derive(Default)]
pub struct RecordingObserver {
    pub succeeded: Mutex<Vec<UploadTask>>,
    pub failed: Mutex<Vec<UploadTask>>,
}

#[async_trait]
impl UploadObserver for RecordingObserver {
    async fn on_success(&self, task: &UploadTask) -> CallbackResult {
        self.succeeded.lock().unwrap().push(task.clone());
        Ok(())
    }

    async fn on_failure(&self, task: &UploadTask) -> CallbackResult {
        self.failed.lock().unwrap().push(task.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct SilentNotifier {
    pub sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for SilentNotifier {
    async fn send(&self, subject: &str, _payload: &serde_json::Value) -> bool {
        self.sent.lock().unwrap().push(subject.to_string());
        true
    }
}

/// Regular files anywhere under `root`.
pub fn files_under(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

/// Deterministic, moderately compressible content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 251) as u8 ^ (i / 4096) as u8).collect()
}
