//! Top-level orchestration.
//!
//! [`Coordinator`] owns no logic of its own beyond scheduling: it pulls
//! eligible items from the store, gates them on disk space, runs them
//! through the [`ItemPipeline`] on a bounded number of tasks, hands the
//! results to the [`UploadService`] and routes every failure to the
//! [`RecoveryEngine`]. Upload completion is handled by an internal
//! [`UploadObserver`] that cleans up local artifacts and releases the
//! item's reservation.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use stowage_core::item::{ClassifyTag, ItemRecord, ItemStage, Outcome};
use stowage_core::recovery::ErrorType;
use stowage_core::space::stage_footprint;
use stowage_core::store::{ItemPatch, ItemQuery, ItemStore, StoreError};
use stowage_core::types::DbId;
use stowage_events::bus::{ITEM_FAILED, ITEM_QUEUED, ITEM_UPLOADED, RUN_COMPLETED};
use stowage_events::{BackupEvent, EventBus};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifacts;
use crate::classify::SourceClassifier;
use crate::error::StageFailure;
use crate::ledger::{PathSpaceReport, ReservationGuard, SpaceLedger};
use crate::pipeline::{ItemPipeline, PipelineOutput};
use crate::recovery::RecoveryEngine;
use crate::upload::{CallbackResult, UploadObserver, UploadQueueStatus, UploadService, UploadTask};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Volume that admission control is checked against.
    pub work_dir: PathBuf,
    /// Items processed concurrently by the pipeline.
    pub pipeline_workers: usize,
    /// How long a run waits for the upload queue to drain.
    pub drain_timeout: Duration,
    /// Delete the source after a verified upload.
    pub delete_source: bool,
    /// Discover new sources at the start of every run.
    pub classify_on_run: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./data"),
            pipeline_workers: 1,
            drain_timeout: Duration::from_secs(24 * 3600),
            delete_source: false,
            classify_on_run: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Collaborators the coordinator drives. Built by the caller.
pub struct CoordinatorServices {
    pub store: Arc<dyn ItemStore>,
    pub ledger: Arc<SpaceLedger>,
    pub pipeline: Arc<ItemPipeline>,
    pub upload: Arc<UploadService>,
    pub recovery: Arc<RecoveryEngine>,
    pub classifier: Option<Arc<dyn SourceClassifier>>,
    pub bus: Option<Arc<EventBus>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub space_denied: u64,
    /// `succeeded / processed`, or 0 when nothing was processed.
    pub success_rate: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub paused: bool,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub space_denied: u64,
    pub open_errors: usize,
    pub space: Vec<PathSpaceReport>,
    pub upload: UploadQueueStatus,
}

#[derive(Default)]
struct RunCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    space_denied: AtomicU64,
}

impl RunCounters {
    fn reset(&self) {
        for c in [&self.processed, &self.succeeded, &self.failed, &self.space_denied] {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish(bus: &Option<Arc<EventBus>>, event: BackupEvent) {
    if let Some(bus) = bus {
        bus.publish(event);
    }
}

// ---------------------------------------------------------------------------
// Completion handling
// ---------------------------------------------------------------------------

/// Reacts to finished uploads and owns the reservations of queued items.
struct CompletionHandler {
    store: Arc<dyn ItemStore>,
    recovery: Arc<RecoveryEngine>,
    bus: Option<Arc<EventBus>>,
    delete_source: bool,
    reservations: Mutex<HashMap<DbId, ReservationGuard>>,
    counters: Arc<RunCounters>,
}

impl CompletionHandler {
    fn hold(&self, item_id: DbId, guard: ReservationGuard) {
        lock(&self.reservations).insert(item_id, guard);
    }

    fn take(&self, item_id: DbId) -> Option<ReservationGuard> {
        lock(&self.reservations).remove(&item_id)
    }
}

#[async_trait]
impl UploadObserver for CompletionHandler {
    async fn on_success(&self, task: &UploadTask) -> CallbackResult {
        // Dropped on every exit path, releasing the archive's space.
        let _reservation = self.take(task.item_id);
        RunCounters::bump(&self.counters.succeeded);
        self.recovery.resolve(task.item_id);

        let item = self
            .store
            .find_by_id(task.item_id)
            .await?
            .ok_or(StoreError::NotFound(task.item_id))?;

        artifacts::discard_item_artifacts(&item).await;
        if self.delete_source && item.verified {
            artifacts::discard(&item.source_path, "source").await;
        }
        self.store
            .update(
                ItemPatch::new(item.id)
                    .stage(ItemStage::Deleted)
                    .outcome(Outcome::Success)
                    .clear_failure(),
            )
            .await?;

        publish(
            &self.bus,
            BackupEvent::new(ITEM_UPLOADED)
                .for_item(item.id)
                .with_payload(serde_json::json!({
                    "bytes": task.size,
                    "retries": task.retry_count,
                    "remote_path": task.receipt.as_ref().and_then(|r| r.remote_path.clone()),
                })),
        );
        Ok(())
    }

    async fn on_failure(&self, task: &UploadTask) -> CallbackResult {
        drop(self.take(task.item_id));
        RunCounters::bump(&self.counters.failed);

        let failure = StageFailure {
            item_id: task.item_id,
            stage: ItemStage::UploadQueue,
            error_type: Some(ErrorType::UploadFailed),
            message: task
                .last_error
                .clone()
                .unwrap_or_else(|| "upload failed".to_string()),
        };
        let record = self.recovery.record_failure(&failure).await;
        publish(
            &self.bus,
            BackupEvent::new(ITEM_FAILED)
                .for_item(task.item_id)
                .with_payload(serde_json::json!({
                    "stage": failure.stage,
                    "error_type": record.error_type,
                    "message": failure.message,
                })),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn ItemStore>,
    ledger: Arc<SpaceLedger>,
    pipeline: Arc<ItemPipeline>,
    upload: Arc<UploadService>,
    recovery: Arc<RecoveryEngine>,
    classifier: Option<Arc<dyn SourceClassifier>>,
    bus: Option<Arc<EventBus>>,
    completion: Arc<CompletionHandler>,
    counters: Arc<RunCounters>,
    running: AtomicBool,
    paused: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, services: CoordinatorServices) -> Arc<Self> {
        let counters = Arc::new(RunCounters::default());
        let completion = Arc::new(CompletionHandler {
            store: Arc::clone(&services.store),
            recovery: Arc::clone(&services.recovery),
            bus: services.bus.clone(),
            delete_source: config.delete_source,
            reservations: Mutex::new(HashMap::new()),
            counters: Arc::clone(&counters),
        });
        services.upload.set_observer(completion.clone());
        let (paused, _) = watch::channel(false);

        Arc::new(Self {
            config,
            store: services.store,
            ledger: services.ledger,
            pipeline: services.pipeline,
            upload: services.upload,
            recovery: services.recovery,
            classifier: services.classifier,
            bus: services.bus,
            completion,
            counters,
            running: AtomicBool::new(false),
            paused,
            cancel: Mutex::new(CancellationToken::new()),
            sweep: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Create working directories, start the upload workers and the
    /// recovery sweep. Idempotent.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pipeline = self.pipeline.config();
        for dir in [&self.config.work_dir, &pipeline.archive_dir, &pipeline.scratch_dir] {
            if let Err(source) = tokio::fs::create_dir_all(dir).await {
                self.running.store(false, Ordering::SeqCst);
                return Err(CoordinatorError::Io {
                    path: dir.clone(),
                    source,
                });
            }
        }

        if let Err(e) = self.recovery.restore(Utc::now()).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();
        self.upload.start();
        let recovery = Arc::clone(&self.recovery);
        *lock(&self.sweep) = Some(tokio::spawn(recovery.run(cancel.child_token())));

        tracing::info!(
            work_dir = %self.config.work_dir.display(),
            pipeline_workers = self.config.pipeline_workers,
            "Coordinator started"
        );
        Ok(())
    }

    /// Cancel any run in progress, then stop uploads and the sweep.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        lock(&self.cancel).cancel();
        self.upload.stop(true).await;
        let sweep = lock(&self.sweep).take();
        if let Some(handle) = sweep {
            let _ = handle.await;
        }
        tracing::info!("Coordinator stopped");
    }

    /// Hold the pull loop before its next item.
    pub fn pause(&self) {
        self.paused.send_replace(true);
        tracing::info!("Coordinator paused");
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        tracing::info!("Coordinator resumed");
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            space_denied: self.counters.space_denied.load(Ordering::Relaxed),
            open_errors: self.recovery.open_records().len(),
            space: self.ledger.report(),
            upload: self.upload.status(),
        }
    }

    /// Process pending items until none are left (or `max_items` have been
    /// taken), then wait for the upload queue to drain.
    pub async fn run_to_completion(self: &Arc<Self>, max_items: Option<usize>) -> Result<RunStats, CoordinatorError> {
        self.start().await?;
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let cancel = lock(&self.cancel).clone();
        self.counters.reset();
        tracing::info!(%run_id, ?max_items, "Run started");

        if self.config.classify_on_run {
            if let Some(classifier) = &self.classifier {
                if let Err(e) = classifier.classify_sources().await {
                    tracing::error!(error = %e, "Source classification failed");
                }
            }
        }

        let permits = Arc::new(Semaphore::new(self.config.pipeline_workers.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut seen: HashSet<DbId> = HashSet::new();
        let limit = max_items.unwrap_or(usize::MAX);

        'pull: while !cancel.is_cancelled() {
            let batch = self.pending_items(&seen).await?;
            if batch.is_empty() {
                // Running items may still fail fast and free capacity, but
                // nothing new can appear until they finish.
                match tasks.join_next().await {
                    Some(joined) => {
                        log_join(joined);
                        continue;
                    }
                    None => break,
                }
            }

            for item in batch {
                if seen.len() >= limit {
                    break 'pull;
                }
                if !self.wait_while_paused(&cancel).await {
                    break 'pull;
                }
                seen.insert(item.id);
                while let Some(joined) = tasks.try_join_next() {
                    log_join(joined);
                }

                if item.stage == ItemStage::UploadQueue {
                    self.resubmit(&item).await;
                    continue;
                }
                if !self.admit(&item, &cancel).await {
                    continue;
                }

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break 'pull,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break 'pull,
                    },
                };
                RunCounters::bump(&self.counters.processed);
                let this = Arc::clone(self);
                tasks.spawn(async move {
                    this.process(item).await;
                    drop(permit);
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        // A stopped run leaves queued uploads for the next start.
        if !cancel.is_cancelled() && !self.upload.wait_for_completion(self.config.drain_timeout).await {
            tracing::warn!(%run_id, "Upload queue did not drain before timeout");
        }

        let stats = self.stats(run_id, started.elapsed());
        tracing::info!(
            %run_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            space_denied = stats.space_denied,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Run completed"
        );
        publish(
            &self.bus,
            BackupEvent::new(RUN_COMPLETED).with_payload(serde_json::to_value(&stats).unwrap_or_default()),
        );
        Ok(stats)
    }

    fn stats(&self, run_id: Uuid, elapsed: Duration) -> RunStats {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        RunStats {
            run_id,
            processed,
            succeeded,
            failed: self.counters.failed.load(Ordering::Relaxed),
            space_denied: self.counters.space_denied.load(Ordering::Relaxed),
            success_rate: if processed == 0 {
                0.0
            } else {
                succeeded as f64 / processed as f64
            },
            elapsed,
        }
    }

    /// New eligible items, then queued items awaiting (re)submission.
    async fn pending_items(&self, seen: &HashSet<DbId>) -> Result<Vec<ItemRecord>, StoreError> {
        let fresh = self
            .store
            .query(&ItemQuery {
                stages: vec![ItemStage::Classify],
                tags: ClassifyTag::ELIGIBLE.to_vec(),
                outcomes: vec![Outcome::Pending],
                ..ItemQuery::default()
            })
            .await?;
        let queued = self
            .store
            .query(&ItemQuery {
                stages: vec![ItemStage::UploadQueue],
                outcomes: vec![Outcome::Pending],
                ..ItemQuery::default()
            })
            .await?;
        Ok(fresh
            .into_iter()
            .chain(queued)
            .filter(|item| !seen.contains(&item.id))
            .collect())
    }

    /// Returns `false` if the run was cancelled while paused.
    async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        !cancel.is_cancelled()
    }

    /// Wait (bounded) until the item's compression footprint fits.
    async fn admit(&self, item: &ItemRecord, cancel: &CancellationToken) -> bool {
        let required = match item.plan() {
            Some(stowage_core::item::PipelinePlan::Compressible) => {
                stage_footprint(ItemStage::Zip, item.size_bytes, None)
            }
            _ => return true,
        };
        let work_dir = &self.config.work_dir;
        if self.ledger.admit(required, work_dir) {
            return true;
        }
        let space = self.ledger.config();
        let (ok, info) = self
            .ledger
            .wait_for_space(required, work_dir, space.max_wait, space.poll_interval, cancel)
            .await;
        if ok {
            return true;
        }
        if cancel.is_cancelled() {
            return false;
        }

        RunCounters::bump(&self.counters.processed);
        RunCounters::bump(&self.counters.space_denied);
        RunCounters::bump(&self.counters.failed);
        let used = info.map(|i| i.used_bytes);
        let failure = StageFailure {
            item_id: item.id,
            stage: item.stage,
            error_type: Some(ErrorType::SpaceInsufficient),
            message: format!("Insufficient disk space: {required} bytes required, used {used:?}"),
        };
        self.fail(&failure).await;
        false
    }

    async fn process(&self, item: ItemRecord) {
        match self.pipeline.process(&item).await {
            Ok(output) => self.enqueue(output),
            Err(failure) => {
                if failure.error_type == Some(ErrorType::SpaceInsufficient) {
                    RunCounters::bump(&self.counters.space_denied);
                }
                RunCounters::bump(&self.counters.failed);
                self.fail(&failure).await;
            }
        }
    }

    fn enqueue(&self, output: PipelineOutput) {
        let PipelineOutput {
            item_id,
            archive_path,
            archive_size,
            reservation,
        } = output;
        if let Some(guard) = reservation {
            self.completion.hold(item_id, guard);
        }
        publish(
            &self.bus,
            BackupEvent::new(ITEM_QUEUED)
                .for_item(item_id)
                .with_payload(serde_json::json!({ "bytes": archive_size })),
        );
        self.upload.submit(item_id, archive_path, archive_size, 0);
    }

    /// Requeue an item whose archive was built in an earlier run.
    async fn resubmit(&self, item: &ItemRecord) {
        RunCounters::bump(&self.counters.processed);
        match (&item.archive_path, item.archive_size) {
            (Some(path), Some(size)) => {
                tracing::info!(item_id = item.id, archive = %path.display(), "Resubmitting queued item");
                self.enqueue(PipelineOutput {
                    item_id: item.id,
                    archive_path: path.clone(),
                    archive_size: size,
                    reservation: None,
                });
            }
            _ => {
                RunCounters::bump(&self.counters.failed);
                let failure = StageFailure {
                    item_id: item.id,
                    stage: ItemStage::UploadQueue,
                    error_type: Some(ErrorType::CompressionFailed),
                    message: "Queued item has no archive recorded".to_string(),
                };
                self.fail(&failure).await;
            }
        }
    }

    async fn fail(&self, failure: &StageFailure) {
        let record = self.recovery.record_failure(failure).await;
        publish(
            &self.bus,
            BackupEvent::new(ITEM_FAILED)
                .for_item(failure.item_id)
                .with_payload(serde_json::json!({
                    "stage": failure.stage,
                    "error_type": record.error_type,
                    "message": failure.message,
                })),
        );
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Pipeline task panicked");
    }
}
