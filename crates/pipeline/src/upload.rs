//! Upload queue and worker pool.
//!
//! [`UploadService`] accepts pipeline outputs without blocking the caller and
//! uploads them with a fixed number of worker tasks. Fresh tasks wait in a
//! priority queue; failed attempts go to a FIFO retry queue that workers
//! drain first. Each task is attempted at most `max_retries + 1` times.
//!
//! Completion is reported to an [`UploadObserver`]. Observer errors and
//! panics are logged and never take a worker down.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use stowage_core::item::ItemStage;
use stowage_core::store::{ItemPatch, ItemStore};
use stowage_core::types::{DbId, Timestamp};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::{UploadReceipt, Uploader};

/// How often `wait_for_completion` re-checks the queues.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub workers: usize,
    pub max_retries: u32,
    /// Delay before retry `n` is `retry_backoff * n`. Zero requeues at once.
    pub retry_backoff: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 5,
            retry_backoff: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Retrying,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    pub item_id: DbId,
    pub path: PathBuf,
    pub size: u64,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: UploadStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub receipt: Option<UploadReceipt>,
    pub last_error: Option<String>,
}

/// Input for [`UploadService::submit_batch`].
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub item_id: DbId,
    pub path: PathBuf,
    pub size: u64,
    pub priority: i32,
}

pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives terminal upload results.
#[async_trait]
pub trait UploadObserver: Send + Sync {
    async fn on_success(&self, task: &UploadTask) -> CallbackResult;

    async fn on_failure(&self, task: &UploadTask) -> CallbackResult;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadQueueStatus {
    pub running: bool,
    pub primary_len: usize,
    pub retry_len: usize,
    pub in_flight: usize,
    /// Retries waiting out their backoff before re-entering the retry queue.
    pub scheduled: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// Primary-queue entry: higher priority first, then submission order.
struct Queued {
    priority: i32,
    seq: u64,
    task: UploadTask,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queues {
    primary: BinaryHeap<Queued>,
    retry: VecDeque<UploadTask>,
    /// Tasks handed to a worker, keyed by attempt ticket.
    active: HashMap<u64, UploadTask>,
    scheduled: usize,
    seq: u64,
}

impl Queues {
    /// Next task and the ticket that closes its attempt.
    fn pop(&mut self) -> Option<(u64, UploadTask)> {
        let task = self
            .retry
            .pop_front()
            .or_else(|| self.primary.pop().map(|q| q.task))?;
        self.seq += 1;
        self.active.insert(self.seq, task.clone());
        Some((self.seq, task))
    }

    /// Put attempts cut short by an aborted worker back at the head of the
    /// retry queue, oldest first. The aborted attempt is not counted.
    fn requeue_active(&mut self) -> usize {
        let mut aborted: Vec<_> = self.active.drain().collect();
        aborted.sort_unstable_by_key(|(ticket, _)| *ticket);
        let count = aborted.len();
        for (_, mut task) in aborted.into_iter().rev() {
            task.status = UploadStatus::Pending;
            task.started_at = None;
            self.retry.push_front(task);
        }
        count
    }

    fn is_idle(&self) -> bool {
        self.primary.is_empty() && self.retry.is_empty() && self.active.is_empty() && self.scheduled == 0
    }

    fn has_work(&self) -> bool {
        !self.primary.is_empty() || !self.retry.is_empty()
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

// ---------------------------------------------------------------------------
// UploadService
// ---------------------------------------------------------------------------

pub struct UploadService {
    config: UploadConfig,
    uploader: Arc<dyn Uploader>,
    store: Arc<dyn ItemStore>,
    observer: Mutex<Option<Arc<dyn UploadObserver>>>,
    queues: Mutex<Queues>,
    notify: Notify,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UploadService {
    pub fn new(config: UploadConfig, uploader: Arc<dyn Uploader>, store: Arc<dyn ItemStore>) -> Self {
        Self {
            config,
            uploader,
            store,
            observer: Mutex::new(None),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            counters: Counters::default(),
            workers: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn set_observer(&self, observer: Arc<dyn UploadObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.workers).is_empty()
    }

    /// Spawn the worker pool. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }
        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();

        let count = self.config.workers.max(1);
        for worker_id in 0..count {
            let service = Arc::clone(self);
            let cancel = cancel.child_token();
            workers.push(tokio::spawn(async move {
                service.worker_loop(worker_id, cancel).await;
            }));
        }
        tracing::info!(workers = count, max_retries = self.config.max_retries, "Upload service started");
    }

    /// Stop the workers. With `wait`, in-flight uploads finish first;
    /// without it they are aborted and requeued. Queued and scheduled tasks
    /// stay queued for the next `start`.
    pub async fn stop(&self, wait: bool) {
        lock(&self.cancel).cancel();
        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if !wait {
                handle.abort();
            }
            let _ = handle.await;
        }
        let requeued = lock(&self.queues).requeue_active();
        tracing::info!(wait, requeued, "Upload service stopped");
    }

    /// Enqueue an upload. Never blocks; the returned snapshot is `Pending`.
    pub fn submit(&self, item_id: DbId, path: PathBuf, size: u64, priority: i32) -> UploadTask {
        let task = UploadTask {
            item_id,
            path,
            size,
            priority,
            retry_count: 0,
            max_retries: self.config.max_retries,
            status: UploadStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            receipt: None,
            last_error: None,
        };
        {
            let mut queues = lock(&self.queues);
            queues.seq += 1;
            let seq = queues.seq;
            queues.primary.push(Queued {
                priority,
                seq,
                task: task.clone(),
            });
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        tracing::debug!(item_id, size, priority, "Upload queued");
        task
    }

    pub fn submit_batch(&self, requests: Vec<UploadRequest>) -> Vec<UploadTask> {
        requests
            .into_iter()
            .map(|r| self.submit(r.item_id, r.path, r.size, r.priority))
            .collect()
    }

    /// Wait until both queues are empty and nothing is in flight.
    /// Returns `false` on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let drained = async {
            while !lock(&self.queues).is_idle() {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    pub fn status(&self) -> UploadQueueStatus {
        let queues = lock(&self.queues);
        UploadQueueStatus {
            running: !lock(&self.workers).is_empty(),
            primary_len: queues.primary.len(),
            retry_len: queues.retry.len(),
            in_flight: queues.active.len(),
            scheduled: queues.scheduled,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    // -- workers ---

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        tracing::debug!(worker_id, "Upload worker started");
        loop {
            let (ticket, task) = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.next_task() => next,
            };
            self.execute(ticket, task).await;
        }
        tracing::debug!(worker_id, "Upload worker stopped");
    }

    async fn next_task(&self) -> (u64, UploadTask) {
        loop {
            let popped = {
                let mut queues = lock(&self.queues);
                queues.pop().map(|next| (next, queues.has_work()))
            };
            match popped {
                Some((next, more)) => {
                    if more {
                        self.notify.notify_one();
                    }
                    return next;
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn execute(self: &Arc<Self>, ticket: u64, mut task: UploadTask) {
        task.status = UploadStatus::Uploading;
        task.started_at = Some(Utc::now());

        if !tokio::fs::try_exists(&task.path).await.unwrap_or(false) {
            task.last_error = Some(format!("Artifact not found: {}", task.path.display()));
            tracing::error!(item_id = task.item_id, path = %task.path.display(), "Upload artifact missing");
            self.fail(ticket, task).await;
            return;
        }

        let result = self.uploader.upload(task.item_id, &task.path).await;
        match result {
            Ok(receipt) if receipt.is_success() => {
                task.receipt = Some(receipt);
                self.succeed(ticket, task).await;
            }
            Ok(receipt) => {
                task.last_error = Some(format!(
                    "upload errno {}: {}",
                    receipt.errno,
                    receipt.message.as_deref().unwrap_or("no message")
                ));
                task.receipt = Some(receipt);
                self.retry_or_fail(ticket, task).await;
            }
            Err(e) => {
                task.last_error = Some(e.to_string());
                self.retry_or_fail(ticket, task).await;
            }
        }
    }

    async fn succeed(&self, ticket: u64, mut task: UploadTask) {
        task.status = UploadStatus::Success;
        task.completed_at = Some(Utc::now());
        if let Err(e) = self
            .store
            .update(ItemPatch::new(task.item_id).stage(ItemStage::Uploaded))
            .await
        {
            tracing::error!(item_id = task.item_id, error = %e, "Failed to record upload");
        }
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            item_id = task.item_id,
            bytes = task.size,
            retries = task.retry_count,
            "Upload succeeded"
        );
        self.call_observer(&task, true).await;
        self.finish_attempt(ticket);
    }

    async fn fail(&self, ticket: u64, mut task: UploadTask) {
        task.status = UploadStatus::Failed;
        task.completed_at = Some(Utc::now());
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            item_id = task.item_id,
            retries = task.retry_count,
            error = task.last_error.as_deref().unwrap_or(""),
            "Upload failed permanently"
        );
        self.call_observer(&task, false).await;
        self.finish_attempt(ticket);
    }

    async fn retry_or_fail(self: &Arc<Self>, ticket: u64, mut task: UploadTask) {
        if task.retry_count >= task.max_retries {
            self.fail(ticket, task).await;
            return;
        }
        task.retry_count += 1;
        task.status = UploadStatus::Retrying;
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            item_id = task.item_id,
            retry = task.retry_count,
            max_retries = task.max_retries,
            error = task.last_error.as_deref().unwrap_or(""),
            "Upload failed, will retry"
        );

        let delay = self.config.retry_backoff.saturating_mul(task.retry_count);
        if delay.is_zero() {
            let mut queues = lock(&self.queues);
            queues.active.remove(&ticket);
            queues.retry.push_back(task);
            drop(queues);
            self.notify.notify_one();
            return;
        }

        {
            let mut queues = lock(&self.queues);
            queues.active.remove(&ticket);
            queues.scheduled += 1;
        }
        let service = Arc::clone(self);
        let cancel = lock(&self.cancel).clone();
        tokio::spawn(async move {
            tokio::select! {
                // On shutdown the retry skips its backoff and waits in the
                // retry queue for the next start.
                _ = cancel.cancelled() => {
                    tracing::debug!(item_id = task.item_id, "Scheduled upload retry parked on shutdown");
                }
                _ = tokio::time::sleep(delay) => {}
            }
            let mut queues = lock(&service.queues);
            queues.scheduled -= 1;
            queues.retry.push_back(task);
            drop(queues);
            service.notify.notify_one();
        });
    }

    fn finish_attempt(&self, ticket: u64) {
        lock(&self.queues).active.remove(&ticket);
    }

    async fn call_observer(&self, task: &UploadTask, success: bool) {
        let Some(observer) = lock(&self.observer).clone() else {
            return;
        };
        let call = async {
            if success {
                observer.on_success(task).await
            } else {
                observer.on_failure(task).await
            }
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(item_id = task.item_id, success, error = %e, "Upload callback failed");
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(item_id = task.item_id, success, panic = %message, "Upload callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(priority: i32, seq: u64) -> Queued {
        Queued {
            priority,
            seq,
            task: UploadTask {
                item_id: seq as DbId,
                path: PathBuf::from("/a"),
                size: 1,
                priority,
                retry_count: 0,
                max_retries: 0,
                status: UploadStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                receipt: None,
                last_error: None,
            },
        }
    }

    #[test]
    fn primary_queue_orders_by_priority_then_fifo() {
        let mut q = Queues::default();
        q.primary.push(queued(0, 1));
        q.primary.push(queued(5, 2));
        q.primary.push(queued(0, 3));
        q.primary.push(queued(5, 4));
        let order: Vec<DbId> = std::iter::from_fn(|| q.pop()).map(|(_, t)| t.item_id).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert_eq!(q.active.len(), 4);
    }

    #[test]
    fn retry_queue_is_preferred() {
        let mut q = Queues::default();
        q.primary.push(queued(9, 1));
        q.retry.push_back(queued(0, 2).task);
        assert_eq!(q.pop().map(|(_, t)| t.item_id), Some(2));
        assert_eq!(q.pop().map(|(_, t)| t.item_id), Some(1));
        assert!(q.pop().is_none());
    }

    #[test]
    fn aborted_attempts_return_to_retry_head_in_order() {
        let mut q = Queues::default();
        q.primary.push(queued(0, 1));
        q.primary.push(queued(0, 2));
        q.primary.push(queued(0, 3));
        let (first, _) = q.pop().unwrap();
        q.pop().unwrap();
        q.active.remove(&first);
        q.retry.push_back(queued(0, 9).task);

        assert_eq!(q.requeue_active(), 1);
        assert!(q.active.is_empty());
        let order: Vec<DbId> = q.retry.iter().map(|t| t.item_id).collect();
        assert_eq!(order, vec![2, 9]);
        assert_eq!(q.retry[0].status, UploadStatus::Pending);
        assert_eq!(q.primary.len(), 1);
    }

    #[test]
    fn idle_requires_no_scheduled_retries() {
        let mut q = Queues::default();
        assert!(q.is_idle());
        q.scheduled = 1;
        assert!(!q.is_idle());
    }
}
