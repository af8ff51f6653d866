//! Failure bookkeeping and delayed recovery.
//!
//! Every stage or upload failure ends up in [`RecoveryEngine::record_failure`],
//! which classifies it, opens (or re-arms) the item's [`ErrorRecord`] and
//! marks the item `error`. A periodic [`sweep`](RecoveryEngine::sweep)
//! dispatches records whose retry time has come, according to the policy of
//! their error type, and reaps zombie items that stopped moving without an
//! open record.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use stowage_core::item::{FailureReason, ItemRecord, ItemStage, Outcome};
use stowage_core::notify::Notifier;
use stowage_core::recovery::{ErrorClassifier, ErrorRecord, ErrorType, RecoveryAction, RetryPolicy};
use stowage_core::store::{ItemPatch, ItemQuery, ItemStore, StoreError};
use stowage_core::types::{DbId, Timestamp};
use tokio_util::sync::CancellationToken;

use crate::artifacts;
use crate::error::StageFailure;

/// Failure message stored on items reset by the zombie reaper.
pub const ZOMBIE_REAPED: &str = "zombie reaped";

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub sweep_interval: Duration,
    /// Items with no progress for this long are reaped.
    pub zombie_threshold: Duration,
    /// Replaces the built-in policy for the listed error types.
    pub policy_overrides: HashMap<ErrorType, RetryPolicy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            zombie_threshold: Duration::from_secs(24 * 3600),
            policy_overrides: HashMap::new(),
        }
    }
}

/// What one dispatch did with a due record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Item reset and eligible for the pipeline again.
    Retried(ItemStage),
    Skipped,
    Escalated,
    /// Retry budget exceeded.
    Exhausted,
    /// The item no longer exists; the record was dropped.
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dispatched: usize,
    pub retried: usize,
    pub skipped: usize,
    pub escalated: usize,
    pub exhausted: usize,
    pub reaped: usize,
    pub errors: usize,
}

pub struct RecoveryEngine {
    config: RecoveryConfig,
    store: Arc<dyn ItemStore>,
    notifier: Arc<dyn Notifier>,
    classifier: ErrorClassifier,
    records: Mutex<HashMap<DbId, ErrorRecord>>,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig, store: Arc<dyn ItemStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            store,
            notifier,
            classifier: ErrorClassifier::default(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DbId, ErrorRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy_for(&self, error_type: ErrorType) -> RetryPolicy {
        self.config
            .policy_overrides
            .get(&error_type)
            .copied()
            .unwrap_or_else(|| RetryPolicy::for_error(error_type))
    }

    /// Structured type if the failure carries one, else the classifier's.
    pub fn classify(&self, failure: &StageFailure) -> ErrorType {
        failure
            .error_type
            .unwrap_or_else(|| self.classifier.classify(&failure.message))
    }

    pub fn get(&self, item_id: DbId) -> Option<ErrorRecord> {
        self.lock().get(&item_id).cloned()
    }

    pub fn open_records(&self) -> Vec<ErrorRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by_key(|r| r.item_id);
        records
    }

    /// Open or re-arm the item's record and mark the item `error`.
    pub async fn record_failure(&self, failure: &StageFailure) -> ErrorRecord {
        self.record_failure_at(failure, Utc::now()).await
    }

    pub async fn record_failure_at(&self, failure: &StageFailure, now: Timestamp) -> ErrorRecord {
        let error_type = self.classify(failure);
        let policy = self.policy_for(error_type);

        let record = {
            let mut records = self.lock();
            let record = records
                .entry(failure.item_id)
                .and_modify(|r| r.refail(error_type, failure.message.clone(), failure.stage, &policy, now))
                .or_insert_with(|| {
                    ErrorRecord::new(
                        failure.item_id,
                        error_type,
                        failure.message.clone(),
                        failure.stage,
                        &policy,
                        now,
                    )
                });
            record.clone()
        };

        tracing::warn!(
            item_id = record.item_id,
            stage = %record.stage,
            error_type = %record.error_type,
            retry_count = record.retry_count,
            action = ?record.action,
            error = %record.message,
            "Failure recorded"
        );

        let patch = ItemPatch::new(record.item_id)
            .outcome(Outcome::Error)
            .failure(reason_for(&record, now));
        if let Err(e) = self.store.update(patch).await {
            tracing::error!(item_id = record.item_id, error = %e, "Failed to persist failure");
        }
        record
    }

    /// Rebuild open records for items the store still marks `error`.
    ///
    /// Records live in memory, so a restarted worker calls this before the
    /// first sweep. Records already open are kept as they are.
    pub async fn restore(&self, now: Timestamp) -> Result<usize, StoreError> {
        let failed = self
            .store
            .query(&ItemQuery {
                outcomes: vec![Outcome::Error],
                ..ItemQuery::default()
            })
            .await?;

        let mut records = self.lock();
        let mut restored = 0;
        for item in &failed {
            let record = self.record_from_item(item, now);
            if let Entry::Vacant(slot) = records.entry(item.id) {
                slot.insert(record);
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "Error records restored from store");
        }
        Ok(restored)
    }

    fn record_from_item(&self, item: &ItemRecord, now: Timestamp) -> ErrorRecord {
        let Some(reason) = &item.failure else {
            let error_type = ErrorType::Unknown;
            let mut record = ErrorRecord::new(
                item.id,
                error_type,
                "failure reason missing",
                item.stage,
                &self.policy_for(error_type),
                item.updated_at,
            );
            record.next_retry_at = Some(now);
            return record;
        };
        let error_type = reason
            .error_type
            .unwrap_or_else(|| self.classifier.classify(&reason.message));
        let policy = self.policy_for(error_type);
        let mut record = ErrorRecord::new(
            item.id,
            error_type,
            reason.message.clone(),
            reason.stage,
            &policy,
            reason.recorded_at,
        );
        record.retry_count = reason.retry_count;
        // A retry that was in flight when the worker stopped is due at once.
        record.next_retry_at = Some(reason.next_retry_at.unwrap_or(now));
        record
    }

    /// Close the item's record. Returns whether one was open.
    pub fn resolve(&self, item_id: DbId) -> bool {
        let removed = self.lock().remove(&item_id).is_some();
        if removed {
            tracing::debug!(item_id, "Error record resolved");
        }
        removed
    }

    // -- sweep ---

    /// Run the sweep every `sweep_interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            zombie_threshold_secs = self.config.zombie_threshold.as_secs(),
            "Recovery sweep started"
        );
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Recovery sweep stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if report.dispatched > 0 || report.reaped > 0 || report.errors > 0 {
                        tracing::info!(
                            dispatched = report.dispatched,
                            retried = report.retried,
                            skipped = report.skipped,
                            escalated = report.escalated,
                            exhausted = report.exhausted,
                            reaped = report.reaped,
                            errors = report.errors,
                            "Recovery sweep finished"
                        );
                    } else {
                        tracing::debug!("Recovery sweep: nothing due");
                    }
                }
            }
        }
    }

    /// Dispatch every due record, then reap zombies. Never fails as a whole.
    pub async fn sweep(&self, now: Timestamp) -> SweepReport {
        let mut report = SweepReport::default();
        let due: Vec<DbId> = {
            let records = self.lock();
            let mut ids: Vec<_> = records.values().filter(|r| r.is_due(now)).map(|r| r.item_id).collect();
            ids.sort_unstable();
            ids
        };

        for item_id in due {
            report.dispatched += 1;
            match self.dispatch(item_id, now).await {
                Ok(DispatchOutcome::Retried(_)) => report.retried += 1,
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Ok(DispatchOutcome::Escalated) => report.escalated += 1,
                Ok(DispatchOutcome::Exhausted) => report.exhausted += 1,
                Ok(DispatchOutcome::Missing) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(item_id, error = %e, "Recovery dispatch failed");
                }
            }
        }

        match self.reap_zombies(now).await {
            Ok(reaped) => report.reaped = reaped,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Zombie reaping failed");
            }
        }
        report
    }

    /// Apply the recovery action of one record.
    ///
    /// Every dispatch counts against the retry budget. Retry actions leave
    /// the record open but disarmed until the item fails again or succeeds.
    pub async fn dispatch(&self, item_id: DbId, now: Timestamp) -> Result<DispatchOutcome, StoreError> {
        let record = {
            let mut records = self.lock();
            let Some(record) = records.get_mut(&item_id) else {
                return Ok(DispatchOutcome::Missing);
            };
            record.retry_count += 1;
            record.next_retry_at = None;
            record.clone()
        };

        let result = self.apply(&record, now).await;
        match &result {
            Ok(outcome) => tracing::info!(
                item_id,
                error_type = %record.error_type,
                retry_count = record.retry_count,
                outcome = ?outcome,
                "Recovery dispatched"
            ),
            Err(_) => self.rearm(&record, now),
        }
        result
    }

    async fn apply(&self, record: &ErrorRecord, now: Timestamp) -> Result<DispatchOutcome, StoreError> {
        let Some(item) = self.store.find_by_id(record.item_id).await? else {
            self.resolve(record.item_id);
            return Ok(DispatchOutcome::Missing);
        };

        if record.is_exhausted() {
            self.finish(record, Outcome::PermanentFailure, now).await?;
            self.escalate("Item permanently failed", record).await;
            return Ok(DispatchOutcome::Exhausted);
        }

        match record.action {
            RecoveryAction::Retry | RecoveryAction::WaitAndRetry => {
                let stage = self.restart_stage(record, &item).await;
                let mut patch = ItemPatch::new(item.id)
                    .stage(stage)
                    .outcome(Outcome::Pending)
                    .clear_failure();
                // Restarting before the archive stage rebuilds it from scratch.
                if stage == ItemStage::Classify {
                    artifacts::discard_item_artifacts(&item).await;
                    patch = patch.clear_artifacts();
                }
                self.store.update(patch).await?;
                Ok(DispatchOutcome::Retried(stage))
            }
            RecoveryAction::CleanupAndRetry => {
                artifacts::discard_item_artifacts(&item).await;
                self.store
                    .update(
                        ItemPatch::new(item.id)
                            .stage(ItemStage::Classify)
                            .outcome(Outcome::Pending)
                            .clear_artifacts()
                            .clear_failure(),
                    )
                    .await?;
                Ok(DispatchOutcome::Retried(ItemStage::Classify))
            }
            RecoveryAction::Skip => {
                self.finish(record, Outcome::Skipped, now).await?;
                Ok(DispatchOutcome::Skipped)
            }
            RecoveryAction::ManualIntervention => {
                self.finish(record, Outcome::ManualIntervention, now).await?;
                self.escalate("Item needs manual intervention", record).await;
                Ok(DispatchOutcome::Escalated)
            }
        }
    }

    /// `UploadQueue` when only the upload failed and the archive survives,
    /// otherwise `Classify`.
    async fn restart_stage(&self, record: &ErrorRecord, item: &ItemRecord) -> ItemStage {
        if record.error_type == ErrorType::UploadFailed && item.stage.has_archive() {
            if let Some(archive) = &item.archive_path {
                if tokio::fs::try_exists(archive).await.unwrap_or(false) {
                    return ItemStage::UploadQueue;
                }
            }
        }
        ItemStage::Classify
    }

    /// Close the record with a terminal outcome.
    async fn finish(&self, record: &ErrorRecord, outcome: Outcome, now: Timestamp) -> Result<(), StoreError> {
        self.store
            .update(
                ItemPatch::new(record.item_id)
                    .outcome(outcome)
                    .failure(reason_for(record, now)),
            )
            .await?;
        self.resolve(record.item_id);
        Ok(())
    }

    fn rearm(&self, record: &ErrorRecord, now: Timestamp) {
        let policy = self.policy_for(record.error_type);
        if let Some(open) = self.lock().get_mut(&record.item_id) {
            open.next_retry_at = Some(now + to_chrono(policy.delay_for(open.retry_count)));
        }
    }

    async fn escalate(&self, subject: &str, record: &ErrorRecord) {
        let payload = serde_json::json!({
            "item_id": record.item_id,
            "error_type": record.error_type,
            "stage": record.stage,
            "message": record.message,
            "retry_count": record.retry_count,
            "max_retries": record.max_retries,
        });
        if !self.notifier.send(subject, &payload).await {
            tracing::warn!(item_id = record.item_id, subject, "Escalation notification not delivered");
        }
    }

    // -- zombies ---

    /// Reset in-progress items that stopped moving without an open record.
    pub async fn reap_zombies(&self, now: Timestamp) -> Result<usize, StoreError> {
        let cutoff = now - to_chrono(self.config.zombie_threshold);
        let stale = self
            .store
            .query(&ItemQuery {
                stages: ItemStage::IN_PROGRESS.to_vec(),
                outcomes: vec![Outcome::Pending],
                updated_before: Some(cutoff),
                ..ItemQuery::default()
            })
            .await?;

        let open: HashSet<DbId> = self.lock().keys().copied().collect();
        let mut patches = Vec::new();
        for item in stale.iter().filter(|i| !open.contains(&i.id)) {
            tracing::warn!(
                item_id = item.id,
                stage = %item.stage,
                updated_at = %item.updated_at,
                "Reaping zombie item"
            );
            artifacts::discard_item_artifacts(item).await;
            patches.push(
                ItemPatch::new(item.id)
                    .stage(ItemStage::Classify)
                    .clear_artifacts()
                    .failure(FailureReason {
                        error_type: None,
                        message: ZOMBIE_REAPED.to_string(),
                        stage: item.stage,
                        retry_count: 0,
                        max_retries: 0,
                        next_retry_at: None,
                        recorded_at: now,
                    }),
            );
        }
        if patches.is_empty() {
            return Ok(0);
        }
        let reaped = self.store.bulk_update(&patches).await?;
        Ok(reaped as usize)
    }
}

fn reason_for(record: &ErrorRecord, now: Timestamp) -> FailureReason {
    FailureReason {
        error_type: Some(record.error_type),
        message: record.message.clone(),
        stage: record.stage,
        retry_count: record.retry_count,
        max_retries: record.max_retries,
        next_retry_at: record.next_retry_at,
        recorded_at: now,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use stowage_core::item::{ClassifyTag, ItemType, NewItem};
    use stowage_core::store::MemoryItemStore;

    #[derive(Default)]
    struct Captured(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Captured {
        async fn send(&self, subject: &str, _payload: &serde_json::Value) -> bool {
            self.0.lock().unwrap().push(subject.to_string());
            true
        }
    }

    struct Fixture {
        store: Arc<MemoryItemStore>,
        notes: Arc<Captured>,
        engine: RecoveryEngine,
    }

    fn fixture(config: RecoveryConfig) -> Fixture {
        let store = Arc::new(MemoryItemStore::new());
        let notes = Arc::new(Captured::default());
        let engine = RecoveryEngine::new(config, store.clone(), notes.clone());
        Fixture { store, notes, engine }
    }

    async fn item(store: &MemoryItemStore, name: &str) -> ItemRecord {
        store
            .create(NewItem {
                source_path: format!("/src/{name}").into(),
                item_type: ItemType::File,
                size_bytes: 10,
                tag: ClassifyTag::NormalFile,
            })
            .await
            .unwrap()
    }

    fn failure(item_id: DbId, error_type: Option<ErrorType>, message: &str) -> StageFailure {
        StageFailure {
            item_id,
            stage: ItemStage::Zip,
            error_type,
            message: message.to_string(),
        }
    }

    // -- record_failure ---

    #[tokio::test]
    async fn structured_type_beats_classifier() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let rec = f
            .engine
            .record_failure(&failure(it.id, Some(ErrorType::CompressionFailed), "disk full"))
            .await;
        assert_eq!(rec.error_type, ErrorType::CompressionFailed);

        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Error);
        assert_eq!(stored.failure.unwrap().error_type, Some(ErrorType::CompressionFailed));
    }

    #[tokio::test]
    async fn unstructured_failure_is_classified_and_custom_classifier_applies() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let rec = f.engine.record_failure(&failure(it.id, None, "connection reset")).await;
        assert_eq!(rec.error_type, ErrorType::NetworkError);

        let engine = RecoveryEngine::new(RecoveryConfig::default(), f.store.clone(), f.notes.clone())
            .with_classifier(ErrorClassifier::from_fn(|_| ErrorType::StoreError));
        let rec = engine.record_failure(&failure(it.id, None, "connection reset")).await;
        assert_eq!(rec.error_type, ErrorType::StoreError);
    }

    #[tokio::test]
    async fn repeat_failure_keeps_single_record_and_retry_count() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::StoreError), "x"), now)
            .await;
        f.engine.dispatch(it.id, now + chrono::Duration::hours(1)).await.unwrap();
        let rec = f
            .engine
            .record_failure_at(&failure(it.id, Some(ErrorType::StoreError), "y"), now)
            .await;
        assert_eq!(f.engine.open_records().len(), 1);
        assert_eq!(rec.retry_count, 1);
        assert_eq!(rec.message, "y");
        assert_eq!(rec.next_retry_at, Some(now + chrono::Duration::seconds(30)));
    }

    // -- scheduling ---

    #[tokio::test]
    async fn future_records_are_not_dispatched_early() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::UploadFailed), "errno 5"), now)
            .await;

        let early = f.engine.sweep(now + chrono::Duration::seconds(299)).await;
        assert_eq!(early.dispatched, 0);
        assert_eq!(f.engine.get(it.id).unwrap().retry_count, 0);

        let due = f.engine.sweep(now + chrono::Duration::seconds(300)).await;
        assert_eq!(due.dispatched, 1);
        assert_eq!(due.retried, 1);

        // Disarmed until the item fails again.
        let again = f.engine.sweep(now + chrono::Duration::days(2)).await;
        assert_eq!(again.dispatched, 0);
        assert_eq!(f.engine.get(it.id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn retry_resets_item_to_classify_when_archive_is_gone() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        f.store
            .update(
                ItemPatch::new(it.id)
                    .stage(ItemStage::UploadQueue)
                    .archive("/nowhere/a.tar.gz".into(), 5),
            )
            .await
            .unwrap();
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::UploadFailed), "errno 5"), now)
            .await;
        let outcome = f.engine.dispatch(it.id, now).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Retried(ItemStage::Classify));

        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, ItemStage::Classify);
        assert_eq!(stored.outcome, Outcome::Pending);
        assert!(stored.failure.is_none());
    }

    #[tokio::test]
    async fn upload_retry_keeps_existing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar.gz");
        std::fs::write(&archive, b"x").unwrap();

        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        f.store
            .update(ItemPatch::new(it.id).stage(ItemStage::UploadQueue).archive(archive.clone(), 1))
            .await
            .unwrap();
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::UploadFailed), "errno 5"), now)
            .await;
        assert_eq!(
            f.engine.dispatch(it.id, now).await.unwrap(),
            DispatchOutcome::Retried(ItemStage::UploadQueue)
        );
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn cleanup_and_retry_removes_partial_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = dir.path().join("archives/7");
        std::fs::create_dir_all(&archive_dir).unwrap();
        let archive = archive_dir.join("a.tar.gz");
        std::fs::write(&archive, b"partial").unwrap();

        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        f.store
            .update(ItemPatch::new(it.id).stage(ItemStage::ZipHash).archive(archive.clone(), 7))
            .await
            .unwrap();
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::CompressionFailed), "bad"), now)
            .await;
        f.engine.dispatch(it.id, now).await.unwrap();

        assert!(!archive.exists());
        assert!(!archive_dir.exists());
        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, ItemStage::Classify);
        assert!(stored.archive_path.is_none());
    }

    #[tokio::test]
    async fn retry_from_scratch_discards_stale_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = dir.path().join("archives/3");
        std::fs::create_dir_all(&archive_dir).unwrap();
        let archive = archive_dir.join("a.tar.gz");
        std::fs::write(&archive, b"stale").unwrap();

        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        f.store
            .update(ItemPatch::new(it.id).stage(ItemStage::ZipHash).archive(archive.clone(), 5))
            .await
            .unwrap();
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::StoreError), "pool closed"), now)
            .await;
        assert_eq!(
            f.engine.dispatch(it.id, now).await.unwrap(),
            DispatchOutcome::Retried(ItemStage::Classify)
        );

        assert!(!archive.exists());
        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert!(stored.archive_path.is_none());
        assert!(stored.archive_size.is_none());
    }

    // -- restore ---

    #[tokio::test]
    async fn open_failures_survive_an_engine_restart() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let healthy = item(&f.store, "b").await;
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::NetworkError), "timeout"), now)
            .await;
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::NetworkError), "timeout"), now)
            .await;

        let restarted = RecoveryEngine::new(RecoveryConfig::default(), f.store.clone(), f.notes.clone());
        assert!(restarted.get(it.id).is_none());
        assert_eq!(restarted.restore(now).await.unwrap(), 1);
        assert!(restarted.get(healthy.id).is_none());

        let record = restarted.get(it.id).unwrap();
        assert_eq!(record.error_type, ErrorType::NetworkError);
        assert_eq!(record.stage, ItemStage::Zip);
        assert_eq!(record.retry_count, f.engine.get(it.id).unwrap().retry_count);
        assert_eq!(record.next_retry_at, f.engine.get(it.id).unwrap().next_retry_at);
        assert!(!record.is_due(now));

        // Restoring twice keeps the live record.
        assert_eq!(restarted.restore(now).await.unwrap(), 0);

        let report = restarted.sweep(now + chrono::Duration::days(2)).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.retried, 1);
        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, ItemStage::Classify);
        assert_eq!(stored.outcome, Outcome::Pending);
    }

    #[tokio::test]
    async fn restore_rearms_retry_interrupted_mid_dispatch() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let now = Utc::now();
        f.store
            .update(ItemPatch::new(it.id).outcome(Outcome::Error).failure(FailureReason {
                error_type: None,
                message: "connection refused".into(),
                stage: ItemStage::UploadQueue,
                retry_count: 1,
                max_retries: 5,
                next_retry_at: None,
                recorded_at: now,
            }))
            .await
            .unwrap();

        let restarted = RecoveryEngine::new(RecoveryConfig::default(), f.store.clone(), f.notes.clone());
        restarted.restore(now).await.unwrap();
        let record = restarted.get(it.id).unwrap();
        assert_eq!(record.error_type, ErrorType::NetworkError);
        assert_eq!(record.retry_count, 1);
        assert!(record.is_due(now));
    }

    // -- terminal actions ---

    #[tokio::test]
    async fn missing_file_is_skipped_and_record_closed() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::FileNotFound), "gone"), now)
            .await;
        let report = f.engine.sweep(now).await;
        assert_eq!(report.skipped, 1);
        assert!(f.engine.get(it.id).is_none());
        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn permission_denied_escalates() {
        let f = fixture(RecoveryConfig::default());
        let it = item(&f.store, "a").await;
        let now = Utc::now();
        f.engine
            .record_failure_at(&failure(it.id, Some(ErrorType::PermissionDenied), "eacces"), now)
            .await;
        assert_eq!(f.engine.dispatch(it.id, now).await.unwrap(), DispatchOutcome::Escalated);
        assert_eq!(f.notes.0.lock().unwrap().len(), 1);
        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::ManualIntervention);
    }

    #[tokio::test]
    async fn exceeding_budget_is_permanent_even_for_retry() {
        let mut config = RecoveryConfig::default();
        config
            .policy_overrides
            .insert(ErrorType::NetworkError, RetryPolicy::new(2, 0, RecoveryAction::Retry));
        let f = fixture(config);
        let it = item(&f.store, "a").await;
        let now = Utc::now();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            f.engine
                .record_failure_at(&failure(it.id, Some(ErrorType::NetworkError), "timeout"), now)
                .await;
            outcomes.push(f.engine.dispatch(it.id, now).await.unwrap());
        }
        assert_matches!(outcomes[0], DispatchOutcome::Retried(_));
        assert_matches!(outcomes[1], DispatchOutcome::Retried(_));
        assert_eq!(outcomes[2], DispatchOutcome::Exhausted);
        assert!(f.engine.get(it.id).is_none());
        assert_eq!(f.notes.0.lock().unwrap().as_slice(), ["Item permanently failed"]);
        let stored = f.store.find_by_id(it.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::PermanentFailure);
        assert_eq!(stored.failure.unwrap().retry_count, 3);
    }

    // -- zombies ---

    #[tokio::test]
    async fn stale_in_progress_items_without_record_are_reaped() {
        let f = fixture(RecoveryConfig::default());
        let zombie = item(&f.store, "zombie").await;
        let failing = item(&f.store, "failing").await;
        let fresh = item(&f.store, "fresh").await;
        for id in [zombie.id, failing.id, fresh.id] {
            f.store.update(ItemPatch::new(id).stage(ItemStage::Unzip)).await.unwrap();
        }
        let now = Utc::now();
        let old = now - chrono::Duration::hours(25);
        f.store.set_updated_at(zombie.id, old).unwrap();
        f.store.set_updated_at(failing.id, old).unwrap();
        // An open record protects the item even though it is stale.
        f.engine
            .record_failure_at(&failure(failing.id, Some(ErrorType::UploadFailed), "errno 1"), now)
            .await;
        f.store
            .update(ItemPatch::new(failing.id).outcome(Outcome::Pending))
            .await
            .unwrap();
        f.store.set_updated_at(failing.id, old).unwrap();

        assert_eq!(f.engine.reap_zombies(now).await.unwrap(), 1);

        let reaped = f.store.find_by_id(zombie.id).await.unwrap().unwrap();
        assert_eq!(reaped.stage, ItemStage::Classify);
        let reason = reaped.failure.unwrap();
        assert_eq!(reason.message, ZOMBIE_REAPED);
        assert_eq!(reason.error_type, None);
        assert_eq!(reason.stage, ItemStage::Unzip);

        let untouched = f.store.find_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(untouched.stage, ItemStage::Unzip);
    }
}
