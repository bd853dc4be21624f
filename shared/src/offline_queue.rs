//! Durable queue of property creations that could not reach the backend.
//!
//! Entries are kept in insertion order under one KV key. `drain` replays
//! them; an entry leaves the queue only when its replay succeeds, and each
//! removal is written back before the next entry is tried so a crash
//! mid-drain never resubmits an already-created listing. A removal that
//! storage refused is remembered in memory and retried on the next write;
//! until then the entry is hidden from every read.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvKey, PropertySubmitter};
use crate::config::{CoreConfig, QueueConfig};
use crate::model::{PendingSubmission, PropertyId, PropertySubmission, SubmissionId, UnixTimeMs};
use crate::offline_store::{load_snapshot, save_snapshot, StoreError};
use crate::{AppError, ErrorKind};

const SNAPSHOT_KIND: &str = "pending_submissions";
const QUEUE_KEY: &str = "pending";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("offline queue is full: {count} entries, max {max}")]
    Full { count: usize, max: usize },

    #[error("submission rejected: {0}")]
    Invalid(AppError),

    #[error("queue storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { count, max } => AppError::new(
                ErrorKind::QuotaExceeded,
                format!("{count} listings are already waiting to upload"),
            )
            .with_context("max_entries", max.to_string()),
            QueueError::Invalid(app) => app,
            QueueError::Store(store) => store.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct QueueSnapshot {
    entries: Vec<PendingSubmission>,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: Vec<(SubmissionId, PropertyId)>,
    pub failed: Vec<SubmissionId>,
    pub remaining: usize,
}

impl DrainReport {
    pub fn is_noop(&self) -> bool {
        self.attempted == 0
    }

    pub fn all_synced(&self) -> bool {
        self.failed.is_empty() && self.remaining == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Created(PropertyId),
    /// Backend unreachable; stored for the next drain.
    Queued(SubmissionId),
}

pub struct OfflineSubmissionQueue {
    kv: Arc<dyn KeyValueStore>,
    config: QueueConfig,
    // Single writer: enqueue and drain never interleave. Holds ids already
    // created on the backend whose removal has not been stored yet.
    unflushed: Mutex<HashSet<SubmissionId>>,
}

impl OfflineSubmissionQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: QueueConfig) -> Self {
        Self {
            kv,
            config,
            unflushed: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(kv: Arc<dyn KeyValueStore>, config: &CoreConfig) -> Self {
        Self::new(kv, config.queue.clone())
    }

    fn key() -> Result<KvKey, StoreError> {
        Ok(KvKey::new(KeyNamespace::OfflineQueue, QUEUE_KEY)?)
    }

    async fn load(
        &self,
        unflushed: &HashSet<SubmissionId>,
    ) -> Result<Vec<PendingSubmission>, StoreError> {
        let snapshot: Option<QueueSnapshot> =
            load_snapshot(self.kv.as_ref(), &Self::key()?, SNAPSHOT_KIND).await?;
        let mut entries = snapshot.map(|s| s.entries).unwrap_or_default();
        entries.retain(|e| !unflushed.contains(&e.id));
        Ok(entries)
    }

    /// Writes back a list built from `load`, which already excludes every
    /// unflushed id, so a successful write flushes them all.
    async fn flush(
        &self,
        unflushed: &mut HashSet<SubmissionId>,
        entries: Vec<PendingSubmission>,
    ) -> Result<(), StoreError> {
        self.store(entries).await?;
        unflushed.clear();
        Ok(())
    }

    async fn store(&self, entries: Vec<PendingSubmission>) -> Result<(), StoreError> {
        let key = Self::key()?;
        if entries.is_empty() {
            self.kv.delete(&key).await?;
            return Ok(());
        }
        save_snapshot(self.kv.as_ref(), &key, SNAPSHOT_KIND, &QueueSnapshot { entries }).await
    }

    /// Appends a creation payload for later replay.
    #[instrument(skip(self, payload), fields(title = %payload.title))]
    pub async fn enqueue(&self, payload: PropertySubmission) -> Result<SubmissionId, QueueError> {
        payload.validate().map_err(QueueError::Invalid)?;

        let mut unflushed = self.unflushed.lock().await;
        let mut entries = self.load(&unflushed).await?;
        if entries.len() >= self.config.max_entries {
            warn!(count = entries.len(), max = self.config.max_entries, "offline queue full");
            return Err(QueueError::Full {
                count: entries.len(),
                max: self.config.max_entries,
            });
        }

        let entry = PendingSubmission::new(payload, UnixTimeMs::now());
        let id = entry.id.clone();
        entries.push(entry);
        let depth = entries.len();
        self.flush(&mut unflushed, entries).await?;

        info!(submission_id = %id, depth, "submission queued for sync");
        Ok(id)
    }

    /// Replays every pending entry in order.
    ///
    /// Successful entries are removed; failed ones stay as they were. Errors
    /// are logged, never returned.
    #[instrument(skip(self, submitter))]
    pub async fn drain(&self, submitter: &dyn PropertySubmitter) -> DrainReport {
        let mut unflushed = self.unflushed.lock().await;

        let mut entries = match self.load(&unflushed).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "offline queue unreadable, skipping drain");
                return DrainReport::default();
            }
        };
        if !unflushed.is_empty() {
            if let Err(e) = self.flush(&mut unflushed, entries.clone()).await {
                error!(error = %e, pending_removals = unflushed.len(), "offline queue still not writable");
            }
        }
        if entries.is_empty() {
            debug!("offline queue empty");
            return DrainReport::default();
        }

        let mut report = DrainReport {
            attempted: entries.len(),
            ..DrainReport::default()
        };

        let mut index = 0;
        while index < entries.len() {
            let result = submitter.create_property(&entries[index].payload).await;
            match result {
                Ok(property_id) => {
                    let synced = entries.remove(index);
                    debug!(submission_id = %synced.id, property_id = %property_id, "queued submission synced");
                    unflushed.insert(synced.id.clone());
                    report.synced.push((synced.id, property_id));
                    if let Err(e) = self.flush(&mut unflushed, entries.clone()).await {
                        error!(error = %e, "failed to persist offline queue after sync");
                    }
                }
                Err(e) => {
                    let id = &entries[index].id;
                    warn!(submission_id = %id, error = %e, retryable = e.is_retryable(), "queued submission failed");
                    report.failed.push(id.clone());
                    index += 1;
                }
            }
        }

        report.remaining = entries.len();
        info!(
            attempted = report.attempted,
            synced = report.synced.len(),
            failed = report.failed.len(),
            "offline queue drained"
        );
        report
    }

    /// Creation flow: submit now, or queue when the backend is unreachable.
    #[instrument(skip(self, submitter, payload), fields(title = %payload.title))]
    pub async fn submit(
        &self,
        submitter: &dyn PropertySubmitter,
        payload: PropertySubmission,
    ) -> Result<SubmissionOutcome, AppError> {
        payload.validate()?;

        match submitter.create_property(&payload).await {
            Ok(property_id) => {
                info!(property_id = %property_id, "property created");
                Ok(SubmissionOutcome::Created(property_id))
            }
            Err(e) if e.is_connectivity() => {
                debug!(error = %e, "backend unreachable, queueing submission");
                let id = self.enqueue(payload).await?;
                Ok(SubmissionOutcome::Queued(id))
            }
            Err(e) => {
                warn!(error = %e, "property creation rejected");
                Err(e.into())
            }
        }
    }

    /// Entries waiting for sync, oldest first. Unreadable storage reads as
    /// empty.
    pub async fn pending(&self) -> Vec<PendingSubmission> {
        let unflushed = self.unflushed.lock().await;
        match self.load(&unflushed).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "offline queue unreadable");
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpError, KvError, MemoryKv, StorageErrorCode};
    use crate::model::fixtures::sample_submission;
    use crate::model::SyncStatus;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fails creation for the listed titles.
    #[derive(Default)]
    struct FakeSubmitter {
        failing: std::sync::Mutex<HashSet<String>>,
        offline: AtomicBool,
        reject: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeSubmitter {
        fn failing(titles: &[&str]) -> Self {
            let s = Self::default();
            *s.failing.lock().unwrap() = titles.iter().map(|t| t.to_string()).collect();
            s
        }
    }

    #[async_trait]
    impl PropertySubmitter for FakeSubmitter {
        async fn create_property(&self, s: &PropertySubmission) -> Result<PropertyId, HttpError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(HttpError::Offline);
            }
            if self.reject.load(Ordering::SeqCst) {
                return Err(HttpError::status(422, "invalid address"));
            }
            if self.failing.lock().unwrap().contains(&s.title) {
                return Err(HttpError::status(503, "unavailable"));
            }
            Ok(PropertyId::new(format!("srv-{n}")))
        }
    }

    // Failure-injectable storage wrapper
    struct FailableKv {
        inner: MemoryKv,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl FailableKv {
        fn new() -> Self {
            Self {
                inner: MemoryKv::new(),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                fail_deletes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for FailableKv {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::IoError, "Injected failure"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::DiskFull, "Injected failure"));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::PermissionDenied, "Injected failure"));
            }
            self.inner.delete(key).await
        }
    }

    fn queue() -> OfflineSubmissionQueue {
        OfflineSubmissionQueue::new(Arc::new(MemoryKv::new()), QueueConfig::default())
    }

    #[tokio::test]
    async fn enqueue_preserves_order_and_status() {
        let q = queue();
        let a = q.enqueue(sample_submission("one")).await.unwrap();
        let b = q.enqueue(sample_submission("two")).await.unwrap();

        let pending = q.pending().await;
        assert_eq!(pending.iter().map(|p| p.id.clone()).collect::<Vec<_>>(), vec![a, b]);
        assert!(pending.iter().all(|p| p.status == SyncStatus::PendingSync));
    }

    #[tokio::test]
    async fn drain_removes_only_successes() {
        let q = queue();
        let first = q.enqueue(sample_submission("one")).await.unwrap();
        let second = q.enqueue(sample_submission("two")).await.unwrap();
        let third = q.enqueue(sample_submission("three")).await.unwrap();

        let submitter = FakeSubmitter::failing(&["two"]);
        let report = q.drain(&submitter).await;

        assert_eq!(report.attempted, 3);
        assert_eq!(
            report.synced.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(),
            vec![first, third]
        );
        assert_eq!(report.failed, vec![second.clone()]);
        assert_eq!(report.remaining, 1);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 3);

        let pending = q.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
        assert_eq!(pending[0].status, SyncStatus::PendingSync);
        assert_eq!(pending[0].payload.title, "two");
    }

    #[tokio::test]
    async fn drain_of_empty_queue_is_noop() {
        let q = queue();
        let submitter = FakeSubmitter::default();
        let report = q.drain(&submitter).await;
        assert!(report.is_noop());
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fully_drained_queue_deletes_its_key() {
        let kv = Arc::new(MemoryKv::new());
        let q = OfflineSubmissionQueue::new(kv.clone(), QueueConfig::default());
        q.enqueue(sample_submission("one")).await.unwrap();

        let report = q.drain(&FakeSubmitter::default()).await;
        assert!(report.all_synced());
        let key = KvKey::new(KeyNamespace::OfflineQueue, "pending").unwrap();
        assert_eq!(kv.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_storage_yields_empty_report() {
        let kv = Arc::new(FailableKv::new());
        let q = OfflineSubmissionQueue::new(kv.clone(), QueueConfig::default());
        q.enqueue(sample_submission("one")).await.unwrap();

        kv.fail_reads.store(true, Ordering::SeqCst);
        let submitter = FakeSubmitter::default();
        assert_eq!(q.drain(&submitter).await, DrainReport::default());
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
        assert!(q.pending().await.is_empty());
    }

    #[tokio::test]
    async fn created_entry_is_not_resubmitted_when_removal_fails() {
        let kv = Arc::new(FailableKv::new());
        let q = OfflineSubmissionQueue::new(kv.clone(), QueueConfig::default());
        q.enqueue(sample_submission("one")).await.unwrap();

        kv.fail_deletes.store(true, Ordering::SeqCst);
        let submitter = FakeSubmitter::default();
        assert_eq!(q.drain(&submitter).await.synced.len(), 1);
        assert!(q.is_empty().await);

        let again = q.drain(&submitter).await;
        assert!(again.is_noop());
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);

        kv.fail_deletes.store(false, Ordering::SeqCst);
        assert!(q.drain(&submitter).await.is_noop());
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
        let key = KvKey::new(KeyNamespace::OfflineQueue, "pending").unwrap();
        assert_eq!(kv.inner.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn enqueue_after_failed_removal_does_not_revive_created_entry() {
        let kv = Arc::new(FailableKv::new());
        let q = OfflineSubmissionQueue::new(kv.clone(), QueueConfig::default());
        q.enqueue(sample_submission("one")).await.unwrap();

        kv.fail_deletes.store(true, Ordering::SeqCst);
        let submitter = FakeSubmitter::default();
        q.drain(&submitter).await;

        q.enqueue(sample_submission("two")).await.unwrap();
        let pending = q.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.title, "two");

        let report = q.drain(&submitter).await;
        assert_eq!(report.attempted, 1);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enqueue_surfaces_write_failure() {
        let kv = Arc::new(FailableKv::new());
        let q = OfflineSubmissionQueue::new(kv.clone(), QueueConfig::default());
        kv.fail_writes.store(true, Ordering::SeqCst);

        let err = q.enqueue(sample_submission("one")).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::Kv(_))));
        assert_eq!(AppError::from(err).kind, ErrorKind::Storage);
    }

    #[tokio::test]
    async fn enqueue_refuses_beyond_capacity() {
        let q = OfflineSubmissionQueue::new(Arc::new(MemoryKv::new()), QueueConfig { max_entries: 2 });
        q.enqueue(sample_submission("one")).await.unwrap();
        q.enqueue(sample_submission("two")).await.unwrap();

        let err = q.enqueue(sample_submission("three")).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { count: 2, max: 2 }));
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_payload() {
        let q = queue();
        let err = q.enqueue(sample_submission("")).await.unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn submit_online_creates_directly() {
        let q = queue();
        let outcome = q.submit(&FakeSubmitter::default(), sample_submission("one")).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Created(_)));
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn submit_offline_queues() {
        let q = queue();
        let submitter = FakeSubmitter::default();
        submitter.offline.store(true, Ordering::SeqCst);

        let outcome = q.submit(&submitter, sample_submission("one")).await.unwrap();
        let SubmissionOutcome::Queued(id) = outcome else {
            panic!("expected queued outcome");
        };
        assert_eq!(q.pending().await[0].id, id);

        submitter.offline.store(false, Ordering::SeqCst);
        assert!(q.drain(&submitter).await.all_synced());
    }

    #[tokio::test]
    async fn submit_server_rejection_is_returned_not_queued() {
        let q = queue();
        let submitter = FakeSubmitter::default();
        submitter.reject.store(true, Ordering::SeqCst);

        let err = q.submit(&submitter, sample_submission("one")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(q.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_enqueues_are_not_lost() {
        let q = Arc::new(queue());
        let mut handles = Vec::new();
        for i in 0..10 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                q.enqueue(sample_submission(&format!("listing {i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(q.len().await, 10);
    }
}
