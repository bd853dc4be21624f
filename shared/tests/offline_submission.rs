use async_trait::async_trait;
use estate_shared::{
    CoreConfig, HttpError, ListingType, MediaAttachment, OfflineSubmissionQueue, PropertyId,
    PropertySubmission, PropertySubmitter, SqliteKv, SubmissionOutcome, SyncStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Backend {
    offline: AtomicBool,
    rejected_titles: Mutex<HashSet<String>>,
    created: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl PropertySubmitter for Backend {
    async fn create_property(&self, s: &PropertySubmission) -> Result<PropertyId, HttpError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(HttpError::ConnectionError {
                host: "admin-api.homefinder.app".into(),
                message: "network unreachable".into(),
            });
        }
        if self.rejected_titles.lock().unwrap().contains(&s.title) {
            return Err(HttpError::status(503, "upload service unavailable"));
        }
        self.created.lock().unwrap().push(s.title.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(PropertyId::new(format!("prop-{n}")))
    }
}

fn listing(title: &str) -> PropertySubmission {
    PropertySubmission {
        title: title.into(),
        description: None,
        price: 1_800.0,
        listing_type: ListingType::Rent,
        address: "4 Quay Street".into(),
        media: vec![MediaAttachment {
            uri: "file:///data/user/0/app/cache/tour.mp4".into(),
            mime_type: "video/mp4".into(),
            file_name: "tour.mp4".into(),
        }],
    }
}

#[tokio::test]
async fn offline_creations_survive_restart_and_drain_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("estate.db");
    let backend = Backend::default();
    backend.offline.store(true, Ordering::SeqCst);

    {
        let queue =
            OfflineSubmissionQueue::from_config(Arc::new(SqliteKv::open(&db).unwrap()), &CoreConfig::default());
        for title in ["first", "second", "third"] {
            let outcome = queue.submit(&backend, listing(title)).await.unwrap();
            assert!(matches!(outcome, SubmissionOutcome::Queued(_)));
        }
        assert_eq!(queue.len().await, 3);
    }

    // App restarted; connectivity back but the second upload keeps failing.
    let queue =
        OfflineSubmissionQueue::from_config(Arc::new(SqliteKv::open(&db).unwrap()), &CoreConfig::default());
    backend.offline.store(false, Ordering::SeqCst);
    backend.rejected_titles.lock().unwrap().insert("second".into());

    let report = queue.drain(&backend).await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.synced.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(*backend.created.lock().unwrap(), vec!["first", "third"]);

    let pending = queue.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload.title, "second");
    assert_eq!(pending[0].status, SyncStatus::PendingSync);

    backend.rejected_titles.lock().unwrap().clear();
    let report = queue.drain(&backend).await;
    assert!(report.all_synced());
    assert!(queue.is_empty().await);
    assert_eq!(*backend.created.lock().unwrap(), vec!["first", "third", "second"]);
}

#[tokio::test]
async fn online_submission_bypasses_the_queue() {
    let backend = Backend::default();
    let queue = OfflineSubmissionQueue::from_config(
        Arc::new(SqliteKv::open_in_memory().unwrap()),
        &CoreConfig::default(),
    );

    let outcome = queue.submit(&backend, listing("sea view")).await.unwrap();
    assert_eq!(outcome, SubmissionOutcome::Created(PropertyId::new("prop-0")));
    assert!(queue.is_empty().await);
    assert!(queue.drain(&backend).await.is_noop());
}
