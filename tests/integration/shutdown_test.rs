//! Integration tests for shutdown and restart recovery.

use std::sync::Arc;

use mediaq_core::ErrorKind;
use mediaq_entity::JobStatus;
use mediaq_worker::MemoryJobStore;

use crate::helpers::{TestApp, scripted, scripted_slow};

#[tokio::test]
async fn test_drain_lets_running_job_finish() {
    let app = TestApp::new(1);
    let running = app.submit(scripted_slow("running", &["ok"], 200)).await;
    app.wait_for_status(running, JobStatus::Running).await;
    let queued = app.submit(scripted("queued", &["ok"])).await;

    let report = app.scheduler.shutdown(true).await;
    assert!(report.drained);
    assert_eq!(report.force_cancelled, 0);
    assert_eq!(report.left_queued, 1);

    let job = app.scheduler.status(running).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let job = app.scheduler.status(queued).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
}

#[tokio::test]
async fn test_forced_shutdown_cancels_running_jobs() {
    let app = TestApp::new(2);
    let first = app.submit(scripted("hang-1", &["hang"])).await;
    let second = app.submit(scripted("hang-2", &["hang"])).await;
    app.wait_for_status(first, JobStatus::Running).await;
    app.wait_for_status(second, JobStatus::Running).await;

    let report = app.scheduler.shutdown(false).await;
    assert!(!report.drained);
    assert_eq!(report.force_cancelled, 2);

    for job_id in [first, second] {
        let job = app.scheduler.status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }
    assert_eq!(app.scheduler.stats().await.workers_busy, 0);
}

#[tokio::test]
async fn test_enqueue_after_shutdown_rejected() {
    let app = TestApp::new(1);
    app.scheduler.shutdown(true).await;

    assert!(!app.scheduler.is_accepting());
    let err = app
        .scheduler
        .enqueue(scripted("late", &["ok"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ShuttingDown);

    // A second shutdown is a no-op.
    let report = app.scheduler.shutdown(true).await;
    assert_eq!(report.left_queued, 0);
}

#[tokio::test]
async fn test_restore_readmits_unfinished_jobs() {
    let store = Arc::new(MemoryJobStore::new());

    let first = TestApp::with_store(1, Arc::clone(&store));
    let blocker = first.submit(scripted("blocker", &["hang"])).await;
    first.wait_for_status(blocker, JobStatus::Running).await;
    let pending = first.submit(scripted("survivor", &["ok"])).await;
    let report = first.scheduler.shutdown(false).await;
    assert_eq!(report.left_queued, 1);

    let mirrored = store.get(pending).expect("queued job should be mirrored");
    assert_eq!(mirrored.status, JobStatus::Queued);
    assert_eq!(
        store.get(blocker).map(|job| job.status),
        Some(JobStatus::Cancelled)
    );

    let second = TestApp::with_store(1, Arc::clone(&store));
    let restored = second.scheduler.restore(store.as_ref()).await.unwrap();
    assert_eq!(restored, 1);

    let job = second.wait_for_status(pending, JobStatus::Completed).await;
    assert_eq!(job.correlation_id, "survivor");
    assert_eq!(job.attempt, 1);
    assert_eq!(second.tally.log(), vec!["survivor"]);
    second.scheduler.shutdown(true).await;
}
