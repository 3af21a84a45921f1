//! Integration tests for enqueue validation, capacity, and idempotency.

use mediaq_core::{ErrorKind, JobId};
use mediaq_entity::{JobPriority, JobSpec, JobStatus};
use serde_json::json;

use crate::helpers::{SCRIPTED, TestApp, scripted, test_config};

#[tokio::test]
async fn test_capacity_exceeded_when_queue_full() {
    let mut config = test_config(1);
    config.queue.max_pending = 2;
    let app = TestApp::with_config(config);

    let blocker = app.submit(scripted("blocker", &["hang"])).await;
    app.wait_for_status(blocker, JobStatus::Running).await;
    app.submit(scripted("waiting-1", &["ok"])).await;
    app.submit(scripted("waiting-2", &["ok"])).await;

    let err = app
        .scheduler
        .enqueue(scripted("waiting-3", &["ok"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CapacityExceeded);
    assert_eq!(app.scheduler.list(Some(JobStatus::Queued)).await.len(), 2);

    let stats = app.scheduler.stats().await;
    assert_eq!(stats.metrics.rejected, 1);
    assert_eq!(stats.queue.pending, 2);
    app.scheduler.shutdown(false).await;
}

#[tokio::test]
async fn test_priority_lane_capacity() {
    let mut config = test_config(1);
    config.queue.capacity_per_priority = 1;
    let app = TestApp::with_config(config);

    let blocker = app.submit(scripted("blocker", &["hang"])).await;
    app.wait_for_status(blocker, JobStatus::Running).await;
    app.submit(scripted("low-1", &["ok"]).with_priority(JobPriority::Low))
        .await;

    let err = app
        .scheduler
        .enqueue(scripted("low-2", &["ok"]).with_priority(JobPriority::Low))
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::CapacityExceeded));

    // Other lanes are unaffected.
    app.submit(scripted("high-1", &["ok"]).with_priority(JobPriority::High))
        .await;
    app.scheduler.shutdown(false).await;
}

#[tokio::test]
async fn test_active_correlation_id_returns_existing_job() {
    let app = TestApp::new(1);
    let blocker = app.submit(scripted("blocker", &["hang"])).await;
    app.wait_for_status(blocker, JobStatus::Running).await;

    let first = app.submit(scripted("task-42", &["ok"])).await;
    let second = app.submit(scripted("task-42", &["ok"])).await;
    assert_eq!(first, second);
    assert_eq!(app.scheduler.stats().await.metrics.enqueued, 2);

    // Once the first job is finished, the correlation id may be reused.
    assert!(app.scheduler.cancel(first).await.unwrap());
    let third = app.submit(scripted("task-42", &["ok"])).await;
    assert_ne!(first, third);
    app.scheduler.shutdown(false).await;
}

#[tokio::test]
async fn test_invalid_specs_rejected() {
    let app = TestApp::new(1);

    let unknown_type = JobSpec::new("t-1", "teleport");
    let err = app.scheduler.enqueue(unknown_type).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSpec);

    let blank_correlation = scripted("", &["ok"]);
    let err = app.scheduler.enqueue(blank_correlation).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSpec);

    let bad_payload = JobSpec::new("t-2", SCRIPTED).with_payload(json!({ "outcomes": [] }));
    let err = app.scheduler.enqueue(bad_payload).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSpec);

    // retry.max_attempts is 4 in the test config.
    let too_many_retries = scripted("t-3", &["ok"]).with_max_retries(4);
    let err = app.scheduler.enqueue(too_many_retries).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSpec);
    let at_ceiling = scripted("t-4", &["ok"]).with_max_retries(3);
    assert!(app.scheduler.enqueue(at_ceiling).await.is_ok());

    assert_eq!(app.scheduler.stats().await.metrics.enqueued, 1);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_unknown_job_id_not_found() {
    let app = TestApp::new(1);
    let missing = JobId::new();

    let err = app.scheduler.status(missing).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    let err = app.scheduler.cancel(missing).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    let err = app.scheduler.progress(missing).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_spec_defaults_applied() {
    let app = TestApp::new(1);
    let job_id = app.submit(scripted("defaults", &["ok"])).await;
    let job = app.wait_for_status(job_id, JobStatus::Completed).await;

    assert_eq!(job.priority, JobPriority::Normal);
    assert_eq!(job.max_retries, 0);
    assert_eq!(job.dependency, "downloader");
    assert_eq!(job.job_type, SCRIPTED);
    app.scheduler.shutdown(true).await;
}
