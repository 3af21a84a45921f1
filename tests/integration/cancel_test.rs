//! Integration tests for job cancellation.

use std::time::Duration;

use mediaq_entity::{EventType, JobStatus};
use tokio::time::Instant;

use crate::helpers::{TestApp, scripted, scripted_slow_cancel};

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let app = TestApp::new(1);
    let blocker = app.submit(scripted("blocker", &["hang"])).await;
    app.wait_for_status(blocker, JobStatus::Running).await;

    let queued = app.submit(scripted("queued", &["ok"])).await;
    assert!(app.scheduler.cancel(queued).await.unwrap());

    let job = app.scheduler.status(queued).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.attempt, 0);
    assert!(job.completed_at.is_some());

    app.scheduler.cancel(blocker).await.unwrap();
    app.wait_for_status(blocker, JobStatus::Cancelled).await;
    assert_eq!(app.tally.log(), vec!["blocker"]);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let app = TestApp::new(1);
    let job_id = app.submit(scripted("long", &["hang"])).await;
    app.wait_for_status(job_id, JobStatus::Running).await;

    assert!(app.scheduler.cancel(job_id).await.unwrap());
    let job = app.wait_for_status(job_id, JobStatus::Cancelled).await;
    assert_eq!(job.attempt, 1);

    let events = app.scheduler.events(job_id, None);
    assert!(events.iter().all(|e| e.event_type != EventType::Completed));
    assert_eq!(
        events.last().map(|e| e.event_type),
        Some(EventType::Cancelled)
    );
    assert_eq!(app.scheduler.stats().await.metrics.cancelled, 1);

    // The worker is free again.
    let next = app.submit(scripted("next", &["ok"])).await;
    app.wait_for_status(next, JobStatus::Completed).await;
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_settles_before_slow_teardown() {
    let app = TestApp::new(1);
    let job_id = app
        .submit(scripted_slow_cancel("stubborn", &["hang"], 3_000))
        .await;
    app.wait_for_status(job_id, JobStatus::Running).await;

    let requested = Instant::now();
    assert!(app.scheduler.cancel(job_id).await.unwrap());
    app.wait_for_status_within(job_id, JobStatus::Cancelled, Duration::from_millis(1_500))
        .await;
    assert!(requested.elapsed() < Duration::from_millis(1_500));

    let events = app.scheduler.events(job_id, None);
    assert_eq!(
        events.last().map(|e| e.event_type),
        Some(EventType::Cancelled)
    );
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_retrying_job_stops_retries() {
    let mut config = crate::helpers::test_config(1);
    config.retry.initial_delay_ms = 5_000;
    config.retry.max_delay_ms = 5_000;
    let app = TestApp::with_config(config);

    let job_id = app
        .submit(scripted("backing-off", &["transient"]).with_max_retries(3))
        .await;
    app.wait_for_status(job_id, JobStatus::Retrying).await;

    assert!(app.scheduler.cancel(job_id).await.unwrap());
    let job = app.scheduler.status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.attempt, 1);
    assert_eq!(app.tally.runs(), 1);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_finished_job_returns_false() {
    let app = TestApp::new(1);
    let job_id = app.submit(scripted("done", &["ok"])).await;
    app.wait_for_status(job_id, JobStatus::Completed).await;

    assert!(!app.scheduler.cancel(job_id).await.unwrap());
    let job = app.scheduler.status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    app.scheduler.shutdown(true).await;
}
