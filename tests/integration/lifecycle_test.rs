//! Integration tests for dispatch order, retries, and failure handling.

use std::time::Duration;

use mediaq_core::ErrorKind;
use mediaq_core::config::breaker::BreakerSettings;
use mediaq_entity::job::FailureKind;
use mediaq_entity::{EventType, JobPriority, JobStatus};
use mediaq_worker::CircuitState;
use tokio::time::Instant;

use crate::helpers::{self, FLAKY, TestApp, scripted, scripted_slow};

#[tokio::test]
async fn test_higher_priority_dispatched_first() {
    let app = TestApp::new(1);
    let blocker = app.submit(scripted("blocker", &["hang"])).await;
    app.wait_for_status(blocker, JobStatus::Running).await;

    let low = app
        .submit(scripted("low", &["ok"]).with_priority(JobPriority::Low))
        .await;
    let critical = app
        .submit(scripted("critical", &["ok"]).with_priority(JobPriority::Critical))
        .await;
    let normal = app
        .submit(scripted("normal", &["ok"]).with_priority(JobPriority::Normal))
        .await;

    assert!(app.scheduler.cancel(blocker).await.unwrap());
    for job_id in [low, critical, normal] {
        app.wait_for_status(job_id, JobStatus::Completed).await;
    }

    assert_eq!(app.tally.log(), vec!["blocker", "critical", "normal", "low"]);
    app.scheduler.shutdown(false).await;
}

#[tokio::test]
async fn test_transient_failures_retry_until_ceiling() {
    let app = TestApp::new(1);
    let job_id = app
        .submit(scripted("always-fails", &["transient"]).with_max_retries(2))
        .await;

    let job = app.wait_for_status(job_id, JobStatus::Failed).await;
    assert_eq!(job.attempt, 3);
    assert_eq!(app.tally.runs(), 3);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Transient);

    let events = app.scheduler.events(job_id, None);
    let failures: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::Failed)
        .collect();
    let finals = failures
        .iter()
        .filter(|e| e.detail_bool("final") == Some(true))
        .count();
    assert_eq!(failures.len() - finals, 3);
    assert_eq!(finals, 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == EventType::Started)
            .count(),
        3
    );

    let stats = app.scheduler.stats().await;
    assert_eq!(stats.metrics.retried, 2);
    assert_eq!(stats.metrics.failed, 1);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_retry_then_success() {
    let app = TestApp::new(1);
    let job_id = app
        .submit(scripted("flaky-once", &["transient", "ok"]).with_max_retries(1))
        .await;

    let job = app.wait_for_status(job_id, JobStatus::Completed).await;
    assert_eq!(job.attempt, 2);
    assert!(job.result.is_some());
    assert!(job.completed_at.is_some());

    let summary = app.scheduler.progress(job_id).unwrap();
    assert_eq!(summary.phase, EventType::Completed);
    assert_eq!(summary.percentage, 100.0);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let app = TestApp::new(1);
    let job_id = app
        .submit(scripted("gone", &["permanent", "ok"]).with_max_retries(3))
        .await;

    let job = app.wait_for_status(job_id, JobStatus::Failed).await;
    assert_eq!(job.attempt, 1);
    assert_eq!(app.tally.runs(), 1);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Permanent);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_attempt_deadline_times_out() {
    let app = TestApp::new(1);
    let job_id = app
        .submit(scripted("slow", &["hang"]).with_timeout(Duration::from_millis(50)))
        .await;

    let job = app.wait_for_status(job_id, JobStatus::Failed).await;
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    assert_eq!(app.scheduler.stats().await.metrics.timed_out, 1);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_timed_out_attempt_is_retried() {
    let app = TestApp::new(1);
    let job_id = app
        .submit(
            scripted("slow-once", &["hang", "ok"])
                .with_timeout(Duration::from_millis(50))
                .with_max_retries(1),
        )
        .await;

    let job = app.wait_for_status(job_id, JobStatus::Completed).await;
    assert_eq!(job.attempt, 2);
    assert_eq!(app.tally.runs(), 2);

    let stats = app.scheduler.stats().await;
    assert_eq!(stats.metrics.timed_out, 1);
    assert_eq!(stats.metrics.retried, 1);
    app.scheduler.shutdown(true).await;
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_retry_waits_for_recovery() {
    let mut config = helpers::test_config(1);
    config.breakers.dependencies.insert(
        FLAKY.to_string(),
        BreakerSettings {
            failure_threshold: 2,
            recovery_timeout_seconds: 30,
        },
    );
    let app = TestApp::with_config_and_dependency(config, FLAKY);
    let first = app.submit(scripted("down-1", &["transient"])).await;
    app.wait_for_status(first, JobStatus::Failed).await;
    let second = app.submit(scripted("down-2", &["transient"])).await;
    app.wait_for_status(second, JobStatus::Failed).await;

    let started = Instant::now();
    let recovering = app
        .submit(scripted("recovering", &["ok"]).with_max_retries(1))
        .await;
    let job = app.wait_for_status(recovering, JobStatus::Retrying).await;
    assert_eq!(job.last_error.unwrap().kind, FailureKind::CircuitOpen);
    assert_eq!(app.tally.runs(), 2);

    tokio::time::sleep(Duration::from_secs(29)).await;
    let job = app.scheduler.status(recovering).await.unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(app.tally.runs(), 2);

    let job = app
        .wait_for_status_within(recovering, JobStatus::Completed, Duration::from_secs(60))
        .await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(30), "re-admitted after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "re-admitted after {elapsed:?}");
    assert_eq!(job.attempt, 2);
    assert_eq!(app.tally.runs(), 3);

    let stats = app.scheduler.stats().await;
    assert_eq!(stats.metrics.circuit_rejections, 1);
    let breaker = stats
        .breakers
        .iter()
        .find(|b| b.name == FLAKY)
        .expect("breaker should be listed");
    assert_eq!(breaker.state, CircuitState::Closed);
    app.scheduler.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_jobs_keep_created_first_and_final_snapshot() {
    let mut config = helpers::test_config(4);
    config.store.channel_capacity = 4096;
    let app = TestApp::with_config(config);

    let mut jobs = Vec::new();
    for i in 0..200 {
        jobs.push(app.submit(scripted(&format!("instant-{i}"), &["ok"])).await);
    }
    for job_id in &jobs {
        app.wait_for_status(*job_id, JobStatus::Completed).await;
    }
    // Drain flushes the store mirror.
    app.scheduler.shutdown(true).await;

    for job_id in &jobs {
        let events = app.scheduler.events(*job_id, None);
        assert_eq!(
            events.first().map(|e| e.event_type),
            Some(EventType::Created),
            "job {job_id} trail starts with {:?}",
            events.first().map(|e| e.event_type)
        );
        assert_eq!(
            events.last().map(|e| e.event_type),
            Some(EventType::Completed)
        );
        let mirrored = app.store.get(*job_id).expect("job should be mirrored");
        assert_eq!(mirrored.status, JobStatus::Completed, "job {job_id}");
    }
    assert_eq!(app.scheduler.stats().await.metrics.mirror_errors, 0);
}

#[tokio::test]
async fn test_purge_forgets_progress_trail() {
    let app = TestApp::new(1);
    let job_id = app.submit(scripted("short-lived", &["ok"])).await;
    app.wait_for_status(job_id, JobStatus::Completed).await;
    assert!(!app.scheduler.events(job_id, None).is_empty());

    assert_eq!(app.scheduler.purge_finished(Duration::ZERO).await, 1);

    let err = app.scheduler.status(job_id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(app.scheduler.events(job_id, None).is_empty());
    let err = app.scheduler.progress(job_id).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    app.scheduler.shutdown(true).await;
    assert!(app.store.get(job_id).is_none());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_worker_count() {
    let app = TestApp::new(2);
    let mut jobs = Vec::new();
    for i in 0..8 {
        jobs.push(app.submit(scripted_slow(&format!("batch-{i}"), &["ok"], 30)).await);
    }
    for job_id in jobs {
        app.wait_for_status(job_id, JobStatus::Completed).await;
    }

    assert_eq!(app.tally.runs(), 8);
    assert!(app.tally.max_active() <= 2);
    assert!(app.tally.max_active() >= 1);

    let stats = app.scheduler.stats().await;
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.metrics.completed, 8);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_open_circuit_rejects_without_running() {
    let app = TestApp::with_dependency(1, FLAKY);
    let first = app.submit(scripted("down-1", &["transient"])).await;
    app.wait_for_status(first, JobStatus::Failed).await;
    let second = app.submit(scripted("down-2", &["transient"])).await;
    app.wait_for_status(second, JobStatus::Failed).await;

    let third = app.submit(scripted("healthy", &["ok"])).await;
    let job = app.wait_for_status(third, JobStatus::Failed).await;
    assert_eq!(job.last_error.unwrap().kind, FailureKind::CircuitOpen);
    assert_eq!(app.tally.runs(), 2);

    let stats = app.scheduler.stats().await;
    assert_eq!(stats.metrics.circuit_rejections, 1);
    let breaker = stats
        .breakers
        .iter()
        .find(|b| b.name == FLAKY)
        .expect("breaker should be listed");
    assert_eq!(breaker.state, CircuitState::Open);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_panicking_attempt_fails_job_and_worker_survives() {
    let app = TestApp::new(1);
    let boom = app.submit(scripted("boom", &["panic"]).with_max_retries(2)).await;
    let job = app.wait_for_status(boom, JobStatus::Failed).await;
    assert_eq!(job.attempt, 1);
    assert!(job.last_error.unwrap().message.contains("scripted panic"));

    let after = app.submit(scripted("after", &["ok"])).await;
    app.wait_for_status(after, JobStatus::Completed).await;
    assert_eq!(app.scheduler.stats().await.metrics.worker_panics, 1);
    app.scheduler.shutdown(true).await;
}

#[tokio::test]
async fn test_progress_events_recorded_in_order() {
    let app = TestApp::new(1);
    let job_id = app.submit(helpers::scripted("tracked", &["ok"])).await;
    app.wait_for_status(job_id, JobStatus::Completed).await;

    let kinds: Vec<EventType> = app
        .scheduler
        .events(job_id, None)
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventType::Created,
            EventType::Started,
            EventType::Progress,
            EventType::Completed,
        ]
    );

    let latest = app.scheduler.events(job_id, Some(1));
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].event_type, EventType::Completed);

    let aggregate = app.scheduler.aggregate(Some(EventType::Completed));
    assert_eq!(aggregate.jobs, 1);
    app.scheduler.shutdown(true).await;
}
