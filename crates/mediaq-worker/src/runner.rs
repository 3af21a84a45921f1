//! Worker pool: a fixed set of slots that claim and execute jobs.
//!
//! Each slot loops: claim the next job, run one attempt to completion,
//! then claim again. An idle slot sleeps until the queue signals new work
//! or the poll interval elapses. A slot stops claiming once the scheduler's
//! stop token fires but always finishes the job it holds.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mediaq_entity::job::{FailureKind, Job, JobError};
use mediaq_entity::progress::EventType;

use crate::breaker::BreakerError;
use crate::executor::{ErrorClass, JobExecutionError, Operation};
use crate::metrics::SchedulerMetrics;
use crate::progress::ProgressReporter;
use crate::queue::{Claim, Settled};
use crate::scheduler::SchedulerInner;

/// Upper bound on how long an operation may take to tear itself down.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Stand-in deadline for timeouts too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Spawn `worker.concurrency` supervised slots.
pub(crate) fn spawn_workers(inner: &Arc<SchedulerInner>) -> Vec<JoinHandle<()>> {
    (0..inner.config.worker.concurrency)
        .map(|slot| tokio::spawn(supervise(slot, Arc::clone(inner))))
        .collect()
}

/// Restart a slot whose loop panicked outside of job execution.
async fn supervise(slot: usize, inner: Arc<SchedulerInner>) {
    loop {
        let handle = tokio::spawn(worker_loop(slot, Arc::clone(&inner)));
        match handle.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                SchedulerMetrics::inc(&inner.metrics.worker_panics);
                tracing::error!("Worker slot {} crashed: {}", slot, err);
                if inner.stop.is_cancelled() {
                    break;
                }
                tracing::warn!("Restarting worker slot {}", slot);
            }
            Err(err) => {
                tracing::warn!("Worker slot {} aborted: {}", slot, err);
                break;
            }
        }
    }
}

async fn worker_loop(slot: usize, inner: Arc<SchedulerInner>) {
    tracing::debug!("Worker slot {} started", slot);
    let poll_interval = inner.config.worker.poll_interval();

    loop {
        if inner.stop.is_cancelled() {
            break;
        }
        let claim = match inner.queue.dequeue_next() {
            Some(claim) => claim,
            None => {
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    _ = inner.queue.wait_for_work(poll_interval) => {}
                }
                continue;
            }
        };

        let job_id = claim.job.job_id;
        inner.metrics.worker_started();
        let outcome = AssertUnwindSafe(execute(&inner, claim))
            .catch_unwind()
            .await;
        inner.metrics.worker_finished();

        if let Err(panic) = outcome {
            let message = panic_message(&*panic);
            SchedulerMetrics::inc(&inner.metrics.worker_panics);
            tracing::error!(
                "Worker slot {} panicked while running job {}: {}",
                slot,
                job_id,
                message
            );
            let error = JobError::new(
                FailureKind::Permanent,
                format!("worker panicked: {message}"),
            );
            if let Some(job) = inner.queue.abandon(job_id, error.clone()) {
                record_final_failure(&inner, &job, &error);
            }
        }
    }

    tracing::debug!("Worker slot {} stopped", slot);
}

/// Run one attempt of a claimed job and settle its outcome.
async fn execute(inner: &Arc<SchedulerInner>, claim: Claim) {
    let Claim { job, cancel } = claim;
    let job_id = job.job_id;

    SchedulerMetrics::inc(&inner.metrics.attempts);
    inner.mirror(&job);
    tracing::info!(
        "Processing job: id={}, type='{}', attempt={}/{}",
        job_id,
        job.job_type,
        job.attempt,
        job.max_attempts()
    );
    inner.tracker.record(
        job_id,
        EventType::Started,
        details(json!({
            "attempt": job.attempt,
            "max_attempts": job.max_attempts(),
        })),
    );

    if cancel.is_cancelled() {
        settle_cancelled(inner, &job, None);
        return;
    }

    let Some(handler) = inner.executor.handler(&job.job_type) else {
        let err = JobExecutionError::Permanent(format!(
            "No handler registered for job type '{}'",
            job.job_type
        ));
        settle_failure(inner, &job, &cancel, err, None);
        return;
    };
    let reporter = ProgressReporter::new(job_id, Arc::clone(&inner.tracker));
    let mut operation = match handler.create(&job, reporter) {
        Ok(operation) => operation,
        Err(err) => {
            settle_failure(inner, &job, &cancel, err, None);
            return;
        }
    };

    let breaker = inner.breakers.get(&job.dependency);
    let now = Instant::now();
    let deadline = now.checked_add(job.timeout).unwrap_or(now + FAR_FUTURE);
    let outcome = {
        let attempt = breaker.call(async {
            match tokio::time::timeout_at(deadline, operation.run(deadline)).await {
                Ok(result) => result,
                Err(_) => Err(JobExecutionError::Timeout(job.timeout)),
            }
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = attempt => Some(result),
        }
    };

    match outcome {
        None => {
            tracing::info!("Job {} cancelled while running", job_id);
            settle_cancelled(inner, &job, None);
            stop_operation(operation.as_mut(), job_id).await;
        }
        Some(Ok(result)) => match inner.queue.complete(job_id, result) {
            Some(Settled::Applied(done)) => {
                SchedulerMetrics::inc(&inner.metrics.completed);
                let elapsed_ms = done
                    .duration()
                    .map(|d| d.num_milliseconds())
                    .unwrap_or_default();
                tracing::info!(
                    "Job {} completed successfully after {} attempt(s)",
                    job_id,
                    done.attempt
                );
                inner.tracker.record(
                    job_id,
                    EventType::Completed,
                    details(json!({
                        "attempts": done.attempt,
                        "duration_ms": elapsed_ms,
                    })),
                );
                inner.mirror(&done);
            }
            Some(Settled::Cancelled(cancelled)) => inner.on_cancelled(&cancelled),
            None => {}
        },
        Some(Err(BreakerError::Open(open))) => {
            SchedulerMetrics::inc(&inner.metrics.circuit_rejections);
            tracing::warn!("Job {} not attempted: {}", job_id, open);
            let delay = breaker.recovery_timeout();
            settle_failure(inner, &job, &cancel, open.into(), Some(delay));
        }
        Some(Err(BreakerError::Inner(err))) => {
            if matches!(err, JobExecutionError::Timeout(_)) {
                SchedulerMetrics::inc(&inner.metrics.timed_out);
                stop_operation(operation.as_mut(), job_id).await;
            }
            settle_failure(inner, &job, &cancel, err, None);
        }
    }
}

async fn stop_operation(operation: &mut dyn Operation, job_id: mediaq_core::JobId) {
    if tokio::time::timeout(CANCEL_GRACE, operation.cancel())
        .await
        .is_err()
    {
        tracing::warn!("Operation for job {} did not stop within {:?}", job_id, CANCEL_GRACE);
    }
}

fn settle_cancelled(inner: &SchedulerInner, job: &Job, error: Option<JobError>) {
    if let Some(cancelled) = inner.queue.finish_cancelled(job.job_id, error) {
        inner.on_cancelled(&cancelled);
    }
}

/// Decide between retry and terminal failure for a failed attempt.
fn settle_failure(
    inner: &Arc<SchedulerInner>,
    job: &Job,
    cancel: &CancellationToken,
    err: JobExecutionError,
    delay_override: Option<Duration>,
) {
    let job_id = job.job_id;
    let class = err.class();
    if class == ErrorClass::Cancelled {
        settle_cancelled(inner, job, Some(err.to_job_error()));
        return;
    }

    let job_error = err.to_job_error();
    let will_retry = class == ErrorClass::Transient
        && job.has_attempts_left()
        && inner.retry.allows(job.attempt + 1);
    inner.tracker.record(
        job_id,
        EventType::Failed,
        details(json!({
            "attempt": job.attempt,
            "error": job_error.message,
            "kind": job_error.kind.as_str(),
            "retryable": class == ErrorClass::Transient,
            "final": false,
        })),
    );

    if will_retry {
        let delay = delay_override.unwrap_or_else(|| inner.retry.delay(job.attempt));
        match inner.queue.mark_retrying(job_id, job_error) {
            Some(Settled::Applied(retrying)) => {
                SchedulerMetrics::inc(&inner.metrics.retried);
                tracing::warn!(
                    "Job {} failed ({}), retrying in {:?} (attempt {}/{})",
                    job_id,
                    err,
                    delay,
                    job.attempt,
                    job.max_attempts()
                );
                inner.mirror(&retrying);
                schedule_retry(inner, job_id, delay, cancel.clone());
            }
            Some(Settled::Cancelled(cancelled)) => inner.on_cancelled(&cancelled),
            None => {}
        }
        return;
    }

    match inner.queue.fail(job_id, job_error.clone()) {
        Some(Settled::Applied(failed)) => {
            tracing::error!(
                "Job {} failed after {} attempt(s): {}",
                job_id,
                failed.attempt,
                err
            );
            record_final_failure(inner, &failed, &job_error);
        }
        Some(Settled::Cancelled(cancelled)) => inner.on_cancelled(&cancelled),
        None => {}
    }
}

fn record_final_failure(inner: &SchedulerInner, job: &Job, error: &JobError) {
    SchedulerMetrics::inc(&inner.metrics.failed);
    inner.tracker.record(
        job.job_id,
        EventType::Failed,
        details(json!({
            "attempts": job.attempt,
            "error": error.message,
            "kind": error.kind.as_str(),
            "final": true,
        })),
    );
    inner.mirror(job);
}

/// Re-admit a retrying job after `delay`, unless it is cancelled or the
/// scheduler stops first. A stopped timer leaves the job `retrying`.
fn schedule_retry(
    inner: &Arc<SchedulerInner>,
    job_id: mediaq_core::JobId,
    delay: Duration,
    cancel: CancellationToken,
) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if inner.queue.readmit_with(job_id, |job| inner.mirror(job)).is_some() {
                    tracing::debug!("Job {} re-admitted after backoff", job_id);
                }
            }
            _ = cancel.cancelled() => {}
            _ = inner.stop.cancelled() => {
                tracing::debug!("Retry timer for job {} stopped by shutdown", job_id);
            }
        }
    });
}

pub(crate) fn details(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
