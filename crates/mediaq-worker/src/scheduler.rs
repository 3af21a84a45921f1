//! Scheduler facade.
//!
//! The [`Scheduler`] owns the queue, the worker pool, the breaker registry,
//! the progress tracker, and the background tasks (janitor, store mirror).
//! It is the only surface callers use: enqueue, cancel, query, shutdown.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use mediaq_core::config::SchedulerConfig;
use mediaq_core::{AppError, AppResult, ErrorKind, JobId};
use mediaq_entity::job::{Job, JobPriority, JobSpec, JobStatus};
use mediaq_entity::progress::{EventType, ProgressEvent, ProgressSummary};

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::executor::{JobExecutor, JobHandler};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::progress::{ProgressAggregate, ProgressTracker};
use crate::queue::{Admission, CancelOutcome, JobQueue, QueueCounts};
use crate::retry::RetryPolicy;
use crate::runner::{self, details};
use crate::store::{JobStore, StoreWriter};

/// Time allowed for workers to stop after being force-cancelled.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// State shared by the facade, the worker slots, and background tasks.
#[derive(Debug)]
pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) default_priority: JobPriority,
    pub(crate) queue: JobQueue,
    pub(crate) executor: JobExecutor,
    pub(crate) breakers: BreakerRegistry,
    pub(crate) tracker: Arc<ProgressTracker>,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: Arc<SchedulerMetrics>,
    pub(crate) mirror: Option<StoreWriter>,
    /// Fires when the scheduler stops accepting and claiming work.
    pub(crate) stop: CancellationToken,
    mirror_stop: CancellationToken,
}

impl SchedulerInner {
    /// Queue a snapshot for the advisory store, if one is configured.
    pub(crate) fn mirror(&self, job: &Job) {
        if let Some(mirror) = &self.mirror {
            mirror.save(job);
        }
    }

    /// Bookkeeping for a job that just became cancelled.
    pub(crate) fn on_cancelled(&self, job: &Job) {
        SchedulerMetrics::inc(&self.metrics.cancelled);
        tracing::info!("Job {} cancelled after {} attempt(s)", job.job_id, job.attempt);
        self.tracker.record(
            job.job_id,
            EventType::Cancelled,
            details(json!({ "attempt": job.attempt })),
        );
        self.mirror(job);
    }
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Job counts by status and ready counts by priority.
    pub queue: QueueCounts,
    /// Configured worker slots.
    pub workers: usize,
    /// Slots currently executing a job.
    pub workers_busy: u64,
    /// Fraction of slots busy, in `[0, 1]`.
    pub utilization: f64,
    /// Process-lifetime counters.
    pub metrics: MetricsSnapshot,
    /// Every breaker created so far.
    pub breakers: Vec<BreakerSnapshot>,
    /// Whether new jobs are accepted.
    pub accepting: bool,
    /// Seconds since the scheduler started.
    pub uptime_seconds: u64,
}

/// What a shutdown left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Whether running jobs were allowed to finish.
    pub drained: bool,
    /// Running jobs that were cancelled to stop the pool.
    pub force_cancelled: usize,
    /// Jobs left `queued` for a later restore.
    pub left_queued: usize,
    /// Jobs left `retrying` for a later restore.
    pub left_retrying: usize,
}

#[derive(Debug)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    janitor: JoinHandle<()>,
    mirror: Option<JoinHandle<()>>,
}

/// Builder for [`Scheduler`].
#[derive(Debug)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    executor: JobExecutor,
    store: Option<Arc<dyn JobStore>>,
}

impl SchedulerBuilder {
    /// Register a job handler.
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.executor.register(handler);
        self
    }

    /// Mirror job records to an advisory store.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and start the worker pool and background
    /// tasks. Must be called inside a Tokio runtime.
    pub fn start(self) -> AppResult<Scheduler> {
        let config = self.config;
        config.validate()?;
        let default_priority = JobPriority::from_str(&config.queue.default_priority)
            .map_err(|e| AppError::configuration(format!("queue.default_priority: {e}")))?;

        let metrics = Arc::new(SchedulerMetrics::new());
        let breakers = BreakerRegistry::new(config.breakers.clone());
        let retry = RetryPolicy::from_config(&config.retry);
        let mirror_stop = CancellationToken::new();

        let (mirror, mirror_task) = match self.store {
            Some(store) if config.store.enabled => {
                let (writer, handle) = StoreWriter::spawn(
                    store,
                    breakers.get(&config.store.dependency),
                    retry.clone(),
                    config.store.channel_capacity,
                    Arc::clone(&metrics),
                    mirror_stop.clone(),
                );
                (Some(writer), Some(handle))
            }
            _ => (None, None),
        };

        let inner = Arc::new(SchedulerInner {
            default_priority,
            queue: JobQueue::from_config(&config.queue),
            executor: self.executor,
            breakers,
            tracker: Arc::new(ProgressTracker::new(&config.progress)),
            retry,
            metrics,
            mirror,
            stop: CancellationToken::new(),
            mirror_stop,
            config,
        });

        let workers = runner::spawn_workers(&inner);
        let janitor = tokio::spawn(janitor_loop(Arc::clone(&inner)));

        tracing::info!(
            "Scheduler started with concurrency={}, handlers={:?}",
            inner.config.worker.concurrency,
            inner.executor.registered_types()
        );

        Ok(Scheduler {
            inner,
            tasks: Mutex::new(Some(Tasks {
                workers,
                janitor,
                mirror: mirror_task,
            })),
            started_at: Instant::now(),
        })
    }
}

/// Priority job scheduler.
#[derive(Debug)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    tasks: Mutex<Option<Tasks>>,
    started_at: Instant,
}

impl Scheduler {
    /// Start building a scheduler from configuration.
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            executor: JobExecutor::new(),
            store: None,
        }
    }

    /// Validate and admit a job. Returns its id.
    ///
    /// Enqueueing a spec whose `correlation_id` already belongs to a
    /// non-terminal job returns that job's id instead of admitting a
    /// duplicate.
    pub async fn enqueue(&self, spec: JobSpec) -> AppResult<JobId> {
        let inner = &self.inner;
        if inner.stop.is_cancelled() {
            return Err(AppError::shutting_down("Scheduler is not accepting jobs"));
        }
        let job = self.build_job(spec)?;

        // The created event and the queued snapshot must land before any
        // worker can claim the job.
        let admitted = inner.queue.enqueue_with(job, |job| {
            inner.tracker.record(
                job.job_id,
                EventType::Created,
                details(json!({
                    "correlation_id": job.correlation_id,
                    "job_type": job.job_type,
                    "priority": job.priority.as_str(),
                })),
            );
            inner.mirror(job);
        });
        match admitted {
            Ok(Admission::Admitted(job)) => {
                SchedulerMetrics::inc(&inner.metrics.enqueued);
                tracing::info!(
                    "Enqueued job: id={}, type='{}', priority={}, correlation_id='{}'",
                    job.job_id,
                    job.job_type,
                    job.priority,
                    job.correlation_id
                );
                Ok(job.job_id)
            }
            Ok(Admission::Existing(job_id)) => {
                tracing::debug!("Correlation id already active as job {}", job_id);
                Ok(job_id)
            }
            Err(err) => {
                if err.is(ErrorKind::CapacityExceeded) {
                    SchedulerMetrics::inc(&inner.metrics.rejected);
                    tracing::warn!("Rejected job: {}", err.message);
                }
                Err(err)
            }
        }
    }

    fn build_job(&self, spec: JobSpec) -> AppResult<Job> {
        let inner = &self.inner;
        spec.validate()
            .map_err(|e| AppError::invalid_spec(format!("Invalid job spec: {e}")))?;
        if spec.correlation_id.trim().is_empty() {
            return Err(AppError::invalid_spec("correlation_id must not be blank"));
        }
        let handler = inner.executor.handler(&spec.job_type).ok_or_else(|| {
            AppError::invalid_spec(format!("No handler registered for job type '{}'", spec.job_type))
        })?;
        handler
            .validate(&spec.payload)
            .map_err(|e| AppError::invalid_spec(format!("Invalid payload: {e}")))?;

        let max_retries = spec
            .max_retries
            .unwrap_or(inner.config.queue.default_max_retries);
        if max_retries.saturating_add(1) > inner.retry.max_attempts() {
            return Err(AppError::invalid_spec(format!(
                "max_retries {} exceeds the retry ceiling of {} attempts",
                max_retries,
                inner.retry.max_attempts()
            )));
        }
        let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| inner.config.queue.default_timeout());

        let now = Utc::now();
        Ok(Job {
            job_id: JobId::new(),
            correlation_id: spec.correlation_id,
            job_type: spec.job_type,
            dependency: handler.dependency().to_string(),
            priority: spec.priority.unwrap_or(inner.default_priority),
            status: JobStatus::Pending,
            attempt: 0,
            max_retries,
            timeout,
            payload: spec.payload,
            result: None,
            last_error: None,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    /// Cancel a job. Returns `false` if it had already finished.
    ///
    /// A job that has not started (or is waiting out a backoff) is
    /// cancelled immediately. A running job is flagged and its worker
    /// stops it at the next suspension point.
    pub async fn cancel(&self, job_id: JobId) -> AppResult<bool> {
        match self.inner.queue.cancel(job_id)? {
            CancelOutcome::Cancelled(job) => {
                self.inner.on_cancelled(&job);
                Ok(true)
            }
            CancelOutcome::Requested => {
                tracing::info!("Cancellation requested for running job {}", job_id);
                Ok(true)
            }
            CancelOutcome::AlreadyTerminal(status) => {
                tracing::debug!("Job {} already {}, nothing to cancel", job_id, status);
                Ok(false)
            }
        }
    }

    /// Snapshot of a job.
    pub async fn status(&self, job_id: JobId) -> AppResult<Job> {
        self.inner
            .queue
            .get(job_id)
            .ok_or_else(|| AppError::not_found(format!("Job {job_id} not found")))
    }

    /// Snapshots of all held jobs, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.inner.queue.list(status)
    }

    /// Progress events for a job, oldest first, limited to the newest
    /// `limit`.
    pub fn events(&self, job_id: JobId, limit: Option<usize>) -> Vec<ProgressEvent> {
        self.inner.tracker.events(job_id, limit)
    }

    /// Derived progress summary for a job.
    pub fn progress(&self, job_id: JobId) -> AppResult<ProgressSummary> {
        self.inner
            .tracker
            .summary(job_id)
            .ok_or_else(|| AppError::not_found(format!("No progress recorded for job {job_id}")))
    }

    /// Aggregate progress across tracked jobs.
    pub fn aggregate(&self, phase: Option<EventType>) -> ProgressAggregate {
        self.inner.tracker.aggregate(phase)
    }

    /// Counts by status, worker utilization, and breaker states.
    pub async fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        let metrics = inner.metrics.snapshot();
        let workers = inner.config.worker.concurrency;
        SchedulerStats {
            queue: inner.queue.peek_stats(),
            workers,
            workers_busy: metrics.workers_busy,
            utilization: metrics.workers_busy as f64 / workers.max(1) as f64,
            metrics,
            breakers: inner.breakers.snapshots(),
            accepting: !inner.stop.is_cancelled(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Running jobs whose current attempt exceeded the stuck threshold.
    pub async fn stuck_jobs(&self) -> Vec<Job> {
        self.inner
            .queue
            .stuck(self.inner.config.worker.stuck_job_threshold())
    }

    /// Drop terminal jobs that finished more than `max_age` ago. Returns how
    /// many were dropped.
    pub async fn purge_finished(&self, max_age: Duration) -> usize {
        purge(&self.inner, max_age)
    }

    /// Re-admit the unfinished jobs recorded in `store`.
    ///
    /// Jobs keep their id, correlation id, and attempts so far. A job that
    /// was on its last attempt gets one more. Jobs whose correlation id is
    /// already active, or whose type has no handler, are skipped.
    pub async fn restore(&self, store: &dyn JobStore) -> AppResult<usize> {
        let inner = &self.inner;
        if inner.stop.is_cancelled() {
            return Err(AppError::shutting_down("Scheduler is not accepting jobs"));
        }
        let jobs = store.load_unfinished().await.map_err(|e| {
            AppError::with_source(ErrorKind::ExternalService, "Failed to load unfinished jobs", e)
        })?;

        let mut restored = 0;
        for mut job in jobs {
            if !inner.executor.has_handler(&job.job_type) {
                tracing::warn!(
                    "Skipping restore of job {}: no handler for type '{}'",
                    job.job_id,
                    job.job_type
                );
                continue;
            }
            let now = Utc::now();
            job.status = JobStatus::Pending;
            job.attempt = job.attempt.min(job.max_retries);
            job.result = None;
            job.completed_at = None;
            job.updated_at = now;

            let admitted = inner.queue.enqueue_with(job, |job| {
                inner.tracker.record(
                    job.job_id,
                    EventType::Created,
                    details(json!({
                        "correlation_id": job.correlation_id,
                        "restored": true,
                    })),
                );
                inner.mirror(job);
            });
            match admitted {
                Ok(Admission::Admitted(_)) => {
                    restored += 1;
                }
                Ok(Admission::Existing(job_id)) => {
                    tracing::debug!("Job {} already active, not restored", job_id);
                }
                Err(err) => {
                    tracing::warn!("Stopping restore: {}", err);
                    break;
                }
            }
        }
        tracing::info!("Restored {} unfinished job(s)", restored);
        Ok(restored)
    }

    /// Whether new jobs are accepted.
    pub fn is_accepting(&self) -> bool {
        !self.inner.stop.is_cancelled()
    }

    /// Stop the scheduler.
    ///
    /// New enqueues are rejected and workers stop claiming. With `drain`,
    /// running jobs get up to `worker.drain_timeout_seconds` to finish
    /// before they are cancelled; without it they are cancelled at once.
    /// Queued jobs stay queued and retrying jobs stay retrying, so a store
    /// mirror holds them for [`restore`](Self::restore). Calling it twice is
    /// a no-op.
    pub async fn shutdown(&self, drain: bool) -> ShutdownReport {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return ShutdownReport::default();
        };
        let inner = &self.inner;
        tracing::info!("Scheduler shutting down (drain={})", drain);

        inner.stop.cancel();
        inner.queue.close();

        let mut report = ShutdownReport {
            drained: drain,
            ..ShutdownReport::default()
        };
        if !drain {
            report.force_cancelled = inner.queue.cancel_running();
        }

        let mut workers = Box::pin(futures::future::join_all(tasks.workers));
        let wait = if drain {
            inner.config.worker.drain_timeout()
        } else {
            STOP_GRACE
        };
        if tokio::time::timeout(wait, workers.as_mut()).await.is_err() {
            let cancelled = inner.queue.cancel_running();
            report.force_cancelled += cancelled;
            tracing::warn!(
                "Workers still busy after {:?}; cancelled {} running job(s)",
                wait,
                cancelled
            );
            if tokio::time::timeout(STOP_GRACE, workers.as_mut()).await.is_err() {
                tracing::error!("Workers did not stop within {:?}", STOP_GRACE);
            }
        }

        tasks.janitor.abort();
        if let Some(mirror) = tasks.mirror {
            inner.mirror_stop.cancel();
            if tokio::time::timeout(STOP_GRACE, mirror).await.is_err() {
                tracing::warn!("Job store mirror did not flush within {:?}", STOP_GRACE);
            }
        }

        report.left_queued = inner.queue.pending_len();
        report.left_retrying = inner.queue.retrying_len();
        tracing::info!(
            "Scheduler stopped: force_cancelled={}, left_queued={}, left_retrying={}",
            report.force_cancelled,
            report.left_queued,
            report.left_retrying
        );
        report
    }
}

fn purge(inner: &SchedulerInner, max_age: Duration) -> usize {
    let purged = inner.queue.purge_finished(max_age);
    for job_id in &purged {
        inner.tracker.forget(*job_id);
        if let Some(mirror) = &inner.mirror {
            mirror.remove(*job_id);
        }
    }
    if !purged.is_empty() {
        tracing::info!("Purged {} finished job(s)", purged.len());
    }
    purged.len()
}

/// Periodically purge expired terminal jobs and report stuck attempts.
async fn janitor_loop(inner: Arc<SchedulerInner>) {
    let mut interval = tokio::time::interval(inner.config.worker.janitor_interval());
    interval.tick().await;

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        purge(&inner, inner.config.queue.retention());
        for job in inner.queue.stuck(inner.config.worker.stuck_job_threshold()) {
            tracing::warn!(
                "Job {} has been running attempt {} since {:?}",
                job.job_id,
                job.attempt,
                job.updated_at
            );
        }
    }
}
