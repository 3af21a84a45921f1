//! Advisory job store.
//!
//! The in-process queue is the source of truth. Job snapshots are mirrored
//! to a [`JobStore`] through a bounded channel drained by one background
//! task, so scheduling never waits on the store. Mirror writes go through
//! the store's circuit breaker with retries inside it. When the channel is
//! full or the store is down, updates are dropped and counted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mediaq_core::JobId;
use mediaq_entity::job::Job;

use crate::breaker::{BreakerError, CircuitBreaker, DependencyFailure};
use crate::metrics::SchedulerMetrics;
use crate::retry::{RetryPolicy, Retryable};

/// Error from a job store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Job store unavailable: {0}")]
    Unavailable(String),
    /// The backend refused this record.
    #[error("Job store rejected record: {0}")]
    Rejected(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl DependencyFailure for StoreError {
    fn counts_against_dependency(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable mirror of job records, used for restart recovery.
#[async_trait]
pub trait JobStore: Send + Sync + fmt::Debug {
    /// Insert or replace a job snapshot.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job snapshot.
    async fn remove(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Every job that had not reached a terminal state.
    async fn load_unfinished(&self) -> Result<Vec<Job>, StoreError>;
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored snapshot of one job.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).map(|entry| entry.value().clone())
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the store holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> Result<(), StoreError> {
        self.jobs.remove(&job_id);
        Ok(())
    }

    async fn load_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.enqueued_at);
        Ok(jobs)
    }
}

#[derive(Debug)]
enum MirrorOp {
    Save(Box<Job>),
    Remove(JobId),
}

/// Sending half of the write-behind mirror.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<MirrorOp>,
    metrics: Arc<SchedulerMetrics>,
}

impl StoreWriter {
    /// Spawn the mirror task. It exits once every writer is dropped, or
    /// after `shutdown` fires and the buffered updates are flushed.
    pub fn spawn(
        store: Arc<dyn JobStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        capacity: usize,
        metrics: Arc<SchedulerMetrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(mirror_loop(
            rx,
            store,
            breaker,
            retry,
            Arc::clone(&metrics),
            shutdown,
        ));
        (Self { tx, metrics }, handle)
    }

    /// Queue a snapshot for mirroring without waiting.
    pub fn save(&self, job: &Job) {
        self.push(MirrorOp::Save(Box::new(job.clone())));
    }

    /// Queue a deletion for mirroring without waiting.
    pub fn remove(&self, job_id: JobId) {
        self.push(MirrorOp::Remove(job_id));
    }

    fn push(&self, op: MirrorOp) {
        if let Err(err) = self.tx.try_send(op) {
            SchedulerMetrics::inc(&self.metrics.mirror_errors);
            tracing::warn!("Dropping job store update: {}", err);
        }
    }
}

async fn mirror_loop(
    mut rx: mpsc::Receiver<MirrorOp>,
    store: Arc<dyn JobStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<SchedulerMetrics>,
    shutdown: CancellationToken,
) {
    let store: &dyn JobStore = store.as_ref();
    loop {
        let op = tokio::select! {
            op = rx.recv() => op,
            _ = shutdown.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(op) = op else {
            break;
        };
        let result = match &op {
            MirrorOp::Save(job) => {
                let job: &Job = job;
                breaker.call(retry.run(|_| store.save(job))).await
            }
            MirrorOp::Remove(job_id) => {
                let job_id = *job_id;
                breaker.call(retry.run(|_| store.remove(job_id))).await
            }
        };
        match result {
            Ok(()) => {}
            Err(BreakerError::Open(err)) => {
                SchedulerMetrics::inc(&metrics.mirror_errors);
                tracing::debug!("Skipping job store update: {}", err);
            }
            Err(BreakerError::Inner(err)) => {
                SchedulerMetrics::inc(&metrics.mirror_errors);
                tracing::warn!("Job store update failed: {}", err);
            }
        }
    }
    tracing::debug!("Job store mirror stopped");
}
