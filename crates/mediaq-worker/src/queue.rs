//! In-process priority job queue and job record table.
//!
//! All job state lives behind one mutex: the ordered ready index, the
//! record table, and the correlation-id map. Every public operation takes
//! the lock once, so a claim, a cancel, or a completion is atomic with
//! respect to every other. The lock is never held across an `.await`.
//!
//! Ready jobs are ordered by priority (highest first), then by admission
//! sequence (earliest first). A job re-admitted after a retry keeps its
//! original sequence number.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mediaq_core::config::queue::QueueConfig;
use mediaq_core::{AppError, AppResult, JobId};
use mediaq_entity::job::{Job, JobError, JobPriority, JobStatus};

type ReadyKey = (Reverse<JobPriority>, u64, JobId);

/// A job handed to a worker by [`JobQueue::dequeue_next`].
#[derive(Debug)]
pub struct Claim {
    /// Snapshot of the job after it moved to `running`.
    pub job: Job,
    /// Cancellation flag for this job.
    pub cancel: CancellationToken,
}

/// Result of an admission request.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The job was admitted and is now queued.
    Admitted(Job),
    /// A non-terminal job already exists for the correlation id.
    Existing(JobId),
}

/// Result of a cancellation request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job never started (or was waiting out a backoff) and is now
    /// cancelled.
    Cancelled(Job),
    /// The job is running; its worker will observe the flag.
    Requested,
    /// The job had already reached a terminal state.
    AlreadyTerminal(JobStatus),
}

/// Result of finishing a running attempt.
#[derive(Debug, Clone)]
pub enum Settled {
    /// The requested transition was applied.
    Applied(Job),
    /// A cancellation arrived first; the job is now cancelled instead.
    Cancelled(Job),
}

impl Settled {
    /// Snapshot of the job after settling.
    pub fn job(&self) -> &Job {
        match self {
            Self::Applied(job) | Self::Cancelled(job) => job,
        }
    }
}

/// Job counts by status and ready counts by priority.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    /// Records per status (`"queued"`, `"running"`, ...).
    pub by_status: HashMap<String, usize>,
    /// Ready jobs per priority (`"critical"`, `"normal"`, ...).
    pub ready_by_priority: HashMap<String, usize>,
    /// Ready jobs across all priorities.
    pub pending: usize,
    /// Records held, terminal ones included.
    pub total: usize,
}

#[derive(Debug)]
struct JobRecord {
    job: Job,
    seq: u64,
    cancel: CancellationToken,
    attempt_started: Option<Instant>,
}

impl JobRecord {
    fn key(&self) -> ReadyKey {
        (Reverse(self.job.priority), self.seq, self.job.job_id)
    }

    /// Apply a transition the caller has already proven legal.
    fn advance(&mut self, next: JobStatus) {
        if let Err(err) = self.job.transition(next) {
            panic!("job {}: {err}", self.job.job_id);
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeSet<ReadyKey>,
    records: HashMap<JobId, JobRecord>,
    active: HashMap<String, JobId>,
    ready_per_priority: [usize; 5],
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn push_ready(&mut self, key: ReadyKey) {
        let lane = key.0.0.level() as usize;
        if self.ready.insert(key) {
            self.ready_per_priority[lane] += 1;
        }
    }

    fn pull_ready(&mut self, key: &ReadyKey) {
        let lane = key.0.0.level() as usize;
        if self.ready.remove(key) {
            self.ready_per_priority[lane] -= 1;
        }
    }

    fn release_correlation(&mut self, job: &Job) {
        if self.active.get(&job.correlation_id) == Some(&job.job_id) {
            self.active.remove(&job.correlation_id);
        }
    }

    /// Move a record to a terminal status and release its correlation id.
    fn finish(&mut self, job_id: JobId, next: JobStatus) -> Option<Job> {
        let record = self.records.get_mut(&job_id)?;
        record.advance(next);
        record.attempt_started = None;
        let job = record.job.clone();
        self.release_correlation(&job);
        Some(job)
    }
}

/// Priority queue and job table shared by the scheduler and its workers.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_pending: usize,
    capacity_per_priority: usize,
}

impl JobQueue {
    /// Create an empty queue.
    pub fn new(max_pending: usize, capacity_per_priority: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_pending,
            capacity_per_priority,
        }
    }

    /// Create a queue from the `[queue]` configuration section.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_pending, config.capacity_per_priority)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a `pending` job and make it visible to [`dequeue_next`].
    ///
    /// Returns the existing job id when a non-terminal job already holds
    /// the same correlation id, and `CapacityExceeded` when the queue or
    /// the job's priority band is full.
    ///
    /// [`dequeue_next`]: Self::dequeue_next
    pub fn enqueue(&self, job: Job) -> AppResult<Admission> {
        self.enqueue_with(job, |_| {})
    }

    /// Like [`enqueue`](Self::enqueue), running `on_admit` on the queued
    /// job before it becomes claimable. `on_admit` runs under the queue
    /// lock and must not call back into the queue.
    pub fn enqueue_with(
        &self,
        mut job: Job,
        on_admit: impl FnOnce(&Job),
    ) -> AppResult<Admission> {
        let mut state = self.lock();
        if let Some(existing) = state.active.get(&job.correlation_id) {
            return Ok(Admission::Existing(*existing));
        }
        if state.records.contains_key(&job.job_id) {
            return Ok(Admission::Existing(job.job_id));
        }
        if state.ready.len() >= self.max_pending {
            return Err(AppError::capacity_exceeded(format!(
                "Queue is full ({}/{} pending)",
                state.ready.len(),
                self.max_pending
            )));
        }
        let lane = job.priority.level() as usize;
        if state.ready_per_priority[lane] >= self.capacity_per_priority {
            return Err(AppError::capacity_exceeded(format!(
                "Priority '{}' is full ({}/{} pending)",
                job.priority, state.ready_per_priority[lane], self.capacity_per_priority
            )));
        }
        if job.status != JobStatus::Pending {
            return Err(AppError::internal(format!(
                "Job {} must be pending to be admitted, found '{}'",
                job.job_id, job.status
            )));
        }
        if let Err(err) = job.transition(JobStatus::Queued) {
            return Err(AppError::internal(err.to_string()));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let record = JobRecord {
            job: job.clone(),
            seq,
            cancel: CancellationToken::new(),
            attempt_started: None,
        };
        on_admit(&job);
        state.push_ready(record.key());
        state.active.insert(job.correlation_id.clone(), job.job_id);
        state.records.insert(job.job_id, record);
        drop(state);

        self.notify.notify_one();
        Ok(Admission::Admitted(job))
    }

    /// Atomically claim the highest-priority, earliest-admitted ready job.
    ///
    /// The job moves to `running` and its attempt counter is incremented
    /// under the same lock that removed it from the ready index, so no two
    /// callers can ever claim the same job.
    pub fn dequeue_next(&self) -> Option<Claim> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let key = state.ready.pop_first()?;
        state.ready_per_priority[key.0.0.level() as usize] -= 1;
        let record = match state.records.get_mut(&key.2) {
            Some(record) => record,
            None => panic!("ready index references unknown job {}", key.2),
        };
        record.advance(JobStatus::Running);
        record.job.begin_attempt();
        record.attempt_started = Some(Instant::now());
        let claim = Claim {
            job: record.job.clone(),
            cancel: record.cancel.clone(),
        };
        let more = !state.ready.is_empty();
        drop(state);

        // Pass the wake-up on so another idle worker picks up the rest.
        if more {
            self.notify.notify_one();
        }
        Some(claim)
    }

    /// Stop handing out jobs. Ready jobs stay queued.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Wait until a job may be ready, or `timeout` elapses.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Remove a job that has not started yet and mark it cancelled.
    ///
    /// Returns `None` if the job is unknown or not `pending`/`queued`.
    pub fn remove(&self, job_id: JobId) -> Option<Job> {
        let mut state = self.lock();
        let record = state.records.get(&job_id)?;
        if !matches!(record.job.status, JobStatus::Pending | JobStatus::Queued) {
            return None;
        }
        let key = record.key();
        record.cancel.cancel();
        state.pull_ready(&key);
        state.finish(job_id, JobStatus::Cancelled)
    }

    /// Request cancellation of a job in any non-terminal state.
    pub fn cancel(&self, job_id: JobId) -> AppResult<CancelOutcome> {
        let mut state = self.lock();
        let record = state
            .records
            .get(&job_id)
            .ok_or_else(|| AppError::not_found(format!("Job {job_id} not found")))?;
        let status = record.job.status;
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }
        record.cancel.cancel();
        match status {
            JobStatus::Running => Ok(CancelOutcome::Requested),
            JobStatus::Pending | JobStatus::Queued | JobStatus::Retrying => {
                let key = record.key();
                state.pull_ready(&key);
                match state.finish(job_id, JobStatus::Cancelled) {
                    Some(job) => Ok(CancelOutcome::Cancelled(job)),
                    None => Err(AppError::not_found(format!("Job {job_id} not found"))),
                }
            }
            _ => Ok(CancelOutcome::AlreadyTerminal(status)),
        }
    }

    /// Mark a running job completed, unless it was cancelled first.
    pub fn complete(&self, job_id: JobId, result: Option<serde_json::Value>) -> Option<Settled> {
        let mut state = self.lock();
        let record = state.records.get_mut(&job_id)?;
        if record.cancel.is_cancelled() {
            return state.finish(job_id, JobStatus::Cancelled).map(Settled::Cancelled);
        }
        record.job.result = result;
        record.job.last_error = None;
        state.finish(job_id, JobStatus::Completed).map(Settled::Applied)
    }

    /// Mark a running job failed for good, unless it was cancelled first.
    pub fn fail(&self, job_id: JobId, error: JobError) -> Option<Settled> {
        let mut state = self.lock();
        let record = state.records.get_mut(&job_id)?;
        record.job.last_error = Some(error);
        if record.cancel.is_cancelled() {
            return state.finish(job_id, JobStatus::Cancelled).map(Settled::Cancelled);
        }
        state.finish(job_id, JobStatus::Failed).map(Settled::Applied)
    }

    /// Move a running job to `retrying`, unless it was cancelled first.
    pub fn mark_retrying(&self, job_id: JobId, error: JobError) -> Option<Settled> {
        let mut state = self.lock();
        let record = state.records.get_mut(&job_id)?;
        record.job.last_error = Some(error);
        if record.cancel.is_cancelled() {
            return state.finish(job_id, JobStatus::Cancelled).map(Settled::Cancelled);
        }
        record.advance(JobStatus::Retrying);
        record.attempt_started = None;
        Some(Settled::Applied(record.job.clone()))
    }

    /// End a running job as cancelled after its worker stopped it.
    ///
    /// Returns `None` if the job is unknown or already terminal.
    pub fn finish_cancelled(&self, job_id: JobId, error: Option<JobError>) -> Option<Job> {
        let mut state = self.lock();
        let record = state.records.get_mut(&job_id)?;
        if record.job.status.is_terminal() {
            return None;
        }
        if error.is_some() {
            record.job.last_error = error;
        }
        record.cancel.cancel();
        state.finish(job_id, JobStatus::Cancelled)
    }

    /// Put a `retrying` job back in the ready index at its original
    /// position. Returns `None` if the job is no longer retrying.
    pub fn readmit(&self, job_id: JobId) -> Option<Job> {
        self.readmit_with(job_id, |_| {})
    }

    /// Like [`readmit`](Self::readmit), running `on_ready` on the queued
    /// job under the lock before it becomes claimable.
    pub fn readmit_with(&self, job_id: JobId, on_ready: impl FnOnce(&Job)) -> Option<Job> {
        let mut state = self.lock();
        let record = state.records.get_mut(&job_id)?;
        if record.job.status != JobStatus::Retrying {
            return None;
        }
        record.advance(JobStatus::Queued);
        let key = record.key();
        let job = record.job.clone();
        on_ready(&job);
        state.push_ready(key);
        drop(state);

        self.notify.notify_one();
        Some(job)
    }

    /// Fail a running job whose worker crashed, bypassing the state
    /// machine check so the record cannot stay stuck in `running`.
    /// Returns `None` if the job is unknown or already terminal.
    pub fn abandon(&self, job_id: JobId, error: JobError) -> Option<Job> {
        let mut state = self.lock();
        let record = state.records.get_mut(&job_id)?;
        if record.job.status.is_terminal() {
            return None;
        }
        let key = record.key();
        let now = Utc::now();
        record.job.status = JobStatus::Failed;
        record.job.last_error = Some(error);
        record.job.completed_at = Some(now);
        record.job.updated_at = now;
        record.attempt_started = None;
        record.cancel.cancel();
        let job = record.job.clone();
        state.pull_ready(&key);
        state.release_correlation(&job);
        Some(job)
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.lock().records.get(&job_id).map(|r| r.job.clone())
    }

    /// Snapshots of all jobs, optionally limited to one status, oldest first.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let state = self.lock();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.job.status == s))
            .collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.job.clone()).collect()
    }

    /// Counts by status and by ready priority.
    pub fn peek_stats(&self) -> QueueCounts {
        let state = self.lock();
        let mut counts = QueueCounts {
            pending: state.ready.len(),
            total: state.records.len(),
            ..QueueCounts::default()
        };
        for status in JobStatus::ALL {
            counts.by_status.insert(status.as_str().to_string(), 0);
        }
        for record in state.records.values() {
            *counts
                .by_status
                .entry(record.job.status.as_str().to_string())
                .or_default() += 1;
        }
        for priority in JobPriority::ALL {
            counts.ready_by_priority.insert(
                priority.as_str().to_string(),
                state.ready_per_priority[priority.level() as usize],
            );
        }
        counts
    }

    /// Jobs waiting out a retry backoff.
    pub fn retrying_len(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.job.status == JobStatus::Retrying)
            .count()
    }

    /// Ready jobs across all priorities.
    pub fn pending_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Running jobs whose current attempt started more than `threshold` ago.
    pub fn stuck(&self, threshold: Duration) -> Vec<Job> {
        let state = self.lock();
        state
            .records
            .values()
            .filter(|r| {
                r.job.status == JobStatus::Running
                    && r.attempt_started.is_some_and(|at| at.elapsed() > threshold)
            })
            .map(|r| r.job.clone())
            .collect()
    }

    /// Signal cancellation to every running job. Returns how many were
    /// signalled.
    pub fn cancel_running(&self) -> usize {
        let state = self.lock();
        let mut signalled = 0;
        for record in state.records.values() {
            if record.job.status == JobStatus::Running && !record.cancel.is_cancelled() {
                record.cancel.cancel();
                signalled += 1;
            }
        }
        signalled
    }

    /// Number of jobs currently running.
    pub fn running_len(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.job.status == JobStatus::Running)
            .count()
    }

    /// Drop terminal records that finished more than `max_age` ago.
    pub fn purge_finished(&self, max_age: Duration) -> Vec<JobId> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };
        let mut state = self.lock();
        let expired: Vec<JobId> = state
            .records
            .values()
            .filter(|r| {
                r.job.status.is_terminal() && r.job.completed_at.is_some_and(|at| at <= cutoff)
            })
            .map(|r| r.job.job_id)
            .collect();
        for job_id in &expired {
            state.records.remove(job_id);
        }
        expired
    }
}
