//! Scheduler counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-lifetime scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Jobs admitted
    pub enqueued: AtomicU64,
    /// Enqueue calls rejected for capacity
    pub rejected: AtomicU64,
    /// Attempts started
    pub attempts: AtomicU64,
    /// Jobs completed
    pub completed: AtomicU64,
    /// Jobs failed for good
    pub failed: AtomicU64,
    /// Retries scheduled
    pub retried: AtomicU64,
    /// Jobs cancelled
    pub cancelled: AtomicU64,
    /// Attempts that hit their deadline
    pub timed_out: AtomicU64,
    /// Attempts refused by an open circuit
    pub circuit_rejections: AtomicU64,
    /// Attempts that panicked inside a worker
    pub worker_panics: AtomicU64,
    /// Mirror writes that failed or were dropped
    pub mirror_errors: AtomicU64,
    /// Workers currently executing a job
    pub workers_busy: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a worker busy
    pub fn worker_started(&self) {
        self.workers_busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a worker idle
    pub fn worker_finished(&self) {
        self.workers_busy.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
            mirror_errors: self.mirror_errors.load(Ordering::Relaxed),
            workers_busy: self.workers_busy.load(Ordering::Relaxed),
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Jobs admitted
    pub enqueued: u64,
    /// Enqueue calls rejected for capacity
    pub rejected: u64,
    /// Attempts started
    pub attempts: u64,
    /// Jobs completed
    pub completed: u64,
    /// Jobs failed for good
    pub failed: u64,
    /// Retries scheduled
    pub retried: u64,
    /// Jobs cancelled
    pub cancelled: u64,
    /// Attempts that hit their deadline
    pub timed_out: u64,
    /// Attempts refused by an open circuit
    pub circuit_rejections: u64,
    /// Attempts that panicked inside a worker
    pub worker_panics: u64,
    /// Mirror writes that failed or were dropped
    pub mirror_errors: u64,
    /// Workers currently executing a job
    pub workers_busy: u64,
}
