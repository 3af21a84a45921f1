//! Job entity model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mediaq_core::JobId;

use super::status::{InvalidTransition, JobPriority, JobStatus};

/// Failure category recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, dependency, or otherwise recoverable failure.
    Transient,
    /// Logically unrecoverable failure.
    Permanent,
    /// The attempt exceeded its deadline.
    Timeout,
    /// The dependency's circuit breaker rejected the attempt.
    CircuitOpen,
    /// The job was cancelled mid-execution.
    Cancelled,
}

impl FailureKind {
    /// Return the kind as a snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Last captured failure summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl JobError {
    /// Create a new failure summary.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A schedulable unit of retryable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, assigned at enqueue time.
    pub job_id: JobId,
    /// Identifier of the external task this job represents.
    pub correlation_id: String,
    /// Handler type used to build the external operation.
    pub job_type: String,
    /// Circuit breaker name guarding this job's dependency.
    pub dependency: String,
    /// Job priority; immutable once enqueued.
    pub priority: JobPriority,
    /// Current job status.
    pub status: JobStatus,
    /// Execution attempts so far.
    pub attempt: u32,
    /// Ceiling on retryable failures.
    pub max_retries: u32,
    /// Hard deadline for a single attempt.
    pub timeout: Duration,
    /// Handler-specific parameters.
    pub payload: serde_json::Value,
    /// Result data on completion.
    pub result: Option<serde_json::Value>,
    /// Last captured failure; cleared on success.
    pub last_error: Option<JobError>,
    /// When the job was admitted.
    pub enqueued_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Total attempts this job may make (first run included).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Check whether another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts()
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the forward-only state machine.
    ///
    /// Terminal transitions stamp `completed_at`.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Record the start of a new attempt.
    pub fn begin_attempt(&mut self) {
        let now = Utc::now();
        self.attempt += 1;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Wall-clock time between first start and completion.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
