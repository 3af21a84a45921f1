//! Job handlers and the operations they build.
//!
//! A [`JobHandler`] is registered per `job_type`. For every attempt the
//! dispatcher asks the handler to [`create`](JobHandler::create) a fresh
//! [`Operation`], runs it under the job's deadline and circuit breaker, and
//! calls [`Operation::cancel`] when the job is cancelled mid-flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use mediaq_entity::job::{FailureKind, Job, JobError};

use crate::breaker::{CircuitOpenError, DependencyFailure};
use crate::progress::ProgressReporter;

/// Dependency used when a handler does not name one.
pub const DEFAULT_DEPENDENCY: &str = "downloader";

/// How the dispatcher treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-admit after backoff while attempts remain.
    Transient,
    /// Fail the job immediately.
    Permanent,
    /// End the job as cancelled.
    Cancelled,
}

/// Error from a single execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// The dependency is unavailable; may retry.
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// The request itself can never succeed; do not retry.
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    /// The attempt exceeded its deadline.
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The dependency's breaker refused the attempt.
    #[error("Circuit '{dependency}' is open")]
    CircuitOpen {
        /// Breaker name.
        dependency: String,
        /// Time left until a probe may run.
        retry_after: Duration,
    },

    /// The job was cancelled while the attempt ran.
    #[error("Job cancelled")]
    Cancelled,
}

impl JobExecutionError {
    /// Classify the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::CircuitOpen { .. } => {
                ErrorClass::Transient
            }
            Self::Permanent(_) => ErrorClass::Permanent,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Failure kind stored on the job record.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Summary stored as the job's `last_error`.
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

impl DependencyFailure for JobExecutionError {
    fn counts_against_dependency(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<CircuitOpenError> for JobExecutionError {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitOpen {
            dependency: err.dependency,
            retry_after: err.retry_after,
        }
    }
}

/// One attempt of a job against its external dependency.
#[async_trait]
pub trait Operation: Send {
    /// Run the attempt. `deadline` is the instant the dispatcher will stop
    /// waiting; returning earlier is the operation's business.
    async fn run(&mut self, deadline: Instant) -> Result<Option<Value>, JobExecutionError>;

    /// Best-effort teardown after the job was cancelled or timed out.
    async fn cancel(&mut self) {}
}

/// Builds operations for one `job_type`.
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Job type this handler processes.
    fn job_type(&self) -> &str;

    /// Circuit breaker name guarding the handler's dependency.
    fn dependency(&self) -> &str {
        DEFAULT_DEPENDENCY
    }

    /// Reject payloads that can never succeed, before admission.
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Build the operation for the next attempt of `job`.
    fn create(
        &self,
        job: &Job,
        progress: ProgressReporter,
    ) -> Result<Box<dyn Operation>, JobExecutionError>;
}

/// Registry of handlers keyed by job type.
#[derive(Debug, Default)]
pub struct JobExecutor {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler, replacing any handler for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        tracing::info!("Registered job handler for type '{}'", job_type);
        self.handlers.insert(job_type, handler);
    }

    /// Look up the handler for `job_type`.
    pub fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a handler is registered for a job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
