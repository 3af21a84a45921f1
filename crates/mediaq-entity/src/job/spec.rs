//! Caller-supplied job specification.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::status::JobPriority;

/// Input to `Scheduler::enqueue`. Unset fields take the queue defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobSpec {
    /// External task identifier; one active job per correlation id.
    #[validate(length(min = 1, max = 256))]
    pub correlation_id: String,
    /// Handler type (e.g. `"command"`).
    #[validate(length(min = 1, max = 64))]
    pub job_type: String,
    /// Priority band.
    #[serde(default)]
    pub priority: Option<JobPriority>,
    /// Ceiling on retryable failures.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Per-attempt deadline in milliseconds.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub timeout_ms: Option<u64>,
    /// Handler-specific parameters.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JobSpec {
    /// Create a spec with queue defaults for every optional field.
    pub fn new(correlation_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            job_type: job_type.into(),
            priority: None,
            max_retries: None,
            timeout_ms: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Set the priority band.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the handler payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
