//! Worker pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker pool (dispatcher) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots (W).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum time an idle slot waits for the queue before re-polling.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Maximum time a draining shutdown waits before force-cancelling.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Interval between purges of expired terminal job records.
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_seconds: u64,
    /// Running attempts older than this are reported as stuck.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_job_threshold_seconds: u64,
}

impl WorkerConfig {
    /// Idle poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Drain deadline as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    /// Janitor interval as a [`Duration`].
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_seconds)
    }

    /// Stuck-attempt threshold as a [`Duration`].
    pub fn stuck_job_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_job_threshold_seconds)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            drain_timeout_seconds: default_drain_timeout(),
            janitor_interval_seconds: default_janitor_interval(),
            stuck_job_threshold_seconds: default_stuck_threshold(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}

fn default_poll_interval() -> u64 {
    250
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_janitor_interval() -> u64 {
    60
}

fn default_stuck_threshold() -> u64 {
    3600
}
