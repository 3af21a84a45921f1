//! Job queue admission configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Queue capacity and per-job defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of admitted, not-yet-started jobs across all priorities.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Maximum number of admitted, not-yet-started jobs per priority band.
    #[serde(default = "default_capacity_per_priority")]
    pub capacity_per_priority: usize,
    /// Priority used when a job spec does not name one.
    #[serde(default = "default_priority")]
    pub default_priority: String,
    /// Per-attempt timeout used when a job spec does not name one.
    #[serde(default = "default_timeout")]
    pub default_timeout_seconds: u64,
    /// Retry ceiling used when a job spec does not name one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// How long terminal job records are kept before the janitor purges them.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl QueueConfig {
    /// Default per-attempt timeout as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    /// Terminal record retention as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            capacity_per_priority: default_capacity_per_priority(),
            default_priority: default_priority(),
            default_timeout_seconds: default_timeout(),
            default_max_retries: default_max_retries(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_max_pending() -> usize {
    1000
}

fn default_capacity_per_priority() -> usize {
    500
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_timeout() -> u64 {
    14400
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_hours() -> u64 {
    24
}
