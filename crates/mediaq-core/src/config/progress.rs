//! Progress event retention configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retention limits for per-job progress trails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Events kept per job; older events are evicted first.
    #[serde(default = "default_max_events")]
    pub max_events_per_job: usize,
    /// Time a trail is kept after its last append.
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    /// Maximum number of job trails held at once.
    #[serde(default = "default_max_tracked_jobs")]
    pub max_tracked_jobs: u64,
}

impl ProgressConfig {
    /// Trail retention as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_events_per_job: default_max_events(),
            retention_seconds: default_retention(),
            max_tracked_jobs: default_max_tracked_jobs(),
        }
    }
}

fn default_max_events() -> usize {
    100
}

fn default_retention() -> u64 {
    86400 * 7
}

fn default_max_tracked_jobs() -> u64 {
    10_000
}
