//! Derived per-job progress summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mediaq_core::JobId;

use super::event::EventType;

/// Latest progress fields for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    /// Job the summary describes.
    pub job_id: JobId,
    /// Most recent lifecycle event (anything except `progress`).
    pub phase: EventType,
    /// Completion percentage in `[0, 100]`.
    pub percentage: f64,
    /// Bytes processed so far.
    pub current_bytes: u64,
    /// Total bytes expected, `0` when unknown.
    pub total_bytes: u64,
    /// Transfer rate in bytes per second.
    pub speed_bps: f64,
    /// Estimated seconds remaining, when derivable.
    pub eta_seconds: Option<f64>,
    /// Timestamp of the newest event in the trail.
    pub updated_at: DateTime<Utc>,
    /// Events currently retained for the job.
    pub event_count: usize,
}
