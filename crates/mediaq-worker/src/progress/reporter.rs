//! Handle given to running operations for publishing progress.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use mediaq_core::JobId;
use mediaq_entity::progress::EventType;

use super::tracker::ProgressTracker;

/// Records progress events for a single job.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    tracker: Arc<ProgressTracker>,
}

impl ProgressReporter {
    /// Create a reporter bound to `job_id`.
    pub fn new(job_id: JobId, tracker: Arc<ProgressTracker>) -> Self {
        Self { job_id, tracker }
    }

    /// Job this reporter publishes for.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report a completion percentage.
    pub fn percentage(&self, percentage: f64) {
        self.emit(EventType::Progress, json!({ "percentage": percentage }));
    }

    /// Report transferred bytes; the percentage is derived when `total_bytes`
    /// is known.
    pub fn transfer(&self, current_bytes: u64, total_bytes: u64, speed_bps: f64) {
        self.emit(
            EventType::Progress,
            json!({
                "current_bytes": current_bytes,
                "total_bytes": total_bytes,
                "speed_bps": speed_bps,
            }),
        );
    }

    /// Report that the transfer finished and post-processing started.
    pub fn post_processing(&self, stage: &str) {
        self.emit(EventType::PostProcessing, json!({ "stage": stage }));
    }

    /// Report arbitrary progress details.
    pub fn details(&self, details: Map<String, Value>) {
        self.tracker.record(self.job_id, EventType::Progress, details);
    }

    fn emit(&self, event_type: EventType, details: Value) {
        let details = match details {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.tracker.record(self.job_id, event_type, details);
    }
}
