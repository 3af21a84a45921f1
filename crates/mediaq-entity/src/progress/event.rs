//! Immutable progress events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mediaq_core::JobId;

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Job admitted.
    Created,
    /// An attempt started.
    Started,
    /// Transfer/encode progress report.
    Progress,
    /// The operation entered its post-processing phase.
    PostProcessing,
    /// Job completed.
    Completed,
    /// An attempt failed, or the job failed for good.
    Failed,
    /// Job cancelled.
    Cancelled,
}

impl EventType {
    /// Check whether the event closes a job's trail.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Return the event type as a snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::PostProcessing => "post_processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable, append-only progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Job the event belongs to.
    pub job_id: JobId,
    /// Event kind.
    pub event_type: EventType,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form details (bytes transferred, speed, percentage, error, ...).
    pub details: Map<String, Value>,
}

impl ProgressEvent {
    /// Create an event stamped with the current time.
    pub fn new(job_id: JobId, event_type: EventType, details: Map<String, Value>) -> Self {
        Self {
            job_id,
            event_type,
            timestamp: Utc::now(),
            details,
        }
    }

    /// Read a numeric detail.
    pub fn detail_f64(&self, key: &str) -> Option<f64> {
        self.details.get(key).and_then(Value::as_f64)
    }

    /// Read an unsigned integer detail.
    pub fn detail_u64(&self, key: &str) -> Option<u64> {
        self.details.get(key).and_then(Value::as_u64)
    }

    /// Read a boolean detail.
    pub fn detail_bool(&self, key: &str) -> Option<bool> {
        self.details.get(key).and_then(Value::as_bool)
    }
}
