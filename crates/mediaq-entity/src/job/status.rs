//! Job status and priority enumerations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a scheduled job.
///
/// Transitions only move forward:
/// `pending -> queued -> running -> {completed | failed | cancelled | retrying}`
/// and `retrying -> queued`. Cancellation is also accepted from `pending`,
/// `queued`, and `retrying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, admission not yet complete.
    Pending,
    /// Admitted and visible to dequeue.
    Queued,
    /// Exclusively owned by a worker.
    Running,
    /// Waiting out a backoff delay before re-admission.
    Retrying,
    /// Successfully completed.
    Completed,
    /// Failed permanently or exhausted its retries.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Retrying)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }

    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A status change that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal job status transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Status the job was in.
    pub from: JobStatus,
    /// Status that was requested.
    pub to: JobStatus,
}

/// Priority level for a job. Higher levels are dequeued first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Processed last.
    Lowest = 0,
    /// Low priority.
    Low = 1,
    /// Normal priority (default).
    #[default]
    Normal = 2,
    /// High priority.
    High = 3,
    /// Processed first.
    Critical = 4,
}

impl JobPriority {
    /// Every priority, lowest first.
    pub const ALL: [JobPriority; 5] = [
        Self::Lowest,
        Self::Low,
        Self::Normal,
        Self::High,
        Self::Critical,
    ];

    /// Return the numeric priority (higher = more urgent).
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Return the priority as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lowest" | "0" => Ok(Self::Lowest),
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            "critical" | "4" => Ok(Self::Critical),
            other => Err(format!("unknown job priority '{other}'")),
        }
    }
}
