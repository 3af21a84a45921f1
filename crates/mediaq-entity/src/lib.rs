//! # mediaq-entity
//!
//! Plain data shared by the scheduler and its callers: job records, job
//! specs, statuses, priorities, and progress events.

pub mod job;
pub mod progress;

pub use job::{Job, JobError, JobPriority, JobSpec, JobStatus};
pub use progress::{EventType, ProgressEvent, ProgressSummary};
