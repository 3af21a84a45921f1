//! Job domain entities.

pub mod model;
pub mod spec;
pub mod status;

pub use model::{FailureKind, Job, JobError};
pub use spec::JobSpec;
pub use status::{InvalidTransition, JobPriority, JobStatus};
