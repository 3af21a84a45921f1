//! Progress event entities.

pub mod event;
pub mod summary;

pub use event::{EventType, ProgressEvent};
pub use summary::ProgressSummary;
