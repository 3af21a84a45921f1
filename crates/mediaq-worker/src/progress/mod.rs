//! Progress event tracking.

pub mod reporter;
pub mod tracker;

pub use reporter::ProgressReporter;
pub use tracker::{ProgressAggregate, ProgressTracker};
