//! Asynchronous job execution core for mediaq.
//!
//! This crate provides:
//! - A priority job queue with an atomic claim operation
//! - A bounded worker pool (dispatcher) with cooperative cancellation
//! - Deterministic exponential retry backoff
//! - Per-dependency circuit breakers
//! - A bounded, append-only progress event tracker
//! - The [`Scheduler`] facade that owns all of the above
//! - An advisory write-behind job store
//! - A built-in handler that runs external commands

pub mod breaker;
pub mod executor;
pub mod jobs;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod retry;
mod runner;
pub mod scheduler;
pub mod store;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use executor::{ErrorClass, JobExecutionError, JobExecutor, JobHandler, Operation};
pub use jobs::CommandJobHandler;
pub use progress::{ProgressReporter, ProgressTracker};
pub use queue::JobQueue;
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats, ShutdownReport};
pub use store::{JobStore, MemoryJobStore, StoreError};
