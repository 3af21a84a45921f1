//! Scheduler configuration schemas.
//!
//! All configuration structs are deserialized from TOML files via the
//! `config` crate. Each sub-module represents a logical configuration
//! section, and every field carries a serde default so an empty file is a
//! valid configuration.

pub mod breaker;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

use serde::{Deserialize, Serialize};

use self::breaker::BreakerConfig;
use self::logging::LoggingConfig;
use self::progress::ProgressConfig;
use self::queue::QueueConfig;
use self::retry::RetryConfig;
use self::store::StoreConfig;
use self::worker::WorkerConfig;

use crate::error::AppError;

/// Root scheduler configuration, consumed once at scheduler construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Queue capacity and job defaults.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Backoff parameters.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breakers: BreakerConfig,
    /// Progress event retention.
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Advisory job store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SchedulerConfig {
    /// Load configuration from TOML files.
    ///
    /// Merges `config/default.toml` with an environment-specific overlay and
    /// environment variables prefixed with `MEDIAQ__`.
    pub fn load(env: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("MEDIAQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        let parsed: Self = config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load configuration from a single explicit file plus the environment.
    pub fn load_file(path: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("MEDIAQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker.concurrency == 0 {
            return Err(AppError::configuration("worker.concurrency must be at least 1"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(AppError::configuration("worker.poll_interval_ms must be positive"));
        }
        if self.worker.janitor_interval_seconds == 0 {
            return Err(AppError::configuration(
                "worker.janitor_interval_seconds must be positive",
            ));
        }
        if self.queue.max_pending == 0 || self.queue.capacity_per_priority == 0 {
            return Err(AppError::configuration(
                "queue.max_pending and queue.capacity_per_priority must be positive",
            ));
        }
        if self.queue.default_timeout_seconds == 0 {
            return Err(AppError::configuration(
                "queue.default_timeout_seconds must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.queue.default_max_retries.saturating_add(1) > self.retry.max_attempts {
            return Err(AppError::configuration(format!(
                "queue.default_max_retries ({}) exceeds retry.max_attempts ({}) - 1",
                self.queue.default_max_retries, self.retry.max_attempts
            )));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(AppError::configuration("retry.backoff_factor must be >= 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(AppError::configuration(
                "retry.max_delay_ms must not be smaller than retry.initial_delay_ms",
            ));
        }
        let thresholds = std::iter::once(("default", &self.breakers.default)).chain(
            self.breakers
                .dependencies
                .iter()
                .map(|(name, settings)| (name.as_str(), settings)),
        );
        for (name, settings) in thresholds {
            if settings.failure_threshold == 0 {
                return Err(AppError::configuration(format!(
                    "breakers.{name}.failure_threshold must be at least 1"
                )));
            }
        }
        if self.progress.max_events_per_job == 0 || self.progress.max_tracked_jobs == 0 {
            return Err(AppError::configuration(
                "progress.max_events_per_job and progress.max_tracked_jobs must be positive",
            ));
        }
        if self.store.channel_capacity == 0 {
            return Err(AppError::configuration("store.channel_capacity must be positive"));
        }
        Ok(())
    }
}
