//! Exponential retry backoff.
//!
//! The policy is pure: `delay(n)` depends only on the attempt number and
//! the configured parameters. No jitter is applied, so a sequence of
//! failures always produces the same schedule.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use mediaq_core::config::retry::RetryConfig;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Whether the failed operation may be attempted again.
    fn is_retryable(&self) -> bool;
}

/// Deterministic exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy from explicit parameters.
    pub fn new(
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            backoff_factor,
            max_delay,
            max_attempts,
        }
    }

    /// Build a policy from the `[retry]` configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_delay(),
            config.backoff_factor,
            config.max_delay(),
            config.max_attempts,
        )
    }

    /// Ceiling on total attempts, first run included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// `min(initial_delay * backoff_factor^(attempt - 1), max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether the policy allows running attempt number `attempt`.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached. The closure receives the 1-based attempt.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || !self.allows(attempt + 1) => return Err(err),
                Err(err) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
