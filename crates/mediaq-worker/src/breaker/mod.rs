//! Per-dependency circuit breakers.
//!
//! A breaker moves `closed -> open` after `failure_threshold` consecutive
//! dependency failures, rejects every call while open, and after
//! `recovery_timeout` admits exactly one probe (`half_open`). The probe's
//! outcome closes or re-opens the circuit.
//!
//! Failures are only counted when the error says it reflects the
//! dependency being unavailable (see [`DependencyFailure`]); request
//! specific errors pass through without touching the counter.

pub mod registry;

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use mediaq_core::config::breaker::BreakerSettings;

pub use registry::BreakerRegistry;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// A single probe call is allowed to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors that know whether they count against the dependency's health.
pub trait DependencyFailure {
    /// `true` for connection failures, 5xx, timeouts, and similar
    /// unavailability; `false` for failures specific to one request.
    fn counts_against_dependency(&self) -> bool;
}

/// Returned when a breaker refuses a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit '{dependency}' is open; retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Breaker name.
    pub dependency: String,
    /// Time left until a probe may be admitted.
    pub retry_after: Duration,
}

/// Outcome of [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call; the operation never ran.
    #[error(transparent)]
    Open(CircuitOpenError),
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive counted failures.
    pub failure_count: u32,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Configured recovery timeout in seconds.
    pub recovery_timeout_seconds: u64,
    /// When the last counted failure happened.
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
}

/// A named circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
                last_failure_at: None,
            }),
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured recovery timeout.
    pub fn recovery_timeout(&self) -> Duration {
        self.settings.recovery_timeout()
    }

    /// Current state, without side effects.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive counted failures.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Snapshot for stats reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.settings.failure_threshold,
            recovery_timeout_seconds: self.settings.recovery_timeout_seconds,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Ask for permission to make one call.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to
    /// `half_open` and hands out the single probe permit. While that probe
    /// is outstanding every other caller is rejected.
    pub fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                let recovery = self.settings.recovery_timeout();
                if elapsed >= recovery {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!("Circuit '{}' half-open, admitting probe", self.name);
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.rejection(recovery - elapsed))
                }
            }
            CircuitState::HalfOpen if inner.probe_in_flight => Err(self.rejection(Duration::ZERO)),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// The future is only polled when a permit is granted; a rejected call
    /// drops it unpolled.
    pub async fn call<Fut, T, E>(&self, operation: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: DependencyFailure,
    {
        let permit = self.acquire().map_err(BreakerError::Open)?;
        match operation.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if err.counts_against_dependency() {
                    permit.failure();
                } else {
                    permit.neutral();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        tracing::info!("Circuit '{}' manually reset", self.name);
    }

    fn rejection(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            dependency: self.name.clone(),
            retry_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        // Late results from calls admitted before the circuit opened do not
        // decide anything; only the probe may close a non-closed circuit.
        if probe || inner.state == CircuitState::Closed {
            if inner.state != CircuitState::Closed {
                tracing::info!("Circuit '{}' closed after successful probe", self.name);
            }
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Utc::now());
        if probe {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            inner.failure_count = inner.failure_count.saturating_add(1);
            tracing::warn!("Circuit '{}' probe failed, re-opening", self.name);
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        if inner.failure_count >= self.settings.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::error!(
                "Circuit '{}' opened after {} consecutive failures",
                self.name,
                inner.failure_count
            );
        }
    }

    fn on_neutral(&self, probe: bool) {
        // The dependency answered, so a probe that failed for request
        // specific reasons still proves recovery.
        if probe {
            self.on_success(true);
        }
    }

    fn on_abandoned(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }
}

/// Permission to make one call through a breaker.
///
/// Record the outcome with [`success`](Self::success),
/// [`failure`](Self::failure) or [`neutral`](Self::neutral). Dropping an
/// unresolved probe permit frees the probe slot without changing state.
#[derive(Debug)]
#[must_use = "a permit must be resolved with its call outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The call succeeded.
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    /// The call failed in a way that counts against the dependency.
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }

    /// The call failed for request-specific reasons.
    pub fn neutral(mut self) {
        self.resolved = true;
        self.breaker.on_neutral(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.resolved {
            self.breaker.on_abandoned();
        }
    }
}
