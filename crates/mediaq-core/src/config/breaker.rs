//! Circuit breaker configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Thresholds for a single circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive dependency failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before a single probe is admitted.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
}

impl BreakerSettings {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
        }
    }
}

/// Circuit breaker configuration for all named dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Settings applied to any dependency without an override.
    #[serde(default)]
    pub default: BreakerSettings,
    /// Per-dependency overrides keyed by dependency name.
    #[serde(default)]
    pub dependencies: HashMap<String, BreakerSettings>,
}

impl BreakerConfig {
    /// Resolve the settings for a named dependency.
    pub fn settings_for(&self, dependency: &str) -> BreakerSettings {
        self.dependencies
            .get(dependency)
            .copied()
            .unwrap_or(self.default)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}
