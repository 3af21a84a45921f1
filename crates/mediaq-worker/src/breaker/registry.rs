//! Named breaker registry.

use std::sync::Arc;

use dashmap::DashMap;

use mediaq_core::config::breaker::BreakerConfig;

use super::{BreakerSnapshot, CircuitBreaker};

/// Lazily-created breakers, one per dependency name.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create an empty registry.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for `dependency`, creating it on first use.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating circuit breaker '{}'", dependency);
                Arc::new(CircuitBreaker::new(
                    dependency,
                    self.config.settings_for(dependency),
                ))
            });
        Arc::clone(entry.value())
    }

    /// Snapshots of every breaker created so far, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
