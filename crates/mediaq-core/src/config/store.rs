//! Advisory job store (write-behind mirror) configuration.

use serde::{Deserialize, Serialize};

/// Write-behind mirror settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Whether job records are mirrored at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pending mirror writes buffered before updates are dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Circuit breaker name guarding mirror writes.
    #[serde(default = "default_dependency")]
    pub dependency: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            channel_capacity: default_channel_capacity(),
            dependency: default_dependency(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_dependency() -> String {
    "cache-backend".to_string()
}
