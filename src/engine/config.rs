//! Engine configuration options.

use crate::oracle::OracleConfig;
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of committed events to retain in memory.
    pub max_events: usize,
    /// Staleness and confidence bounds for oracle reads.
    pub oracle: OracleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            oracle: OracleConfig::default(),
        }
    }
}
