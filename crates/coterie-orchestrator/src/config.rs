use crate::engine::EngineConfig;
use coterie_bus::BusConfig;
use coterie_coordinator::CoordinatorConfig;
use coterie_core::{CoterieError, CoterieResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Aggregate configuration for a full orchestration stack, loadable from
/// TOML. Every section and every field is optional; omissions fall back
/// to defaults.
///
/// ```toml
/// [bus]
/// history_capacity = 5000
///
/// [coordinator]
/// max_workers = 8
///
/// [coordinator.breaker]
/// failure_threshold = 5
///
/// [engine]
/// max_concurrent_tasks = 8
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Message bus settings.
    #[serde(default)]
    pub bus: BusConfig,
    /// Task coordinator settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Workflow engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl OrchestrationConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> CoterieResult<Self> {
        toml::from_str(toml_str).map_err(|e| CoterieError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> CoterieResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
