//! Engine Configuration
//!
//! Runtime knobs for the engine and Supervisor, loadable from YAML.
//!
//! # Example YAML Format
//!
//! ```yaml
//! supervisor_interval_secs: 60
//! max_parallel_dispatch: 8
//! service_call_timeout_secs: 20
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tunable engine settings. Missing keys fall back to defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between Supervisor cycles
    pub supervisor_interval_secs: u64,

    /// Maximum step dispatches running at once
    pub max_parallel_dispatch: usize,

    /// Upper bound on a single SERVICE_CALL invocation
    pub service_call_timeout_secs: u64,

    /// How many times an internal compare-and-swap conflict is retried
    pub max_conflict_retries: u32,

    /// Priority assigned to instances started without one
    pub default_priority: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor_interval_secs: 30,
            max_parallel_dispatch: num_cpus::get().max(1),
            service_call_timeout_secs: 30,
            max_conflict_retries: 5,
            default_priority: 5,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;

        let config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Failed to parse '{}': {}", path.display(), e)))?;
        config.validate()?;

        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Rejects settings the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.supervisor_interval_secs == 0 {
            return Err(EngineError::Config(
                "supervisor_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_parallel_dispatch == 0 {
            return Err(EngineError::Config(
                "max_parallel_dispatch must be greater than zero".to_string(),
            ));
        }
        if self.service_call_timeout_secs == 0 {
            return Err(EngineError::Config(
                "service_call_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs)
    }

    pub fn service_call_timeout(&self) -> Duration {
        Duration::from_secs(self.service_call_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.supervisor_interval(), Duration::from_secs(30));
        assert!(config.max_parallel_dispatch >= 1);
    }

    #[test]
    fn test_load_partial_yaml_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "supervisor_interval_secs: 5\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.supervisor_interval_secs, 5);
        assert_eq!(config.service_call_timeout_secs, 30);
        assert_eq!(config.max_conflict_retries, 5);
    }

    #[test]
    fn test_load_rejects_zero_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "supervisor_interval_secs: 0\n").unwrap();

        let result = EngineConfig::load(&path);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load("/nonexistent/engine.yaml");
        assert!(result.is_err());
    }
}
