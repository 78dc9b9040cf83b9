//! Runtime configuration
//!
//! Loaded from YAML, then overridden from `CASCADE_*` environment variables.
//! Every section falls back to its defaults when absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::errors::{CascadeError, Result};
use crate::execution::ExecutionPolicy;
use crate::health::{HealthThresholds, HealthTracker};
use crate::observer::ObserverConfig;
use crate::scheduler::SchedulerConfig;
use crate::state::{JsonFileStateStore, MemoryStateStore, RunStateStore, SledStateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sled,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Run state file for the json backend; the sled backend mirrors into it
    pub state_path: PathBuf,
    /// Database directory for the sled backend
    pub sled_path: PathBuf,
    /// Health state file; `None` keeps health in memory only
    pub health_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            state_path: PathBuf::from(".cascade/run-state.json"),
            sled_path: PathBuf::from(".cascade/state.db"),
            health_path: Some(PathBuf::from(".cascade/agent-state.json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// Accept dependency cycles instead of rejecting the registry
    pub allow_cycles: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("registry.yml"),
            allow_cycles: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub cascade_id: String,
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionPolicy,
    pub health: HealthThresholds,
    pub observer: ObserverConfig,
    /// Delay of the built-in simulated executor
    pub simulated_delay_ms: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            cascade_id: "cascade".to_string(),
            registry: RegistryConfig::default(),
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            execution: ExecutionPolicy::default(),
            health: HealthThresholds::default(),
            observer: ObserverConfig::default(),
            simulated_delay_ms: 2_000,
        }
    }
}

impl CascadeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CascadeError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `CASCADE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; `apply_env` uses the environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("CASCADE_ID") {
            self.cascade_id = id;
        }
        if let Some(path) = lookup("CASCADE_REGISTRY") {
            self.registry.path = PathBuf::from(path);
        }
        if let Some(path) = lookup("CASCADE_STATE_PATH") {
            self.storage.state_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("CASCADE_HEALTH_PATH") {
            self.storage.health_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(value) = lookup("CASCADE_MAX_TICKS") {
            self.scheduler.max_ticks = Some(parse_number(&value, "CASCADE_MAX_TICKS")?);
        }
        if let Some(value) = lookup("CASCADE_TICK_DELAY_MS") {
            self.scheduler.tick_delay_ms = parse_number(&value, "CASCADE_TICK_DELAY_MS")?;
        }
        Ok(())
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.cascade_id.trim().is_empty() {
            return Err(CascadeError::configuration_field(
                "cascade_id must not be empty",
                "cascade_id",
            ));
        }
        if self.registry.path.as_os_str().is_empty() {
            return Err(CascadeError::configuration_field(
                "registry path must not be empty",
                "registry.path",
            ));
        }
        self.scheduler.validate()?;
        self.execution.validate()?;
        self.health.validate()?;
        self.observer.validate()?;
        Ok(())
    }

    /// Open the configured run state store for the process driving the run
    pub fn open_store(&self) -> Result<Arc<dyn RunStateStore>> {
        Ok(match self.storage.backend {
            StorageBackend::Json => Arc::new(JsonFileStateStore::new(&self.storage.state_path)),
            StorageBackend::Sled => Arc::new(
                SledStateStore::open(&self.storage.sled_path, &self.cascade_id)?
                    .with_mirror(&self.storage.state_path),
            ),
            StorageBackend::Memory => Arc::new(MemoryStateStore::new()),
        })
    }

    /// Open a store that reads the run while another process drives it.
    ///
    /// The sled database is locked by its writer, so both file-backed backends
    /// are read through the JSON file at `state_path`.
    pub fn open_reader(&self) -> Result<Arc<dyn RunStateStore>> {
        match self.storage.backend {
            StorageBackend::Json | StorageBackend::Sled => {
                Ok(Arc::new(JsonFileStateStore::new(&self.storage.state_path)))
            }
            StorageBackend::Memory => Err(CascadeError::configuration_field(
                "the memory backend keeps no state another process can read",
                "storage.backend",
            )),
        }
    }

    /// Health tracker for the configured file, seeded from what earlier runs wrote
    pub async fn health_tracker(&self) -> Result<HealthTracker> {
        match &self.storage.health_path {
            Some(path) => HealthTracker::open(self.health, path).await,
            None => Ok(HealthTracker::new(self.health)),
        }
    }
}

fn parse_number(value: &str, key: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        CascadeError::configuration_field(format!("{key} must be a number, got '{value}'"), key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RecoveryMode;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = CascadeConfig::from_yaml("").unwrap();
        assert_eq!(config, CascadeConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = CascadeConfig::from_yaml(
            r#"
cascade_id: phase-1b
storage:
  backend: sled
scheduler:
  halt_on_failure: true
  recovery_mode: mark_failed
execution:
  max_attempts: 3
  retry_strategy:
    kind: linear
    delay_ms: 250
"#,
        )
        .unwrap();

        assert_eq!(config.cascade_id, "phase-1b");
        assert_eq!(config.storage.backend, StorageBackend::Sled);
        assert_eq!(config.storage.state_path, StorageConfig::default().state_path);
        assert!(config.scheduler.halt_on_failure);
        assert_eq!(config.scheduler.recovery_mode, RecoveryMode::MarkFailed);
        assert_eq!(config.scheduler.tick_delay_ms, 1_000);
        assert_eq!(config.execution.max_attempts, 3);
        assert_eq!(config.observer.alert_every, 3);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CASCADE_ID", "nightly"),
            ("CASCADE_STATE_PATH", "/tmp/state.json"),
            ("CASCADE_HEALTH_PATH", ""),
            ("CASCADE_MAX_TICKS", "12"),
            ("CASCADE_TICK_DELAY_MS", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = CascadeConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cascade_id, "nightly");
        assert_eq!(config.storage.state_path, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.storage.health_path, None);
        assert_eq!(config.scheduler.max_ticks, Some(12));
        assert_eq!(config.scheduler.tick_delay_ms, 0);
    }

    #[test]
    fn test_bad_override_is_a_configuration_error() {
        let mut config = CascadeConfig::default();
        let err = config
            .apply_overrides(|key| (key == "CASCADE_MAX_TICKS").then(|| "ten".to_string()))
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_validation_reaches_sections() {
        let mut config = CascadeConfig::default();
        config.observer.alert_every = 0;
        assert!(config.validate().is_err());

        let mut config = CascadeConfig::default();
        config.cascade_id = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_backend_has_no_reader() {
        let mut config = CascadeConfig::default();
        assert!(config.open_reader().is_ok());

        config.storage.backend = StorageBackend::Memory;
        let err = config.open_reader().err().unwrap();
        assert_eq!(err.category(), "configuration");
    }
}
