pub mod defaults;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stability::state::{CircuitSettings, PermissionStrategyKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub defaults: CircuitDefaults,
    /// Per-circuit overrides, keyed by circuit id.
    #[serde(default)]
    pub circuits: HashMap<String, CircuitOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub filename: String,
    pub enable_wal: bool,
    pub busy_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub cache_staleness_ms: u64,
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitDefaults {
    pub failure_threshold: u32,
    pub break_duration_ms: u64,
    pub strategy: PermissionStrategyKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitOverrides {
    pub failure_threshold: Option<u32>,
    pub break_duration_ms: Option<u64>,
    pub strategy: Option<PermissionStrategyKind>,
}

impl BreakerConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = config_path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            Self::from_toml(&config_str)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory: {}", config.data_dir.display()))?;

        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database.filename)
    }

    /// Settings a circuit gets when it is first referenced.
    pub fn settings_for(&self, circuit_id: &str) -> CircuitSettings {
        let mut settings = self.defaults.to_settings();

        if let Some(overrides) = self.circuits.get(circuit_id) {
            if let Some(threshold) = overrides.failure_threshold {
                settings.failure_threshold = threshold;
            }
            if let Some(break_ms) = overrides.break_duration_ms {
                settings.break_duration = Duration::from_millis(break_ms);
            }
            if let Some(strategy) = overrides.strategy {
                settings.strategy = strategy;
            }
        }

        settings
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.database.filename.trim().is_empty() {
            return Err(anyhow::anyhow!("Database filename must not be empty"));
        }

        if self.database.operation_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Database operation timeout must be greater than 0"));
        }

        if self.database.busy_timeout_ms > self.database.operation_timeout_ms {
            return Err(anyhow::anyhow!(
                "Database busy timeout ({}ms) must not exceed the operation timeout ({}ms)",
                self.database.busy_timeout_ms,
                self.database.operation_timeout_ms
            ));
        }

        validate_settings("defaults", &self.defaults.to_settings())?;

        for circuit_id in self.circuits.keys() {
            if circuit_id.is_empty() || circuit_id.len() > defaults::MAX_CIRCUIT_ID_LENGTH {
                return Err(anyhow::anyhow!(
                    "Circuit id '{}' must be between 1 and {} characters",
                    circuit_id,
                    defaults::MAX_CIRCUIT_ID_LENGTH
                ));
            }
            validate_settings(circuit_id, &self.settings_for(circuit_id))?;
        }

        Ok(())
    }
}

fn validate_settings(scope: &str, settings: &CircuitSettings) -> Result<()> {
    settings
        .validate()
        .map_err(|message| anyhow::anyhow!("Invalid settings for '{}': {}", scope, message))
}

impl CircuitDefaults {
    pub fn to_settings(&self) -> CircuitSettings {
        CircuitSettings {
            failure_threshold: self.failure_threshold,
            break_duration: Duration::from_millis(self.break_duration_ms),
            strategy: self.strategy,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(defaults::DATA_DIR_NAME)
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: DatabaseConfig::default(),
            defaults: CircuitDefaults::default(),
            circuits: HashMap::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            filename: defaults::DEFAULT_DB_FILENAME.to_string(),
            enable_wal: true,
            busy_timeout_ms: defaults::DEFAULT_BUSY_TIMEOUT_MS,
            operation_timeout_ms: defaults::DEFAULT_OPERATION_TIMEOUT_MS,
            cache_staleness_ms: defaults::DEFAULT_CACHE_STALENESS_MS,
            cache_max_entries: defaults::DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl Default for CircuitDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::DEFAULT_FAILURE_THRESHOLD,
            break_duration_ms: defaults::DEFAULT_BREAK_DURATION_MS,
            strategy: PermissionStrategyKind::ConsistencyPriority,
        }
    }
}
