//! Ambient configuration for the core runtime: nothing here is vendor- or
//! pipeline-specific. Concrete agents, prompts, and schema validators supply
//! their own configuration externally; this only covers knobs the core
//! components themselves read (timeouts, retry/backoff defaults, nesting
//! limits, storage paths, logging).
use crate::errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            runtime: RuntimeConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Defaults for the knobs individual components expose as constructor
/// parameters or `with_*` builders (circuit breaker thresholds live on
/// [`crate::circuit_breaker::CircuitBreakerConfig`] directly and are not
/// duplicated here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default bound passed to `AgentRuntime::process_with_validation` when
    /// a caller doesn't supply its own.
    #[serde(default = "default_process_timeout_secs")]
    pub default_process_timeout_secs: u64,

    /// Default TTL for ephemeral contexts (`ContextStore`).
    #[serde(default = "default_ephemeral_ttl_secs")]
    pub ephemeral_context_ttl_secs: u64,

    /// Default `PhaseCoordinator` nesting limit.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: u32,

    /// Default `ReflectivePipeline` retry policy.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_process_timeout_secs: default_process_timeout_secs(),
            ephemeral_context_ttl_secs: default_ephemeral_ttl_secs(),
            max_nesting_depth: default_max_nesting_depth(),
            max_retries: default_max_retries(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

fn default_process_timeout_secs() -> u64 {
    30
}

fn default_ephemeral_ttl_secs() -> u64 {
    3600
}

fn default_max_nesting_depth() -> u32 {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_stage_timeout_secs() -> u64 {
    30
}

/// Where the optional [`crate::ports::DurableBackingStore`] implementation,
/// if any, persists snapshots. The in-memory store works without any of
/// this being configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub base_path: String,

    #[serde(default)]
    pub enable_durable_backing_store: bool,

    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_storage_path(),
            enable_durable_backing_store: false,
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_storage_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.core-runtime", home)
}

fn default_snapshot_path() -> String {
    "snapshots".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default)]
    pub targets: LogTargets,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            targets: LogTargets::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTargets {
    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

impl Default for LogTargets {
    fn default() -> Self {
        Self {
            stdout: true,
            file: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileConfig {
    pub path: String,

    #[serde(default = "default_max_log_size")]
    pub max_size_mb: u64,

    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
}

fn default_max_log_size() -> u64 {
    100
}

fn default_max_backups() -> u32 {
    10
}

/// Loads, validates, and persists [`CoreConfig`]. Holds the config plus the
/// path it was loaded from so `save()` round-trips without the caller
/// threading the path through separately.
pub struct ConfigManager {
    config: CoreConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn load(config_path: Option<&Path>) -> CoreResult<Self> {
        let path = if let Some(p) = config_path {
            p.to_path_buf()
        } else if let Ok(home) = std::env::var("HOME") {
            let default_path = PathBuf::from(home).join(".core-runtime/config.toml");
            if default_path.exists() {
                default_path
            } else {
                PathBuf::from(".core-runtime/config.toml")
            }
        } else {
            PathBuf::from(".core-runtime/config.toml")
        };

        let config = if path.exists() {
            info!("loading config from {:?}", path);
            let content = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Configuration(format!("failed to read config file: {}", e)))?;
            toml::from_str(&content)
                .map_err(|e| CoreError::Configuration(format!("failed to parse config file: {}", e)))?
        } else {
            warn!("config file not found at {:?}, using defaults", path);
            CoreConfig::default()
        };

        debug!("configuration loaded successfully");
        Ok(ConfigManager { config, config_path: path })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CoreConfig {
        &mut self.config
    }

    pub fn save(&self) -> CoreResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Configuration(format!("failed to create config directory: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| CoreError::Configuration(format!("failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| CoreError::Configuration(format!("failed to write config file: {}", e)))?;

        info!("configuration saved to {:?}", self.config_path);
        Ok(())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.config.runtime.max_nesting_depth == 0 {
            return Err(CoreError::Configuration("max_nesting_depth must be greater than 0".to_string()));
        }
        if self.config.runtime.max_retries == 0 {
            return Err(CoreError::Configuration("max_retries must be greater than 0".to_string()));
        }
        if self.config.runtime.default_process_timeout_secs == 0 {
            return Err(CoreError::Configuration("default_process_timeout_secs must be greater than 0".to_string()));
        }
        debug!("configuration validation passed");
        Ok(())
    }

    /// Overlay values sourced from the environment. Only a small surface is
    /// meaningful here since the core carries no vendor secrets.
    pub fn load_from_env(&mut self) -> CoreResult<()> {
        if let Ok(level) = std::env::var("CORE_LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Ok(secs) = std::env::var("CORE_DEFAULT_PROCESS_TIMEOUT_SECS") {
            if let Ok(parsed) = secs.parse() {
                self.config.runtime.default_process_timeout_secs = parsed;
            }
        }
        info!("configuration overlaid from environment variables");
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_versions() {
        let config = CoreConfig::default();
        assert_eq!(config.version, "1.0.0");
        assert_eq!(config.runtime.max_nesting_depth, 4);
    }

    #[test]
    fn validate_rejects_zero_nesting_depth() {
        let mut config = CoreConfig::default();
        config.runtime.max_nesting_depth = 0;
        let manager = ConfigManager { config, config_path: PathBuf::from("/tmp/test.toml") };
        assert!(manager.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_retries() {
        let mut config = CoreConfig::default();
        config.runtime.max_retries = 0;
        let manager = ConfigManager { config, config_path: PathBuf::from("/tmp/test.toml") };
        assert!(manager.validate().is_err());
    }
}
