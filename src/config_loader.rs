//! Configuration file discovery: filesystem-based config loading with
//! environment variable overrides and directory bootstrapping, layered on
//! top of [`crate::config::ConfigManager`].
use crate::config::{ConfigManager, CoreConfig};
use crate::errors::{CoreError, CoreResult};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration file discovery strategy.
#[derive(Debug, Clone)]
pub enum ConfigDiscoveryStrategy {
    /// Check in order: `./.core-runtime/config.toml`, `~/.core-runtime/config.toml`, `CORE_RUNTIME_CONFIG` env var.
    Default,
    Explicit(PathBuf),
    EnvironmentOnly,
}

pub struct ConfigLoader {
    strategy: ConfigDiscoveryStrategy,
    discovered_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            strategy: ConfigDiscoveryStrategy::Default,
            discovered_path: None,
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            strategy: ConfigDiscoveryStrategy::Explicit(path),
            discovered_path: None,
        }
    }

    pub fn env_only() -> Self {
        Self {
            strategy: ConfigDiscoveryStrategy::EnvironmentOnly,
            discovered_path: None,
        }
    }

    fn discover_config_path(&self) -> CoreResult<Option<PathBuf>> {
        match &self.strategy {
            ConfigDiscoveryStrategy::Explicit(path) => {
                debug!("using explicit config path: {:?}", path);
                Ok(Some(path.clone()))
            }
            ConfigDiscoveryStrategy::EnvironmentOnly => match env::var("CORE_RUNTIME_CONFIG") {
                Ok(path) => {
                    debug!("found CORE_RUNTIME_CONFIG environment variable: {}", path);
                    Ok(Some(PathBuf::from(path)))
                }
                Err(_) => {
                    warn!("CORE_RUNTIME_CONFIG not set, will use defaults");
                    Ok(None)
                }
            },
            ConfigDiscoveryStrategy::Default => {
                let local_config = PathBuf::from(".core-runtime/config.toml");
                if local_config.exists() {
                    debug!("found config at: {:?}", local_config);
                    return Ok(Some(local_config));
                }

                if let Ok(home) = env::var("HOME") {
                    let home_config = PathBuf::from(home).join(".core-runtime/config.toml");
                    if home_config.exists() {
                        debug!("found config at: {:?}", home_config);
                        return Ok(Some(home_config));
                    }
                }

                if let Ok(env_config) = env::var("CORE_RUNTIME_CONFIG") {
                    let env_path = PathBuf::from(env_config);
                    if env_path.exists() {
                        debug!("found config via CORE_RUNTIME_CONFIG: {:?}", env_path);
                        return Ok(Some(env_path));
                    } else {
                        warn!("CORE_RUNTIME_CONFIG points to non-existent file: {:?}", env_path);
                    }
                }

                debug!("no config file found, will use defaults");
                Ok(None)
            }
        }
    }

    pub fn load(mut self) -> CoreResult<(ConfigManager, PathBuf)> {
        let config_path = self.discover_config_path()?;
        self.discovered_path = config_path.clone();

        let mut config_manager = if let Some(path) = &config_path {
            info!("loading configuration from: {:?}", path);
            if !path.exists() {
                return Err(CoreError::Configuration(format!("config file not found: {:?}", path)));
            }
            ConfigManager::load(Some(path))?
        } else {
            info!("no config file found, using defaults");
            ConfigManager::load(None)?
        };

        self.apply_env_overrides(&mut config_manager)?;
        config_manager.validate()?;

        let discovered_or_default = config_path.unwrap_or_else(|| {
            if let Ok(home) = env::var("HOME") {
                PathBuf::from(home).join(".core-runtime/config.toml")
            } else {
                PathBuf::from(".core-runtime/config.toml")
            }
        });

        info!("configuration loaded and validated successfully");
        Ok((config_manager, discovered_or_default))
    }

    fn apply_env_overrides(&self, config_manager: &mut ConfigManager) -> CoreResult<()> {
        let config = config_manager.config_mut();

        if let Ok(path) = env::var("CORE_RUNTIME_STORAGE_PATH") {
            debug!("overriding storage path from environment: {}", path);
            config.storage.base_path = path;
        }

        if let Ok(level) = env::var("CORE_RUNTIME_LOG_LEVEL") {
            debug!("overriding log level from environment: {}", level);
            config.logging.level = level;
        }

        if let Ok(secs) = env::var("CORE_RUNTIME_PROCESS_TIMEOUT_SECS") {
            if let Ok(parsed) = secs.parse() {
                config.runtime.default_process_timeout_secs = parsed;
            }
        }

        info!("applied environment variable overrides to configuration");
        Ok(())
    }

    pub fn discovered_path(&self) -> Option<&Path> {
        self.discovered_path.as_deref()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration and ensure the directory structure it references exists.
pub fn init_config() -> CoreResult<(ConfigManager, PathBuf)> {
    let loader = ConfigLoader::new();
    let (config_manager, config_path) = loader.load()?;
    ensure_config_directories(&config_manager)?;
    info!("configuration initialization complete");
    Ok((config_manager, config_path))
}

pub fn ensure_config_directories(config_manager: &ConfigManager) -> CoreResult<()> {
    let config = config_manager.config();
    let base_path = Path::new(&config.storage.base_path);

    fs::create_dir_all(base_path)
        .map_err(|e| CoreError::Configuration(format!("failed to create storage directory {:?}: {}", base_path, e)))?;
    debug!("created/verified storage directory: {:?}", base_path);

    if config.storage.enable_durable_backing_store {
        let snapshot_path = base_path.join(&config.storage.snapshot_path);
        fs::create_dir_all(&snapshot_path)
            .map_err(|e| CoreError::Configuration(format!("failed to create snapshot directory {:?}: {}", snapshot_path, e)))?;
        debug!("created/verified snapshot directory: {:?}", snapshot_path);
    }

    if let Some(log_file_config) = &config.logging.targets.file {
        if let Some(log_dir) = base_path.join(&log_file_config.path).parent().map(|p| p.to_path_buf()) {
            fs::create_dir_all(&log_dir)
                .map_err(|e| CoreError::Configuration(format!("failed to create log directory {:?}: {}", log_dir, e)))?;
            debug!("created/verified log directory: {:?}", log_dir);
        }
    }

    info!("all configuration directories verified/created");
    Ok(())
}

/// Standalone validation rules usable without a live [`ConfigManager`].
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_storage(config: &CoreConfig) -> CoreResult<()> {
        let base_path = Path::new(&config.storage.base_path);
        if base_path.is_relative() {
            warn!("storage base path is relative: {}", config.storage.base_path);
        }
        Ok(())
    }

    pub fn validate_runtime(config: &CoreConfig) -> CoreResult<()> {
        if config.runtime.max_retries == 0 {
            return Err(CoreError::Configuration("max_retries must be greater than 0".to_string()));
        }
        if config.runtime.max_nesting_depth == 0 {
            return Err(CoreError::Configuration("max_nesting_depth must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn validate_all(config: &CoreConfig) -> CoreResult<()> {
        Self::validate_storage(config)?;
        Self::validate_runtime(config)?;
        debug!("all configuration validations passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_loader_default_strategy() {
        let loader = ConfigLoader::new();
        assert!(matches!(loader.strategy, ConfigDiscoveryStrategy::Default));
    }

    #[test]
    fn explicit_path_loader() {
        let path = PathBuf::from("/tmp/test.toml");
        let loader = ConfigLoader::with_path(path);
        assert!(matches!(loader.strategy, ConfigDiscoveryStrategy::Explicit(_)));
    }

    #[test]
    fn env_only_loader() {
        let loader = ConfigLoader::env_only();
        assert!(matches!(loader.strategy, ConfigDiscoveryStrategy::EnvironmentOnly));
    }

    #[test]
    fn validator_accepts_defaults() {
        let config = CoreConfig::default();
        assert!(ConfigValidator::validate_all(&config).is_ok());
    }
}
