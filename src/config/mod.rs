//! Configuration management for stowage

pub mod schema;

pub use schema::Config;

use crate::error::{StowageError, StowageResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Overrides `cache.root`
pub const ENV_CACHE_ROOT: &str = "STOWAGE_CACHE_ROOT";
/// Overrides `registry.username`
pub const ENV_REGISTRY_USERNAME: &str = "STOWAGE_REGISTRY_USERNAME";
/// Overrides `registry.password`
pub const ENV_REGISTRY_PASSWORD: &str = "STOWAGE_REGISTRY_PASSWORD";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stowage")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stowage")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Load configuration, falling back to defaults if the file is absent.
    /// Environment overrides are applied last.
    pub async fn load(&self) -> StowageResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StowageResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StowageError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| StowageError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StowageResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StowageError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StowageResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StowageError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state directory and the cache root exist
    pub async fn ensure_state_dirs(config: &Config) -> StowageResult<()> {
        let dirs = [Self::state_dir(), config.cache.root.clone()];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                StowageError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(root) = env_value(ENV_CACHE_ROOT) {
        debug!(root = %root, "Cache root overridden from environment");
        config.cache.root = PathBuf::from(root);
    }
    if let Some(username) = env_value(ENV_REGISTRY_USERNAME) {
        config.registry.username = Some(username);
    }
    if let Some(password) = env_value(ENV_REGISTRY_PASSWORD) {
        config.registry.password = Some(password);
    }
}
