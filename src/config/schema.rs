//! Configuration schema for stowage
//!
//! Configuration is stored at `~/.config/stowage/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Unpack cache settings
    pub cache: CacheConfig,

    /// Tarball download settings
    pub fetch: FetchConfig,

    /// OCI registry settings
    pub registry: RegistryConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding one subdirectory per bundle
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: super::ConfigManager::state_dir().join("bundles"),
        }
    }
}

/// HTTP fetch configuration for `.tar.gz` bundles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            user_agent: format!("stowage/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// OCI registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registries reached over plain HTTP (`host:port`)
    pub insecure: Vec<String>,

    /// Basic auth username (`STOWAGE_REGISTRY_USERNAME`)
    pub username: Option<String>,

    /// Basic auth password (`STOWAGE_REGISTRY_PASSWORD`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            insecure: vec![],
            username: None,
            password: None,
            timeout_secs: 300,
        }
    }
}
