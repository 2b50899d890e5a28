//! Configuration management
//!
//! This module handles loading, saving, and migrating the stowage configuration
//! file. The file is stored in TOML format at ~/.config/stowage/config.toml,
//! or under `$STOWAGE_CONFIG_DIR` when that variable is set.
//!
//! Changes to schema_version require migration support.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::profile::{Profile, RetryConfig};

/// Current configuration schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "STOWAGE_CONFIG_DIR";

/// Default chunk size: 8 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Schema version for migration support
    pub schema_version: u32,

    /// Default settings
    #[serde(default)]
    pub defaults: Defaults,

    /// Configured profiles
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Default transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Bytes moved per network operation
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Spaces readable without a token
    #[serde(default = "default_public_spaces")]
    pub public_spaces: Vec<String>,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_public_spaces() -> Vec<String> {
    vec!["public".to_string()]
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            retry: RetryConfig::default(),
            public_spaces: default_public_spaces(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            defaults: Defaults::default(),
            profiles: Vec::new(),
        }
    }
}

/// Reads and writes the configuration file
#[derive(Debug)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Resolve the config file from `$STOWAGE_CONFIG_DIR` or the platform config dir
    pub fn new() -> Result<Self> {
        let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| Error::Config("Could not determine config directory".into()))?
                .join("stowage"),
        };
        Ok(Self {
            config_path: config_dir.join("config.toml"),
        })
    }

    /// Use an explicit config file path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load the configuration, falling back to defaults when the file is absent.
    ///
    /// Older schema versions are migrated in memory; newer ones are rejected.
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        if config.schema_version < SCHEMA_VERSION {
            config = self.migrate(config)?;
        } else if config.schema_version > SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "Configuration file version {} is newer than supported version {}. Please upgrade stowage.",
                config.schema_version, SCHEMA_VERSION
            )));
        }

        if config.defaults.chunk_size == 0 {
            return Err(Error::Config("defaults.chunk_size must be positive".into()));
        }

        Ok(config)
    }

    /// Write the configuration, creating parent directories.
    ///
    /// The file holds credentials, so on Unix it is restricted to mode 0600.
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config_path, permissions)?;
        }

        Ok(())
    }

    fn migrate(&self, config: Config) -> Result<Config> {
        let mut config = config;
        tracing::debug!(
            from = config.schema_version,
            to = SCHEMA_VERSION,
            "Migrating configuration"
        );
        config.schema_version = SCHEMA_VERSION;
        Ok(config)
    }
}
