//! Profile management
//!
//! Profiles are named references to storage endpoints, including
//! connection details, credentials and the bearer token used to
//! authorize access to storage spaces.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::config::{Config, ConfigManager};
use crate::error::{Error, Result};

/// Retry configuration for transient transfer failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    10000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (zero-based), doubling each time
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Timeout configuration for a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    30000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            read_ms: default_read_timeout(),
        }
    }
}

/// A profile represents a named storage endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique name for this profile
    pub name: String,

    /// Storage endpoint URL
    pub endpoint: String,

    /// Access key ID
    pub access_key: String,

    /// Secret access key
    pub secret_key: String,

    /// Region
    #[serde(default = "default_region")]
    pub region: String,

    /// Template mapping a storage space name to a bucket, e.g. "data-{space}"
    #[serde(default = "default_bucket_template")]
    pub bucket_template: String,

    /// Header carrying the bearer token on every request
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Bearer token granting access to protected spaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Retry configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Timeout configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket_template() -> String {
    "{space}".to_string()
}

fn default_token_header() -> String {
    "x-stowage-token".to_string()
}

impl Profile {
    /// Create a new profile with required fields
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: default_region(),
            bucket_template: default_bucket_template(),
            token_header: default_token_header(),
            token: None,
            retry: None,
            timeout: None,
        }
    }

    /// Attach a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Resolve the bucket backing a storage space
    pub fn bucket_for(&self, space: &str) -> String {
        self.bucket_template.replace("{space}", space)
    }

    /// Check that the endpoint is a usable absolute URL
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Profile '{}' endpoint must use http or https, got '{}'",
                self.name,
                url.scheme()
            )));
        }
        if !self.bucket_template.contains("{space}") {
            return Err(Error::Config(format!(
                "Profile '{}' bucket_template must contain '{{space}}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Effective retry policy: the profile's override, else `fallback`
    pub fn retry_config(&self, fallback: &RetryConfig) -> RetryConfig {
        self.retry.clone().unwrap_or_else(|| fallback.clone())
    }

    /// Get the effective timeout configuration
    pub fn timeout_config(&self) -> TimeoutConfig {
        self.timeout.clone().unwrap_or_default()
    }
}

/// Profiles persisted in the configuration file
pub struct ProfileManager {
    config_manager: ConfigManager,
}

impl ProfileManager {
    pub fn with_config_manager(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }

    /// Use the default configuration file
    pub fn new() -> Result<Self> {
        let config_manager = ConfigManager::new()?;
        Ok(Self { config_manager })
    }

    pub fn list(&self) -> Result<Vec<Profile>> {
        let config = self.config_manager.load()?;
        Ok(config.profiles)
    }

    /// Get a profile by name
    pub fn get(&self, name: &str) -> Result<Profile> {
        let config = self.config_manager.load()?;
        find(&config, name).cloned()
    }

    /// Load a profile together with the client settings it implies
    pub fn client_config(&self, name: &str) -> Result<(Profile, ClientConfig)> {
        let config = self.config_manager.load()?;
        let profile = find(&config, name)?.clone();
        let client = ClientConfig::from_profile(&config, &profile);
        Ok((profile, client))
    }

    /// Insert or replace a profile after validating it
    pub fn set(&self, profile: Profile) -> Result<()> {
        profile.validate()?;
        let mut config = self.config_manager.load()?;

        config.profiles.retain(|p| p.name != profile.name);
        config.profiles.push(profile);

        self.config_manager.save(&config)
    }

    /// Add a profile, failing if the name is taken
    pub fn add(&self, profile: Profile) -> Result<()> {
        if self.exists(&profile.name)? {
            return Err(Error::ProfileExists(profile.name));
        }
        self.set(profile)
    }

    /// Delete a profile; unknown names are an error
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut config = self.config_manager.load()?;
        let before = config.profiles.len();

        config.profiles.retain(|p| p.name != name);

        if config.profiles.len() == before {
            return Err(Error::ProfileNotFound(name.to_string()));
        }

        self.config_manager.save(&config)
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let config = self.config_manager.load()?;
        Ok(config.profiles.iter().any(|p| p.name == name))
    }
}

fn find<'a>(config: &'a Config, name: &str) -> Result<&'a Profile> {
    config
        .profiles
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::ProfileNotFound(name.to_string()))
}
