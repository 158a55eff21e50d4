//! Configuration management for Beacon.
//!
//! Supports:
//! - Loading from YAML files
//! - Environment variable overrides (`BEACON__*`)
//! - Validation of all settings

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::Level;

/// Root configuration.
///
/// # Examples
///
/// ```
/// use beacon_core::config::BeaconConfig;
///
/// let config = BeaconConfig::from_yaml("discovery:\n  event_buffer: 64\n").unwrap();
/// assert_eq!(config.discovery.event_buffer, 64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Discovery and registration settings
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BeaconConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate: an optional YAML file
    /// overridden by `BEACON__SECTION__FIELD` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("BEACON")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<environment>".to_string()),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Settings for discovery sessions and registrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Per-session broadcast buffer; subscribers that fall further behind lose events
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// DNS-SD domain appended to service types
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Host name announced for registrations (defaults to the system host name)
    #[serde(default)]
    pub host_name: Option<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            domain: default_domain(),
            host_name: None,
        }
    }
}

impl DiscoverySettings {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.event_buffer == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.event_buffer",
                "must be greater than 0",
            ));
        }

        let domain = self.domain.strip_suffix('.').unwrap_or(&self.domain);
        if domain.is_empty() || domain.split('.').any(|label| label.is_empty()) {
            return Err(ConfigError::invalid_value(
                "discovery.domain",
                format!("'{}' is not a valid domain", self.domain),
            ));
        }

        if let Some(host) = &self.host_name {
            if host.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "discovery.host_name",
                    "cannot be empty when set",
                ));
            }
        }

        Ok(())
    }
}

fn default_event_buffer() -> usize {
    256
}

fn default_domain() -> String {
    "local.".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Returns the configured level as a tracing level.
    pub fn tracing_level(&self) -> std::result::Result<Level, ConfigError> {
        Level::from_str(&self.level).map_err(|_| {
            ConfigError::invalid_value(
                "logging.level",
                format!("'{}' is not one of trace, debug, info, warn, error", self.level),
            )
        })
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.tracing_level().map(|_| ())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}
