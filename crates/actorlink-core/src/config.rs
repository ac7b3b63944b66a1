/*!
 * Configuration management for actorlink.
 *
 * This module loads the settings an actor needs to build its devices:
 * logging, default timeouts, and the list of TCP-connected devices.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis_to_limit;

/// Top-level actorlink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Default timeouts for device operations
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Devices reachable over TCP
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Default time limits, in milliseconds; 0 means no limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Limit on establishing a device's connection; also handed to
    /// initialization, which enforces its own limit
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Limit on disconnecting a device
    #[serde(default = "default_disconnect_ms")]
    pub disconnect_ms: u64,

    /// Limit on a single device command
    #[serde(default)]
    pub command_ms: u64,
}

/// A device reached over a TCP line connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Short name identifying the device
    pub name: String,

    /// Host name or IP address
    pub host: String,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl TimeoutConfig {
    /// No limit on any operation
    pub fn unlimited() -> Self {
        Self {
            connect_ms: 0,
            disconnect_ms: 0,
            command_ms: 0,
        }
    }

    /// Connect limit, `None` for no limit
    pub fn connect(&self) -> Option<Duration> {
        millis_to_limit(self.connect_ms)
    }

    /// Disconnect limit, `None` for no limit
    pub fn disconnect(&self) -> Option<Duration> {
        millis_to_limit(self.disconnect_ms)
    }

    /// Command limit, `None` for no limit
    pub fn command(&self) -> Option<Duration> {
        millis_to_limit(self.command_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            disconnect_ms: default_disconnect_ms(),
            command_ms: 0,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_ms() -> u64 {
    10_000
}

fn default_disconnect_ms() -> u64 {
    5_000
}

fn default_port() -> u16 {
    23
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!(devices = config.devices.len(), "Configuration loaded");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
