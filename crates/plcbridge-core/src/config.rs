/*!
 * Configuration management for PLCBridge.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for probing, scanning and driver connections. Configuration is an
 * explicit value handed to the components that need it.
 */
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for PLCBridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Vendor detection configuration
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Network scan configuration
    #[serde(default)]
    pub scan: ScanConfig,

    /// Driver connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application version
    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Directory used for program backups
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// How the factory runs wire probes when no vendor is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// One probe after the other, in registration order
    #[default]
    Sequential,
    /// All probes at once, first match wins
    Parallel,
}

/// Vendor detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Timeout applied to each individual probe in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Sequential or parallel detection
    #[serde(default)]
    pub detection: DetectionMode,

    /// Vendor assumed for a plain Modbus-TCP answer when device
    /// identification does not name a known manufacturer
    #[serde(default = "default_modbus_vendor")]
    pub modbus_default_vendor: String,

    /// Per protocol family port overrides (`s7`, `enip`, `fins`, `modbus`, `ads`, `mc`)
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

/// Network scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Number of hosts probed concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Timeout for a single port check in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub port_timeout_ms: u64,

    /// Only check the most common industrial ports
    #[serde(default)]
    pub quick_scan: bool,

    /// Explicit port list; empty means the built-in industrial port table
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Driver connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Timeout for establishing a session in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single request/response exchange in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Default rack for rack/slot addressed controllers
    #[serde(default)]
    pub rack: u16,

    /// Default slot for rack/slot addressed controllers
    #[serde(default = "default_slot")]
    pub slot: u16,

    /// Modbus unit identifier
    #[serde(default = "default_unit_id")]
    pub modbus_unit_id: u8,

    /// Target AMS port for ADS connections
    #[serde(default = "default_ams_port")]
    pub ams_port: u16,

    /// Source AMS Net ID used for ADS requests
    #[serde(default = "default_ams_source")]
    pub ams_source_net_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_version: default_app_version(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            detection: DetectionMode::default(),
            modbus_default_vendor: default_modbus_vendor(),
            ports: HashMap::new(),
        }
    }
}

impl ProbeConfig {
    /// Probe timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Port override for a protocol family, if any
    pub fn port_for(&self, family: &str) -> Option<u16> {
        self.ports.get(family).copied()
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            port_timeout_ms: default_probe_timeout_ms(),
            quick_scan: false,
            ports: Vec::new(),
        }
    }
}

impl ScanConfig {
    /// Port check timeout as a duration
    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            rack: 0,
            slot: default_slot(),
            modbus_unit_id: default_unit_id(),
            ams_port: default_ams_port(),
            ams_source_net_id: default_ams_source(),
        }
    }
}

impl ConnectionConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Check values that deserialize fine but make no sense at runtime
    pub fn validate(&self) -> Result<()> {
        if self.probe.timeout_ms == 0 {
            return Err(Error::validation("probe.timeout_ms must be greater than zero"));
        }
        if self.scan.max_workers == 0 {
            return Err(Error::validation("scan.max_workers must be greater than zero"));
        }
        if self.connection.request_timeout_ms == 0 {
            return Err(Error::validation(
                "connection.request_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn default_app_name() -> String {
    "plcbridge".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_modbus_vendor() -> String {
    "delta".to_string()
}

fn default_max_workers() -> usize {
    50
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_slot() -> u16 {
    1
}

fn default_unit_id() -> u8 {
    1
}

fn default_ams_port() -> u16 {
    851
}

fn default_ams_source() -> String {
    "1.1.1.1.1.1".to_string()
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
            config.validate()?;
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::from(path));
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

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone, Default)]
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
