//! Configuration Module
//!
//! Provides TOML-based configuration for the adapter with support for:
//! - Logging
//! - Sensor-network (LoRa Server) and platform broker sessions
//! - Relay topics
//! - Metrics endpoint
//! - Environment variable overrides (LORA_ADAPTER__* prefix)
//! - The legacy `LORA_ADAPTER_LORASERVER_URL` / `LORA_ADAPTER_MAINFLUX_URL` variables

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::{
    BrokerAddress, BrokerConfig, DEFAULT_LORA_URL, DEFAULT_MQTT_PORT, DEFAULT_PLATFORM_URL,
};
pub use metrics::MetricsConfig;

use crate::topic::{validate_topic_filter, validate_topic_name, RELAY_TOPIC, UPLINK_FILTER};

mod broker;
mod metrics;


/// Environment variable overriding the sensor-network broker URL
pub const ENV_LORA_URL: &str = "LORA_ADAPTER_LORASERVER_URL";

/// Environment variable overriding the platform broker URL
pub const ENV_PLATFORM_URL: &str = "LORA_ADAPTER_MAINFLUX_URL";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Read an environment variable, treating an empty value as unset
fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Sensor-network (LoRa Server) broker
    pub lora: BrokerConfig,
    /// Platform broker
    pub platform: BrokerConfig,
    /// Relay topics
    pub relay: RelayConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            lora: BrokerConfig::lora_default(),
            platform: BrokerConfig::platform_default(),
            relay: RelayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Filter subscribed to on the sensor-network broker
    pub uplink_topic: String,
    /// Topic decoded payloads are published to on the platform broker
    pub relay_topic: String,
    /// Inbound messages buffered between the event loop and the handler
    pub dispatch_capacity: usize,
}

fn default_dispatch_capacity() -> usize {
    1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            uplink_topic: UPLINK_FILTER.to_string(),
            relay_topic: RELAY_TOPIC.to_string(),
            dispatch_capacity: default_dispatch_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Precedence, lowest first:
    /// 1. Built-in defaults
    /// 2. The TOML file, with `${VAR}` or `${VAR:-default}` substitution
    /// 3. `LORA_ADAPTER__` variables with double underscores for nesting:
    ///    - `LORA_ADAPTER__LORA__USERNAME=gw` overrides `lora.username`
    ///    - `LORA_ADAPTER__RELAY__RELAY_TOPIC=/uplinks` overrides `relay.relay_topic`
    /// 4. `LORA_ADAPTER_LORASERVER_URL` and `LORA_ADAPTER_MAINFLUX_URL`
    ///
    /// A missing file is not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", default_log_level())?
            .set_default("lora.url", DEFAULT_LORA_URL)?
            .set_default("platform.url", DEFAULT_PLATFORM_URL)?
            .set_default("relay.uplink_topic", UPLINK_FILTER)?
            .set_default("relay.relay_topic", RELAY_TOPIC)?
            .set_default("relay.dispatch_capacity", default_dispatch_capacity() as u64)?;

        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("LORA_ADAPTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("lora.url", non_empty_env(ENV_LORA_URL))?
            .set_override_option("platform.url", non_empty_env(ENV_PLATFORM_URL))?
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.apply_role_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_role_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Broker sections given without a `url` point at their own role's default
    fn apply_role_defaults(&mut self) {
        if self.lora.url.is_empty() {
            self.lora.url = DEFAULT_LORA_URL.to_string();
        }
        if self.platform.url.is_empty() {
            self.platform.url = DEFAULT_PLATFORM_URL.to_string();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lora.validate("lora")?;
        self.platform.validate("platform")?;

        validate_topic_filter(&self.relay.uplink_topic).map_err(|e| {
            ConfigError::Validation(format!(
                "relay.uplink_topic '{}': {}",
                self.relay.uplink_topic, e
            ))
        })?;

        validate_topic_name(&self.relay.relay_topic).map_err(|e| {
            ConfigError::Validation(format!(
                "relay.relay_topic '{}': {}",
                self.relay.relay_topic, e
            ))
        })?;

        if self.relay.dispatch_capacity == 0 {
            return Err(ConfigError::Validation(
                "relay.dispatch_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
