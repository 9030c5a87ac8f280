//! Configuration Module
//!
//! TOML configuration for the broker with support for:
//! - Logging level
//! - Listener address
//! - Connection and packet size limits
//! - MQTT protocol options
//! - `${VAR}` / `${VAR:-default}` substitution inside the file
//! - Environment variable overrides (IOTBROKER__* prefix)

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, DEFAULT_MAX_PACKET_SIZE};
use crate::codec::MAX_REMAINING_LENGTH;
use crate::engine::EngineConfig;
use crate::protocol::PROTOCOL_MAX_LEVEL;
use crate::topic::DEFAULT_MAX_TOPIC_LEVELS;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
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
    /// Substitution pattern error
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Pattern error: {}", e),
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

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// MQTT protocol options
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Maximum remaining length of an inbound packet
    pub max_packet_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// MQTT protocol options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Highest CONNECT protocol level accepted (3 or 4)
    pub max_protocol_level: u8,
    /// Close the connection after refusing a protocol level
    pub close_on_unsupported_protocol: bool,
    /// Deepest topic name or filter accepted
    pub max_topic_levels: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_protocol_level: PROTOCOL_MAX_LEVEL,
            close_on_unsupported_protocol: true,
            max_topic_levels: DEFAULT_MAX_TOPIC_LEVELS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file means defaults. Overrides use the `IOTBROKER__` prefix
    /// with double underscores for nesting:
    /// - `IOTBROKER__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    /// - `IOTBROKER__LIMITS__MAX_CONNECTIONS=50` overrides `limits.max_connections`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("limits.max_connections", 1000)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("mqtt.max_protocol_level", PROTOCOL_MAX_LEVEL as u64)?
            .set_default("mqtt.close_on_unsupported_protocol", true)?
            .set_default("mqtt.max_topic_levels", DEFAULT_MAX_TOPIC_LEVELS as u64)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("IOTBROKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(3..=PROTOCOL_MAX_LEVEL).contains(&self.mqtt.max_protocol_level) {
            return Err(ConfigError::Validation(format!(
                "max_protocol_level must be between 3 and {}",
                PROTOCOL_MAX_LEVEL
            )));
        }

        if self.limits.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.limits.max_packet_size == 0 || self.limits.max_packet_size > MAX_REMAINING_LENGTH
        {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must be between 1 and {}",
                MAX_REMAINING_LENGTH
            )));
        }

        if self.mqtt.max_topic_levels == 0 {
            return Err(ConfigError::Validation(
                "max_topic_levels must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            engine: EngineConfig {
                max_protocol_level: self.mqtt.max_protocol_level,
                close_on_unsupported_protocol: self.mqtt.close_on_unsupported_protocol,
                max_topic_levels: self.mqtt.max_topic_levels,
            },
        }
    }
}
