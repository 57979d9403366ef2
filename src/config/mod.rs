//! Configuration module
//!
//! Handles loading and saving hivelink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{LengthPrefix, SubscriptionRate, DEFAULT_HOST, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Virtual robot settings
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// How long a partial inbound frame may stall, in ms
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Whether frame lengths include the 4-byte prefix
    #[serde(default)]
    pub length_prefix: LengthPrefix,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    2000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            length_prefix: LengthPrefix::default(),
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of virtual robots
    #[serde(default = "default_robot_count")]
    pub robot_count: usize,
    /// Entity id of the first robot; later robots count up from it
    #[serde(default = "default_base_entity_id")]
    pub base_entity_id: u64,
    /// Time between pose updates in ms
    #[serde(default = "default_interval")]
    pub update_interval_ms: u64,
    /// Pause between registration and streaming in ms
    #[serde(default = "default_interval")]
    pub settle_delay_ms: u64,
    /// Update rate requested at registration
    #[serde(default = "default_rate")]
    pub rate: SubscriptionRate,
}

fn default_robot_count() -> usize {
    1
}

fn default_base_entity_id() -> u64 {
    3781082890840362155
}

fn default_interval() -> u64 {
    500
}

fn default_rate() -> SubscriptionRate {
    SubscriptionRate::Half
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            robot_count: default_robot_count(),
            base_entity_id: default_base_entity_id(),
            update_interval_ms: default_interval(),
            settle_delay_ms: default_interval(),
            rate: default_rate(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("hivelink/config.toml")),
            Some(PathBuf::from("./hivelink.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Sample configuration with a small fleet
    pub fn sample() -> Self {
        Self {
            simulation: SimulationConfig {
                robot_count: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.host, "127.0.0.1");
        assert_eq!(config.connection.port, DEFAULT_PORT);
        assert_eq!(config.connection.length_prefix, LengthPrefix::Exclusive);
        assert_eq!(config.simulation.robot_count, 1);
        assert_eq!(config.simulation.base_entity_id, 3781082890840362155);
        assert_eq!(config.simulation.rate, SubscriptionRate::Half);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/hivelink.toml");

        let mut config = Config::default();
        config.connection.port = 7000;
        config.connection.length_prefix = LengthPrefix::Inclusive;
        config.simulation.rate = SubscriptionRate::Quarter;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.connection.port, 7000);
        assert_eq!(loaded.connection.length_prefix, LengthPrefix::Inclusive);
        assert_eq!(loaded.simulation.rate, SubscriptionRate::Quarter);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [connection]
            host = "hive.local"
            length_prefix = "inclusive"

            [simulation]
            robot_count = 4
            "#,
        )
        .unwrap();

        assert_eq!(parsed.connection.host, "hive.local");
        assert_eq!(parsed.connection.port, DEFAULT_PORT);
        assert_eq!(parsed.connection.length_prefix, LengthPrefix::Inclusive);
        assert_eq!(parsed.simulation.robot_count, 4);
        assert_eq!(parsed.simulation.update_interval_ms, 500);
    }

    #[test]
    fn test_unknown_rate_rejected() {
        let result: Result<Config, _> = toml::from_str("[simulation]\nrate = \"double\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config_saves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/sample.toml");
        Config::sample().save(&path).unwrap();

        let parsed = Config::load(&path).unwrap();
        assert_eq!(parsed.simulation.robot_count, 3);
        assert_eq!(parsed.connection.port, DEFAULT_PORT);
    }
}
