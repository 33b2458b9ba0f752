// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, loadable from a JSON file with CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the event server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared secret for the client handshake.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,

    /// Reset the PiMaster at startup.
    #[serde(default = "default_true")]
    pub driver_reset: bool,

    /// Bus power monitoring interval in seconds (0 disables).
    #[serde(default = "default_power_monitoring_interval")]
    pub power_monitoring_interval_secs: u64,

    /// Node ping interval in milliseconds (0 disables).
    #[serde(default)]
    pub ping_interval_ms: u64,

    /// SPI clock in bits per second.
    #[serde(default = "default_spi_speed")]
    pub spi_speed: u32,

    /// Log verbosity (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Current limit in raw ADC units (0 = leave the driver default).
    #[serde(default)]
    pub current_limit: u16,

    /// Drive the on-board 120 ohm CAN termination resistor.
    #[serde(default = "default_true")]
    pub can_termination: bool,

    /// Node id cache location; empty disables persistence.
    #[serde(default = "default_node_cache_file")]
    pub node_cache_file: String,
}

fn default_bind() -> String {
    "0.0.0.0:4242".to_string()
}

fn default_auth_token() -> String {
    "password".to_string()
}

fn default_true() -> bool {
    true
}

fn default_power_monitoring_interval() -> u64 {
    10
}

fn default_spi_speed() -> u32 {
    250_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_cache_file() -> String {
    std::env::var("HOME")
        .map(|home| format!("{}/.nocand/cache.json", home))
        .unwrap_or_default()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: default_auth_token(),
            driver_reset: true,
            power_monitoring_interval_secs: default_power_monitoring_interval(),
            ping_interval_ms: 0,
            spi_speed: default_spi_speed(),
            log_level: default_log_level(),
            current_limit: 0,
            can_termination: true,
            node_cache_file: default_node_cache_file(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn power_monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.power_monitoring_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Node cache path, if persistence is enabled.
    pub fn node_cache_path(&self) -> Option<PathBuf> {
        if self.node_cache_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.node_cache_file))
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.is_empty() {
            return Err(ConfigError::InvalidValue("bind cannot be empty".into()));
        }
        if self.auth_token.is_empty() {
            return Err(ConfigError::InvalidValue(
                "auth_token cannot be empty".into(),
            ));
        }
        if self.spi_speed == 0 {
            return Err(ConfigError::InvalidValue("spi_speed cannot be 0".into()));
        }
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "unknown log level '{}'",
                    other
                )));
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Parse(s) => write!(f, "Parse error: {}", s),
            Self::Serialize(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind, "0.0.0.0:4242");
        assert_eq!(config.spi_speed, 250_000);
        assert!(config.driver_reset);
        assert!(config.can_termination);
        assert_eq!(config.ping_interval_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: Config = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.bind, config.bind);
        assert_eq!(parsed.spi_speed, config.spi_speed);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"auth_token":"s3cret","ping_interval_ms":500}"#)
                .expect("parse");
        assert_eq!(parsed.auth_token, "s3cret");
        assert_eq!(parsed.ping_interval_ms, 500);
        assert_eq!(parsed.bind, "0.0.0.0:4242");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = Config {
            auth_token: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            log_level: "verbose".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            spi_speed: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_cache_path() {
        let config = Config {
            node_cache_file: String::new(),
            ..Default::default()
        };
        assert!(config.node_cache_path().is_none());

        let config = Config {
            node_cache_file: "/tmp/cache.json".into(),
            ..Default::default()
        };
        assert_eq!(
            config.node_cache_path(),
            Some(PathBuf::from("/tmp/cache.json"))
        );
    }

    #[test]
    fn test_intervals() {
        let config = Config {
            power_monitoring_interval_secs: 10,
            ping_interval_ms: 1500,
            ..Default::default()
        };
        assert_eq!(config.power_monitoring_interval(), Duration::from_secs(10));
        assert_eq!(config.ping_interval(), Duration::from_millis(1500));
    }
}
