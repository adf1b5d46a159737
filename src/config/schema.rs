//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! Every section has defaults, so an empty file (or no file) is valid.

use super::error::{ConfigError, ConfigResult};
use crate::command::CommandLimits;
use crate::controller::{ControllerConfig, ReconnectPolicy};
use crate::poller::PollerConfig;
use crate::port::scanner::{DeviceFilter, DEFAULT_NAME_PATTERN, VID_RASPBERRY_PI};
use crate::port::PortConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub discovery: DiscoveryConfig,
    pub poller: PollerSection,
    pub reconnect: ReconnectConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject values the rest of the program cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::validation("serial.baud_rate", "must be positive"));
        }
        if self.serial.timeout_ms == 0 {
            return Err(ConfigError::validation("serial.timeout_ms", "must be positive"));
        }
        if self.serial.terminator.is_empty() {
            return Err(ConfigError::validation("serial.terminator", "must not be empty"));
        }
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::validation("poller.interval_ms", "must be positive"));
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(ConfigError::validation(
                "reconnect.initial_backoff_ms",
                "must be positive",
            ));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(ConfigError::validation(
                "reconnect.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::validation(
                "reconnect.multiplier",
                "must be a finite number >= 1.0",
            ));
        }
        if !self.limits.max_voltage.is_finite() || self.limits.max_voltage < 0.0 {
            return Err(ConfigError::validation("limits.max_voltage", "must be >= 0"));
        }
        if !self.limits.max_current_ma.is_finite() || self.limits.max_current_ma < 0.0 {
            return Err(ConfigError::validation("limits.max_current_ma", "must be >= 0"));
        }
        self.discovery.filter()?;
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            identity_marker: self.serial.identity_marker.clone(),
            reconnect: self.reconnect.policy(),
            poller: self.poller.poller_config(),
        }
    }
}

/// `[serial]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port to connect to at startup (skips scanning)
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Read/write timeout per exchange in milliseconds
    pub timeout_ms: u64,
    pub terminator: String,
    /// Substring required in the `*IDN?` reply
    pub identity_marker: String,
    /// Port aliases for convenience
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            timeout_ms: 200,
            terminator: "\n".to_string(),
            identity_marker: "SMU".to_string(),
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn port_configuration(&self) -> PortConfiguration {
        PortConfiguration {
            baud_rate: self.baud_rate,
            timeout: self.timeout(),
            terminator: self.terminator.clone(),
        }
    }

    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// `[discovery]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// USB vendor ids treated as the instrument
    pub vendor_ids: Vec<u16>,
    /// Case-insensitive regex matched against the port label
    pub name_pattern: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            vendor_ids: vec![VID_RASPBERRY_PI],
            name_pattern: DEFAULT_NAME_PATTERN.to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn filter(&self) -> ConfigResult<DeviceFilter> {
        DeviceFilter::new(self.vendor_ids.clone(), &self.name_pattern)
            .map_err(|e| ConfigError::validation("discovery.name_pattern", e.to_string()))
    }
}

/// `[poller]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    pub interval_ms: u64,
    /// Consecutive failed cycles tolerated before reconnecting
    pub parse_tolerance: u32,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            parse_tolerance: 3,
        }
    }
}

impl PollerSection {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.interval_ms),
            parse_tolerance: self.parse_tolerance,
        }
    }
}

/// `[reconnect]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 3000,
            multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

/// `[limits]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_voltage: f64,
    pub max_current_ma: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_voltage: 20.0,
            max_current_ma: 500.0,
        }
    }
}

impl LimitsConfig {
    pub fn command_limits(&self) -> CommandLimits {
        CommandLimits {
            max_voltage: self.max_voltage,
            max_current_ma: self.max_current_ma,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    pub format: LogFormat,
    /// Diagnostic log file (stderr when unset)
    pub file: Option<PathBuf>,
    /// Directory for measurement CSV files
    pub data_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.timeout_ms, 200);
        assert_eq!(config.poller.interval_ms, 100);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.discovery.vendor_ids, vec![0x2E8A]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_alias_resolution() {
        let mut config = SerialConfig::default();
        config
            .port_aliases
            .insert("bench".to_string(), "/dev/ttyACM0".to_string());

        assert_eq!(config.resolve_port("bench"), "/dev/ttyACM0");
        assert_eq!(config.resolve_port("COM5"), "COM5");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[serial]"));
        assert!(toml_str.contains("[reconnect]"));
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [serial]
            baud_rate = 9600

            [reconnect]
            max_attempts = 2
            multiplier = 2.0

            [logging]
            format = "compact"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.logging.format, LogFormat::Compact);
        // Defaults should still work
        assert_eq!(config.serial.identity_marker, "SMU");
        assert_eq!(config.reconnect.initial_backoff_ms, 500);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.poller.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_voltage = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.discovery.name_pattern = "(unclosed".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("discovery.name_pattern"));
    }

    #[test]
    fn test_policy_conversion() {
        let policy = ReconnectConfig::default().policy();
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(3));
    }
}
