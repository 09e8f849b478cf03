//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use super::error::{ConfigError, ConfigResult};
use crate::port::BaudRate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Shortest DTR pulse that reliably resets a board through its auto-reset
/// capacitor.
pub const MIN_RESET_PULSE_MS: u64 = 50;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial port preferences
    pub serial: SerialConfig,
    /// Upload pipeline timing
    pub upload: UploadConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check values the schema alone cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if BaudRate::try_from(self.serial.baud_rate).is_err() {
            return Err(ConfigError::validation(
                "serial.baud_rate",
                format!(
                    "{} is not one of {}",
                    self.serial.baud_rate,
                    BaudRate::ALL.map(|b| b.to_string()).join(", ")
                ),
            ));
        }
        if self.upload.reset_pulse_ms < MIN_RESET_PULSE_MS {
            return Err(ConfigError::validation(
                "upload.reset_pulse_ms",
                format!("must be at least {MIN_RESET_PULSE_MS}"),
            ));
        }
        if let Some(port) = &self.serial.device_port {
            if port.trim().is_empty() {
                return Err(ConfigError::validation("serial.device_port", "is empty"));
            }
        }
        Ok(())
    }
}

/// Serial port configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port the board is attached to, as picked in the IDE
    pub device_port: Option<String>,
    /// Baud rate used for uploads
    pub baud_rate: u32,
    /// Port aliases for convenience
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device_port: None,
            baud_rate: 115200,
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// The configured device port with aliases applied.
    pub fn resolved_device_port(&self) -> Option<String> {
        self.device_port.as_deref().map(|p| self.resolve_port(p))
    }
}

/// Upload pipeline section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Pulse DTR before streaming firmware
    pub reset_before_upload: bool,
    /// How long DTR stays asserted
    pub reset_pulse_ms: u64,
    /// Pause after the reset for the bootloader to start
    pub settle_ms: u64,
    /// Abort when a write makes no progress for this long
    pub stall_timeout_ms: u64,
    /// How long to wait for a bootloader reply
    pub reply_timeout_ms: u64,
    /// Number of reply bytes to wait for after the transfer, if any
    pub expect_reply_bytes: Option<usize>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            reset_before_upload: true,
            reset_pulse_ms: 100,
            settle_ms: 250,
            stall_timeout_ms: 2000,
            reply_timeout_ms: 1000,
            expect_reply_bytes: None,
        }
    }
}

impl UploadConfig {
    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}
