//! Errors raised while loading, overriding or persisting settings.

use std::path::PathBuf;
use thiserror::Error;

/// Why the settings store could not produce or save a [`Config`](super::Config).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read.
    #[error("Cannot read settings from '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid TOML, or a key has the wrong type.
    #[error("Malformed settings file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Cannot encode settings: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Saving failed, e.g. the config directory is read-only.
    #[error("Cannot save settings to '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value parsed but is outside what a board or the upload accepts,
    /// such as an unsupported baud rate or a reset pulse under 50 ms.
    #[error("Setting '{key}' rejected: {message}")]
    ValidationError { key: String, message: String },

    /// An `ARDUINO_SERIAL_*` override could not be parsed.
    #[error("Override {var} ignored: {message}")]
    EnvParseError { var: String, message: String },

    /// Something the command needs was never set, usually the device port.
    #[error("No {0} configured")]
    MissingRequired(String),
}

impl ConfigError {
    pub fn validation<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::ValidationError {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn env_parse<V: Into<String>, M: Into<String>>(var: V, message: M) -> Self {
        Self::EnvParseError {
            var: var.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
