//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, LogFormat};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "ARDUINO_SERIAL";

/// Config file name inside the per-user config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config file name looked up in the working directory
const LOCAL_CONFIG_FILE_NAME: &str = "arduino-serial.toml";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "ARDUINO_SERIAL_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `ARDUINO_SERIAL_CONFIG` environment variable (explicit path)
    /// 2. `./arduino-serial.toml` (current directory)
    /// 3. the per-user config directory (`~/.config/arduino-serial/config.toml`
    ///    on Linux, `%APPDATA%\arduino-serial\config\config.toml` on Windows)
    /// 4. Built-in defaults (no file required)
    ///
    /// Environment variables can override any config file values.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = if let Some(ref path) = config_path {
            load_from_file(path)?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        // Still apply env overrides even with defaults
        if apply_env_overrides(&mut config).is_err() || config.validate().is_err() {
            config = Config::default();
        }

        Self {
            config_path: None,
            config,
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the configuration.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Remember the port the board is attached to.
    pub fn set_device_port(&mut self, port: impl Into<String>) -> ConfigResult<()> {
        let port = port.into();
        if port.trim().is_empty() {
            return Err(ConfigError::validation("serial.device_port", "is empty"));
        }
        tracing::debug!(%port, "device port set");
        self.config.serial.device_port = Some(port);
        Ok(())
    }

    /// Remember the upload baud rate. Rejects rates the device cannot use.
    pub fn set_baud_rate(&mut self, baud: u32) -> ConfigResult<()> {
        let previous = self.config.serial.baud_rate;
        self.config.serial.baud_rate = baud;
        if let Err(err) = self.config.validate() {
            self.config.serial.baud_rate = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Save the current configuration to file.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("settings file path".to_string()))?;

        save_to_file(&self.config, path)
    }

    /// Save to the loaded file, or to the default per-user location when no
    /// file was loaded. Returns the path written.
    pub fn save_or_create(&mut self) -> ConfigResult<PathBuf> {
        if self.config_path.is_none() {
            self.config_path = Some(get_default_config_path().ok_or_else(|| {
                ConfigError::MissingRequired("user config directory".to_string())
            })?);
        }
        self.save()?;
        Ok(self.config_path.clone().unwrap_or_default())
    }

    /// Save the current configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }

    /// Reload configuration from file (if path is set).
    pub fn reload(&mut self) -> ConfigResult<()> {
        if let Some(ref path) = self.config_path {
            let mut config = load_from_file(path)?;
            apply_env_overrides(&mut config)?;
            config.validate()?;
            self.config = config;
        }
        Ok(())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    // 1. Explicit environment variable
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. Current directory
    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    // 3. Per-user config directory
    if let Some(app_config) = get_default_config_path() {
        if app_config.exists() {
            return Some(app_config);
        }
    }

    // 4. No config file found - will use defaults
    None
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

/// Save configuration to a file.
fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::info!(path = %path.display(), "configuration saved");
    Ok(())
}

fn env_var(key: &str) -> Option<(String, String)> {
    let name = format!("{ENV_PREFIX}_{key}");
    std::env::var(&name).ok().map(|val| (name, val))
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str, what: &str) -> ConfigResult<T> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::env_parse(name, format!("Invalid {what}")))
}

fn parse_bool(name: &str, val: &str) -> ConfigResult<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::env_parse(name, "Invalid boolean")),
    }
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `ARDUINO_SERIAL_<SECTION>_<KEY>`
/// For example:
/// - `ARDUINO_SERIAL_SERIAL_PORT=/dev/ttyACM0`
/// - `ARDUINO_SERIAL_SERIAL_BAUD=57600`
/// - `ARDUINO_SERIAL_UPLOAD_RESET=false`
/// - `ARDUINO_SERIAL_UPLOAD_EXPECT_REPLY_BYTES=2`
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    // Serial overrides
    if let Some((_, val)) = env_var("SERIAL_PORT") {
        config.serial.device_port = Some(val);
    }
    if let Some((name, val)) = env_var("SERIAL_BAUD") {
        config.serial.baud_rate = parse_env(&name, &val, "baud rate")?;
    }

    // Upload overrides
    if let Some((name, val)) = env_var("UPLOAD_RESET") {
        config.upload.reset_before_upload = parse_bool(&name, &val)?;
    }
    if let Some((name, val)) = env_var("UPLOAD_RESET_PULSE_MS") {
        config.upload.reset_pulse_ms = parse_env(&name, &val, "duration")?;
    }
    if let Some((name, val)) = env_var("UPLOAD_SETTLE_MS") {
        config.upload.settle_ms = parse_env(&name, &val, "duration")?;
    }
    if let Some((name, val)) = env_var("UPLOAD_STALL_TIMEOUT_MS") {
        config.upload.stall_timeout_ms = parse_env(&name, &val, "duration")?;
    }
    if let Some((name, val)) = env_var("UPLOAD_REPLY_TIMEOUT_MS") {
        config.upload.reply_timeout_ms = parse_env(&name, &val, "duration")?;
    }
    if let Some((name, val)) = env_var("UPLOAD_EXPECT_REPLY_BYTES") {
        // "none" or an empty value turns the reply check off.
        config.upload.expect_reply_bytes = match val.trim() {
            "" | "none" => None,
            _ => Some(parse_env(&name, &val, "byte count")?),
        };
    }

    // Logging overrides
    if let Some((_, val)) = env_var("LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some((name, val)) = env_var("LOG_FORMAT") {
        config.logging.format = val
            .parse::<LogFormat>()
            .map_err(|msg| ConfigError::env_parse(name, msg))?;
    }

    Ok(())
}

/// Get the default config directory for creating new config files.
pub fn get_default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "arduino-serial").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}
