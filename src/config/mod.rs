//! Configuration module for arduino-serial.
//!
//! This module is the persisted settings store: the device port the board is
//! attached to, the upload baud rate, upload timing and logging.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `ARDUINO_SERIAL_CONFIG` environment variable (explicit path)
//! 2. `./arduino-serial.toml` (current directory)
//! 3. the per-user config directory, as reported by `directories`
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! Values can be overridden via environment variables named
//! `ARDUINO_SERIAL_<SECTION>_<KEY>`:
//! - `ARDUINO_SERIAL_SERIAL_PORT=/dev/ttyACM0`
//! - `ARDUINO_SERIAL_SERIAL_BAUD=115200`
//! - `ARDUINO_SERIAL_UPLOAD_RESET=false`
//! - `ARDUINO_SERIAL_LOG_LEVEL=debug`
//!
//! # Example
//!
//! ```rust,no_run
//! use arduino_serial::config::ConfigLoader;
//!
//! let mut loader = ConfigLoader::load()?;
//! loader.set_device_port("COM3")?;
//! loader.set_baud_rate(57600)?;
//! let written = loader.save_or_create()?;
//! println!("saved to {}", written.display());
//! # Ok::<(), arduino_serial::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{
    Config, LogFormat, LoggingConfig, SerialConfig, UploadConfig, MIN_RESET_PULSE_MS,
};
