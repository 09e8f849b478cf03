//! Arduino serial library
//!
//! The serial I/O layer behind an Arduino upload: a [`SerialDevice`] that
//! opens a named port at one of the supported baud rates, moves bytes in
//! both directions without blocking, drives DTR/RTS to reset boards, and
//! reports OS failures as readable messages. An [`Uploader`] runs the
//! reset-then-stream sequence over it.
//!
//! # Modules
//!
//! - `port`: device lifecycle, platform backends, read notifications, discovery
//! - `upload`: firmware loading and the upload pipeline
//! - `config`: persisted port/baud preference with TOML support
//! - `error`: error type for the command-line front end

pub mod config;
pub mod error;
pub mod port;
pub mod upload;

// Re-export commonly used types for convenience
pub use error::AppError;
pub use port::{
    BaudRate, DeviceEvent, DeviceEvents, Line, LineControlError, LoopbackBackend, NativeBackend,
    OpenMode, OsError, PortError, SerialBackend, SerialDevice,
};
pub use upload::{
    Firmware, ResetPolicy, UploadError, UploadReport, UploadRequest, UploadTimings, Uploader,
};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
