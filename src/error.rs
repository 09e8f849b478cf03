use crate::config::ConfigError;
use crate::port::PortError;
use crate::upload::{FirmwareError, UploadError};
use std::fmt;

/// Unified error type for the command-line front end.
///
/// Library code returns the module errors; this only exists so `main` can
/// use `?` across all of them and print one consistent message.
#[derive(Debug)]
pub enum AppError {
    Port(PortError),
    Upload(UploadError),
    Firmware(FirmwareError),
    Config(ConfigError),
    NoPortConfigured,
    IoError(std::io::Error),
    SerdeError(serde_json::Error),
}

impl AppError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::NoPortConfigured => 2,
            Self::Firmware(_) => 3,
            Self::Port(_) | Self::Upload(_) => 4,
            Self::IoError(_) | Self::SerdeError(_) => 1,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(e) => write!(f, "Serial port error: {e}"),
            Self::Upload(e) => write!(f, "Upload aborted during {}: {e}", e.phase()),
            Self::Firmware(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::NoPortConfigured => write!(
                f,
                "No serial port selected. Pass --port or run `arduino-serial config set-port <PORT>`."
            ),
            Self::IoError(e) => write!(f, "An I/O error occurred: {e}"),
            Self::SerdeError(e) => write!(f, "A serialization error occurred: {e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Port(e) => Some(e),
            Self::Upload(e) => Some(e),
            Self::Firmware(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::IoError(e) => Some(e),
            Self::SerdeError(e) => Some(e),
            Self::NoPortConfigured => None,
        }
    }
}

// Implement `From` conversions to allow the `?` operator to work seamlessly.
impl From<PortError> for AppError {
    fn from(err: PortError) -> Self {
        AppError::Port(err)
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        AppError::Upload(err)
    }
}

impl From<FirmwareError> for AppError {
    fn from(err: FirmwareError) -> Self {
        AppError::Firmware(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerdeError(err)
    }
}
