//! Port-specific error types.
//!
//! Every OS failure is captured where it happens, translated to text and
//! returned as one of these variants; nothing in the port layer panics or
//! retries on behalf of the caller.

use super::os_error::OsError;
use thiserror::Error;

/// Errors that can occur during serial port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// Attempted to open a device that already holds a handle.
    #[error("Device ({port}) already open")]
    AlreadyOpen { port: String },

    /// The baud rate is outside the supported set.
    #[error("Unknown baud rate {0}")]
    InvalidBaudRate(u32),

    /// The OS refused to hand out (or configure) a handle for the port.
    #[error("Cannot open {port}: {source}")]
    HandleAcquisition {
        port: String,
        #[source]
        source: OsError,
    },

    /// Attempted to use a device that is not open.
    #[error("Port is not open")]
    NotOpen,

    /// The device was opened write-only.
    #[error("Port was not opened for reading")]
    NotReadable,

    /// The device was opened read-only.
    #[error("Port was not opened for writing")]
    NotWritable,

    /// A read failed at the OS level.
    #[error("Read failed: {0}")]
    Read(#[source] OsError),

    /// A write failed at the OS level.
    #[error("Write failed: {0}")]
    Write(#[source] OsError),

    /// Waiting for input readiness failed at the OS level.
    #[error("Wait for input failed: {0}")]
    Wait(#[source] OsError),

    /// DTR/RTS could not be changed.
    #[error("Line control failed: {0}")]
    LineControl(#[from] LineControlError),

    /// Enumerating the system's serial ports failed.
    #[error("Port discovery failed: {0}")]
    Discovery(#[from] serialport::Error),
}

/// Reasons a DTR/RTS change can fail.
#[derive(Debug, Error)]
pub enum LineControlError {
    #[error("device is not open")]
    NotOpen,

    #[error(transparent)]
    Os(#[from] OsError),
}

impl PortError {
    /// Create a handle acquisition error for `port`.
    pub fn acquisition(port: impl Into<String>, source: OsError) -> Self {
        Self::HandleAcquisition {
            port: port.into(),
            source,
        }
    }

    /// The underlying OS error, when there is one.
    pub fn os_error(&self) -> Option<&OsError> {
        match self {
            Self::HandleAcquisition { source, .. } => Some(source),
            Self::Read(e) | Self::Write(e) | Self::Wait(e) => Some(e),
            Self::LineControl(LineControlError::Os(e)) => Some(e),
            _ => None,
        }
    }
}
