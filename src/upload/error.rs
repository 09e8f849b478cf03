use crate::port::PortError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Stage of an upload, for reporting where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Open,
    Reset,
    Transfer,
    Handshake,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Reset => "reset",
            Self::Transfer => "transfer",
            Self::Handshake => "handshake",
        };
        f.write_str(name)
    }
}

/// An aborted upload. Nothing is retried.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Nothing to upload: firmware image is empty")]
    EmptyFirmware,

    #[error("Cannot open {port} for upload: {source}")]
    Open {
        port: String,
        #[source]
        source: PortError,
    },

    #[error("Board reset failed: {0}")]
    Reset(#[source] PortError),

    #[error("Transfer failed after {written} of {total} bytes: {source}")]
    Transfer {
        written: usize,
        total: usize,
        #[source]
        source: PortError,
    },

    #[error("Transfer stalled after {written} of {total} bytes")]
    Stalled { written: usize, total: usize },

    #[error("Reading the bootloader reply failed: {0}")]
    Handshake(#[source] PortError),

    #[error("No reply from bootloader: got {received} of {expected} bytes")]
    NoReply { received: usize, expected: usize },
}

impl UploadError {
    pub fn phase(&self) -> UploadPhase {
        match self {
            Self::EmptyFirmware | Self::Open { .. } => UploadPhase::Open,
            Self::Reset(_) => UploadPhase::Reset,
            Self::Transfer { .. } | Self::Stalled { .. } => UploadPhase::Transfer,
            Self::Handshake(_) | Self::NoReply { .. } => UploadPhase::Handshake,
        }
    }

    /// The device error behind this failure, when there is one.
    pub fn port_error(&self) -> Option<&PortError> {
        match self {
            Self::Open { source, .. } | Self::Transfer { source, .. } => Some(source),
            Self::Reset(source) | Self::Handshake(source) => Some(source),
            _ => None,
        }
    }
}
