//! Core traits for serial port abstraction.
//!
//! A [`SerialBackend`] knows how to turn a port name into an owned OS handle;
//! the handle ([`OsHandle`]) does the raw byte transfer and line control.
//! Releasing the handle is tied to `Drop`, so a handle can never be closed
//! twice or forgotten. The POSIX and Windows backends and the in-memory
//! loopback all implement the same pair of traits.

use super::error::PortError;
use super::os_error::OsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Supported line speeds. Serialized as the plain integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B300,
    B1200,
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    /// Every supported rate, slowest first.
    pub const ALL: [BaudRate; 9] = [
        BaudRate::B300,
        BaudRate::B1200,
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    /// Bits per second.
    pub fn as_u32(self) -> u32 {
        match self {
            BaudRate::B300 => 300,
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = PortError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        BaudRate::ALL
            .into_iter()
            .find(|rate| rate.as_u32() == value)
            .ok_or(PortError::InvalidBaudRate(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.as_u32()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Access requested when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn readable(self) -> bool {
        matches!(self, OpenMode::ReadOnly | OpenMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, OpenMode::WriteOnly | OpenMode::ReadWrite)
    }
}

/// Modem control outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    /// Data Terminal Ready.
    Dtr,
    /// Request To Send.
    Rts,
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Dtr => write!(f, "DTR"),
            Line::Rts => write!(f, "RTS"),
        }
    }
}

/// Opens named serial interfaces.
pub trait SerialBackend: Send + fmt::Debug {
    /// The owned OS handle type produced by [`SerialBackend::open`].
    type Handle: OsHandle;

    /// Acquire an exclusive, non-blocking handle to `port` and apply `baud`.
    ///
    /// Anything acquired before a failing step must be released before
    /// returning the error.
    fn open(&self, port: &str, mode: OpenMode, baud: BaudRate) -> Result<Self::Handle, OsError>;
}

/// An open, exclusively owned serial handle. Dropping it releases the OS
/// resource.
pub trait OsHandle: Send + fmt::Debug {
    /// Copy out whatever input is buffered right now. `Ok(0)` when empty.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OsError>;

    /// Queue as much of `buf` as the driver accepts right now.
    fn write(&mut self, buf: &[u8]) -> Result<usize, OsError>;

    /// Drive a modem control line.
    fn set_line(&mut self, line: Line, level: bool) -> Result<(), OsError>;

    /// Block until input is available or `timeout` expires.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, OsError>;

    /// Number of bytes waiting in the input queue.
    fn bytes_available(&self) -> Result<usize, OsError>;

    /// A second, independently owned wait primitive on the same device, for
    /// use from the read monitor thread.
    fn waiter(&self) -> Result<Box<dyn ReadinessWaiter>, OsError>;
}

/// Readiness probe handed to the read monitor.
pub trait ReadinessWaiter: Send {
    /// Block until input is available or `timeout` expires.
    fn wait(&mut self, timeout: Duration) -> Result<bool, OsError>;

    /// Number of bytes waiting in the input queue.
    fn pending(&mut self) -> Result<usize, OsError>;
}
