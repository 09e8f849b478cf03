//! Port abstraction layer for serial communication.
//!
//! [`SerialDevice`] owns the lifecycle; the platform specifics sit behind the
//! [`SerialBackend`]/[`OsHandle`] traits with one native backend per target
//! plus an in-memory [`LoopbackBackend`] for simulation and tests.

pub mod device;
pub mod discovery;
pub mod error;
pub mod loopback;
pub mod monitor;
pub mod os_error;
pub mod traits;

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

pub use device::{ClosingPort, CloseHook, SerialDevice};
pub use discovery::{list_ports, PortKind, PortSummary};
pub use error::{LineControlError, PortError};
pub use loopback::{FaultOp, LineEvent, LoopbackBackend, LoopbackPeer};
pub use monitor::{DeviceEvent, DeviceEvents};
pub use os_error::{describe, OsError};
pub use traits::*;

/// The backend for the platform being built.
#[cfg(unix)]
pub type NativeBackend = posix::PosixBackend;

/// The backend for the platform being built.
#[cfg(windows)]
pub type NativeBackend = windows::WindowsBackend;
