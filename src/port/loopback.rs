//! In-memory serial backend for simulation and testing.
//!
//! [`LoopbackBackend`] hands out handles to named virtual ports. Each port is
//! a pair of byte queues: the far end is driven through a [`LoopbackPeer`]
//! (inject input, collect output, watch DTR/RTS), or two ports can be wired
//! back to back with [`LoopbackBackend::add_pair`]. OS failures are simulated
//! by queueing platform error codes against an operation.
//!
//! # Example
//! ```
//! use arduino_serial::port::{LoopbackBackend, OpenMode, SerialDevice};
//!
//! let backend = LoopbackBackend::new();
//! let peer = backend.add_port("COM3");
//!
//! let mut device = SerialDevice::with_backend(backend, "COM3", 9600);
//! device.open(OpenMode::ReadWrite).unwrap();
//!
//! device.write(b"Hello").unwrap();
//! assert_eq!(peer.take_written(), b"Hello");
//!
//! peer.inject(b"OK");
//! let mut buf = [0u8; 8];
//! assert_eq!(device.read(&mut buf).unwrap(), 2);
//! ```

use super::os_error::OsError;
use super::traits::{BaudRate, Line, OpenMode, OsHandle, ReadinessWaiter, SerialBackend};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `ENOENT` / `ERROR_FILE_NOT_FOUND`; both platforms use 2.
pub const NOT_FOUND_CODE: i32 = 2;

/// `EBUSY`, reported when a virtual port already has an owner.
pub const BUSY_CODE: i32 = 16;

/// Operation a simulated fault is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Open,
    Read,
    Write,
    Line,
    Wait,
}

/// One recorded modem line change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    pub line: Line,
    pub level: bool,
    pub at: Instant,
}

/// One direction of a virtual wire.
#[derive(Debug, Default)]
struct Wire {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Wire {
    fn push(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        data.extend(bytes);
        self.ready.notify_all();
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut data = self.data.lock();
        while data.is_empty() {
            if self.ready.wait_until(&mut data, deadline).timed_out() {
                return !data.is_empty();
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct PortControl {
    in_use: bool,
    open_calls: usize,
    last_mode: Option<OpenMode>,
    last_baud: Option<BaudRate>,
    faults: VecDeque<(FaultOp, i32)>,
    chunk_limit: Option<usize>,
    line_log: Vec<LineEvent>,
}

impl PortControl {
    fn take_fault(&mut self, op: FaultOp) -> Option<OsError> {
        let idx = self.faults.iter().position(|(o, _)| *o == op)?;
        self.faults.remove(idx).map(|(_, code)| OsError::from_code(code))
    }

    fn limit(&self, len: usize) -> usize {
        self.chunk_limit.map_or(len, |limit| len.min(limit))
    }
}

/// Shared state of one virtual port.
#[derive(Debug)]
struct PortShared {
    /// Bytes travelling towards the device.
    rx: Arc<Wire>,
    /// Bytes written by the device.
    tx: Arc<Wire>,
    control: Mutex<PortControl>,
}

/// Backend serving virtual ports by name.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBackend {
    ports: Arc<Mutex<HashMap<String, Arc<PortShared>>>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port whose far end is driven by the returned peer.
    pub fn add_port(&self, name: impl Into<String>) -> LoopbackPeer {
        let shared = Arc::new(PortShared {
            rx: Arc::new(Wire::default()),
            tx: Arc::new(Wire::default()),
            control: Mutex::new(PortControl::default()),
        });
        self.ports.lock().insert(name.into(), Arc::clone(&shared));
        LoopbackPeer { shared }
    }

    /// Register two ports connected to each other: what one writes, the
    /// other reads.
    pub fn add_pair(&self, a: impl Into<String>, b: impl Into<String>) -> (LoopbackPeer, LoopbackPeer) {
        let a_to_b = Arc::new(Wire::default());
        let b_to_a = Arc::new(Wire::default());
        let a_shared = Arc::new(PortShared {
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
            control: Mutex::new(PortControl::default()),
        });
        let b_shared = Arc::new(PortShared {
            rx: a_to_b,
            tx: b_to_a,
            control: Mutex::new(PortControl::default()),
        });

        let mut ports = self.ports.lock();
        ports.insert(a.into(), Arc::clone(&a_shared));
        ports.insert(b.into(), Arc::clone(&b_shared));
        (
            LoopbackPeer { shared: a_shared },
            LoopbackPeer { shared: b_shared },
        )
    }

    /// Names of all registered ports, sorted.
    pub fn port_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl SerialBackend for LoopbackBackend {
    type Handle = LoopbackHandle;

    fn open(&self, port: &str, mode: OpenMode, baud: BaudRate) -> Result<LoopbackHandle, OsError> {
        let shared = self
            .ports
            .lock()
            .get(port)
            .cloned()
            .ok_or_else(|| OsError::from_code(NOT_FOUND_CODE))?;

        {
            let mut control = shared.control.lock();
            control.open_calls += 1;
            if let Some(err) = control.take_fault(FaultOp::Open) {
                return Err(err);
            }
            if control.in_use {
                return Err(OsError::from_code(BUSY_CODE));
            }
            control.in_use = true;
            control.last_mode = Some(mode);
            control.last_baud = Some(baud);
        }

        Ok(LoopbackHandle { shared })
    }
}

/// Device-side handle to a virtual port. Dropping it frees the port.
#[derive(Debug)]
pub struct LoopbackHandle {
    shared: Arc<PortShared>,
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.shared.control.lock().in_use = false;
    }
}

impl OsHandle for LoopbackHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OsError> {
        let want = {
            let mut control = self.shared.control.lock();
            if let Some(err) = control.take_fault(FaultOp::Read) {
                return Err(err);
            }
            control.limit(buf.len())
        };

        let mut data = self.shared.rx.data.lock();
        let n = want.min(data.len());
        for (slot, byte) in buf.iter_mut().zip(data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OsError> {
        let n = {
            let mut control = self.shared.control.lock();
            if let Some(err) = control.take_fault(FaultOp::Write) {
                return Err(err);
            }
            control.limit(buf.len())
        };
        if n > 0 {
            self.shared.tx.push(&buf[..n]);
        }
        Ok(n)
    }

    fn set_line(&mut self, line: Line, level: bool) -> Result<(), OsError> {
        let mut control = self.shared.control.lock();
        if let Some(err) = control.take_fault(FaultOp::Line) {
            return Err(err);
        }
        control.line_log.push(LineEvent {
            line,
            level,
            at: Instant::now(),
        });
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, OsError> {
        if let Some(err) = self.shared.control.lock().take_fault(FaultOp::Wait) {
            return Err(err);
        }
        Ok(self.shared.rx.wait(timeout))
    }

    fn bytes_available(&self) -> Result<usize, OsError> {
        Ok(self.shared.rx.len())
    }

    fn waiter(&self) -> Result<Box<dyn ReadinessWaiter>, OsError> {
        Ok(Box::new(LoopbackWaiter {
            rx: Arc::clone(&self.shared.rx),
        }))
    }
}

struct LoopbackWaiter {
    rx: Arc<Wire>,
}

impl ReadinessWaiter for LoopbackWaiter {
    fn wait(&mut self, timeout: Duration) -> Result<bool, OsError> {
        Ok(self.rx.wait(timeout))
    }

    fn pending(&mut self) -> Result<usize, OsError> {
        Ok(self.rx.len())
    }
}

/// The far end of a virtual port.
#[derive(Debug, Clone)]
pub struct LoopbackPeer {
    shared: Arc<PortShared>,
}

impl LoopbackPeer {
    /// Make bytes available to the device.
    pub fn inject(&self, data: &[u8]) {
        self.shared.rx.push(data);
    }

    /// Drain and return everything the device has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        self.shared.tx.data.lock().drain(..).collect()
    }

    /// Bytes written by the device and not yet taken.
    pub fn written_len(&self) -> usize {
        self.shared.tx.len()
    }

    /// Bytes injected and not yet read by the device.
    pub fn unread_len(&self) -> usize {
        self.shared.rx.len()
    }

    /// Fail the next `op` on this port with the given platform code.
    pub fn fail_next(&self, op: FaultOp, code: i32) {
        self.shared.control.lock().faults.push_back((op, code));
    }

    /// Cap the number of bytes a single read or write call may move.
    /// `Some(0)` makes writes stall.
    pub fn set_chunk_limit(&self, limit: Option<usize>) {
        self.shared.control.lock().chunk_limit = limit;
    }

    /// Whether a device currently holds this port.
    pub fn is_in_use(&self) -> bool {
        self.shared.control.lock().in_use
    }

    /// How many times a device tried to open this port.
    pub fn open_calls(&self) -> usize {
        self.shared.control.lock().open_calls
    }

    /// Mode and speed of the most recent successful open.
    pub fn last_open(&self) -> Option<(OpenMode, BaudRate)> {
        let control = self.shared.control.lock();
        control.last_mode.zip(control.last_baud)
    }

    /// All DTR/RTS changes, oldest first.
    pub fn line_log(&self) -> Vec<LineEvent> {
        self.shared.control.lock().line_log.clone()
    }

    /// Current level of a modem line (lines start low).
    pub fn line_level(&self, line: Line) -> bool {
        self.shared
            .control
            .lock()
            .line_log
            .iter()
            .rev()
            .find(|event| event.line == line)
            .is_some_and(|event| event.level)
    }
}
