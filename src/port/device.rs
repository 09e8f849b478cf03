//! The serial device: a named port with an open/close lifecycle.
//!
//! A [`SerialDevice`] is either closed or open in one [`OpenMode`]; the OS
//! handle exists exactly while it is open and is released on [`close`] or
//! when the device is dropped. Every failure is recorded as the device's
//! error string before being returned, so the last diagnostic can be read
//! back at any time with [`error_string`].
//!
//! [`close`]: SerialDevice::close
//! [`error_string`]: SerialDevice::error_string

use super::error::{LineControlError, PortError};
use super::monitor::{DeviceEvent, DeviceEvents, EventHub, ReadMonitor, Readiness};
use super::os_error::OsError;
use super::traits::{BaudRate, Line, OpenMode, OsHandle, SerialBackend};
use super::NativeBackend;
use std::fmt;
use std::time::{Duration, Instant};

/// Hook run while the handle is still open, just before it is released.
pub type CloseHook = Box<dyn FnMut(&mut ClosingPort<'_>) + Send>;

/// What a close hook can still do with the port.
pub struct ClosingPort<'a> {
    port: &'a str,
    handle: &'a mut dyn OsHandle,
}

impl ClosingPort<'_> {
    pub fn port_name(&self) -> &str {
        self.port
    }

    /// Write final bytes (e.g. a protocol trailer) before the handle goes.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, OsError> {
        self.handle.write(data)
    }

    pub fn bytes_available(&self) -> Result<usize, OsError> {
        self.handle.bytes_available()
    }
}

enum DeviceState<H> {
    Closed,
    Open { mode: OpenMode, handle: H },
}

/// A serial port device.
///
/// The device is not meant to be shared between threads; move it to the task
/// that drives the transfer.
///
/// # Example
/// ```no_run
/// use arduino_serial::port::{OpenMode, SerialDevice};
///
/// let mut device = SerialDevice::new("/dev/ttyACM0", 115200);
/// device.open(OpenMode::ReadWrite)?;
/// device.write(b"\x30\x20")?;
/// device.close();
/// # Ok::<(), arduino_serial::port::PortError>(())
/// ```
pub struct SerialDevice<B: SerialBackend = NativeBackend> {
    backend: B,
    port: String,
    baud: u32,
    state: DeviceState<B::Handle>,
    error: String,
    hub: EventHub,
    close_hooks: Vec<CloseHook>,
    monitor: Option<ReadMonitor>,
}

impl SerialDevice<NativeBackend> {
    /// A closed device for `port` on the platform's native backend.
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self::with_backend(NativeBackend::default(), port, baud)
    }
}

impl<B: SerialBackend> SerialDevice<B> {
    /// A closed device for `port` served by `backend`.
    ///
    /// The baud rate is validated when the device is opened.
    pub fn with_backend(backend: B, port: impl Into<String>, baud: u32) -> Self {
        Self {
            backend,
            port: port.into(),
            baud,
            state: DeviceState::Closed,
            error: String::new(),
            hub: EventHub::default(),
            close_hooks: Vec::new(),
            monitor: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    /// Change the speed used by the next `open`.
    pub fn set_baud_rate(&mut self, baud: u32) -> Result<(), PortError> {
        if self.is_open() {
            let err = PortError::AlreadyOpen {
                port: self.port.clone(),
            };
            return Err(self.fail(err));
        }
        self.baud = baud;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, DeviceState::Open { .. })
    }

    /// `None` while closed.
    pub fn open_mode(&self) -> Option<OpenMode> {
        match self.state {
            DeviceState::Closed => None,
            DeviceState::Open { mode, .. } => Some(mode),
        }
    }

    /// The last recorded diagnostic; empty after a successful open or close.
    pub fn error_string(&self) -> &str {
        &self.error
    }

    /// Open the port.
    ///
    /// Fails with [`PortError::AlreadyOpen`] if a handle is already held (the
    /// running session is left alone), with [`PortError::InvalidBaudRate`]
    /// before touching the OS, or with [`PortError::HandleAcquisition`] when
    /// the OS refuses the port.
    pub fn open(&mut self, mode: OpenMode) -> Result<(), PortError> {
        if self.is_open() {
            let err = PortError::AlreadyOpen {
                port: self.port.clone(),
            };
            return Err(self.fail(err));
        }

        let baud = match BaudRate::try_from(self.baud) {
            Ok(baud) => baud,
            Err(err) => return Err(self.fail(err)),
        };

        match self.backend.open(&self.port, mode, baud) {
            Ok(handle) => {
                self.state = DeviceState::Open { mode, handle };
                self.error.clear();
                tracing::info!(port = %self.port, %baud, ?mode, "serial port opened");
                Ok(())
            }
            Err(source) => {
                let err = PortError::acquisition(self.port.clone(), source);
                Err(self.fail(err))
            }
        }
    }

    /// Close the port. Does nothing if it is not open.
    ///
    /// Read notifications stop first, then close hooks run and subscribers
    /// get [`DeviceEvent::AboutToClose`] while the handle is still valid;
    /// only then is the handle released.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }

        self.monitor = None;

        if let DeviceState::Open { handle, .. } = &mut self.state {
            let mut closing = ClosingPort {
                port: &self.port,
                handle,
            };
            for hook in &mut self.close_hooks {
                hook(&mut closing);
            }
        }
        self.hub.emit(DeviceEvent::AboutToClose);

        self.state = DeviceState::Closed;
        self.error.clear();
        tracing::info!(port = %self.port, "serial port closed");
    }

    /// Copy out whatever input is available now.
    ///
    /// `Ok(0)` means nothing was waiting; an `Err` is an actual failure.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PortError> {
        let result = match &mut self.state {
            DeviceState::Closed => Err(PortError::NotOpen),
            DeviceState::Open { mode, .. } if !mode.readable() => Err(PortError::NotReadable),
            DeviceState::Open { handle, .. } => handle.read(buf).map_err(PortError::Read),
        };

        match result {
            Ok(n) => {
                self.rearm_if_drained();
                Ok(n)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Queue as much of `buf` as the driver takes right now.
    ///
    /// Short counts are normal; the caller resumes from `buf[n..]`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, PortError> {
        let result = match &mut self.state {
            DeviceState::Closed => Err(PortError::NotOpen),
            DeviceState::Open { mode, .. } if !mode.writable() => Err(PortError::NotWritable),
            DeviceState::Open { handle, .. } => handle.write(buf).map_err(PortError::Write),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Block up to `timeout` for input. `false` on timeout, when closed or
    /// not readable, or on error (recorded in the error string).
    ///
    /// With read notifications on, the wait follows the monitor thread
    /// rather than issuing a second OS-level wait on the same device.
    pub fn wait_for_ready_read(&mut self, timeout: Duration) -> bool {
        let result = match &mut self.state {
            DeviceState::Closed => Err(PortError::NotOpen),
            DeviceState::Open { mode, .. } if !mode.readable() => Err(PortError::NotReadable),
            DeviceState::Open { handle, .. } => match &self.monitor {
                Some(monitor) => wait_with_monitor(handle, monitor.readiness(), timeout),
                None => handle.wait_readable(timeout),
            }
            .map_err(PortError::Wait),
        };

        match result {
            Ok(ready) => ready,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    /// Bytes waiting in the input queue.
    pub fn bytes_available(&mut self) -> Result<usize, PortError> {
        let result = match &self.state {
            DeviceState::Closed => Err(PortError::NotOpen),
            DeviceState::Open { handle, .. } => handle.bytes_available().map_err(PortError::Read),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Drive DTR. Used to reset a board into its bootloader.
    pub fn set_dtr(&mut self, enable: bool) -> Result<(), PortError> {
        self.set_line(Line::Dtr, enable)
    }

    /// Drive RTS.
    pub fn set_rts(&mut self, enable: bool) -> Result<(), PortError> {
        self.set_line(Line::Rts, enable)
    }

    fn set_line(&mut self, line: Line, level: bool) -> Result<(), PortError> {
        let result = match &mut self.state {
            DeviceState::Closed => Err(LineControlError::NotOpen),
            DeviceState::Open { handle, .. } => {
                handle.set_line(line, level).map_err(LineControlError::Os)
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!(port = %self.port, %line, level, "line set");
                Ok(())
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Subscribe to [`DeviceEvent`]s. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> DeviceEvents {
        self.hub.subscribe()
    }

    /// Register a hook that runs on every close, before the handle is
    /// released.
    pub fn on_about_to_close<F>(&mut self, hook: F)
    where
        F: FnMut(&mut ClosingPort<'_>) + Send + 'static,
    {
        self.close_hooks.push(Box::new(hook));
    }

    /// Turn [`DeviceEvent::ReadyRead`] notifications on or off.
    ///
    /// Enabling requires an open, readable device. Closing the device turns
    /// notifications off again.
    pub fn set_read_notifications(&mut self, enabled: bool) -> Result<(), PortError> {
        if !enabled {
            if self.monitor.take().is_some() {
                tracing::debug!(port = %self.port, "read notifications disabled");
            }
            return Ok(());
        }
        if self.monitor.is_some() {
            return Ok(());
        }

        let waiter = match &self.state {
            DeviceState::Closed => Err(PortError::NotOpen),
            DeviceState::Open { mode, .. } if !mode.readable() => Err(PortError::NotReadable),
            DeviceState::Open { handle, .. } => handle.waiter().map_err(PortError::Wait),
        };
        let started = waiter.and_then(|waiter| {
            ReadMonitor::start(&self.port, waiter, self.hub.clone()).map_err(PortError::Wait)
        });

        match started {
            Ok(monitor) => {
                self.monitor = Some(monitor);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub fn read_notifications_enabled(&self) -> bool {
        self.monitor.is_some()
    }

    fn rearm_if_drained(&self) {
        if let (Some(monitor), DeviceState::Open { handle, .. }) = (&self.monitor, &self.state) {
            if matches!(handle.bytes_available(), Ok(0)) {
                monitor.rearm();
            }
        }
    }

    /// Record `err` as the current diagnostic and hand it back.
    fn fail(&mut self, err: PortError) -> PortError {
        self.error = match err.os_error() {
            Some(os) => os.message.clone(),
            None => err.to_string(),
        };
        tracing::warn!(port = %self.port, error = %err, "serial operation failed");
        err
    }
}

/// Wait for input using the monitor's readiness signal. Falls back to the
/// handle's own wait if the monitor thread has exited.
fn wait_with_monitor<H: OsHandle>(
    handle: &mut H,
    readiness: &Readiness,
    timeout: Duration,
) -> Result<bool, OsError> {
    let deadline = Instant::now() + timeout;
    loop {
        // Take the generation before checking the queue so a signal raised
        // in between is not lost.
        let Some(seen) = readiness.generation() else {
            return handle.wait_readable(deadline.saturating_duration_since(Instant::now()));
        };
        if handle.bytes_available()? > 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        readiness.wait_past(seen, deadline);
    }
}

impl<B: SerialBackend> Drop for SerialDevice<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: SerialBackend> fmt::Debug for SerialDevice<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDevice")
            .field("port", &self.port)
            .field("baud_rate", &self.baud)
            .field("mode", &self.open_mode())
            .field("error", &self.error)
            .finish()
    }
}
