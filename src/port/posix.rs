//! POSIX serial backend built on `serialport::TTYPort`.
//!
//! `TTYPort` opens the node with `O_NOCTTY`, claims it with `TIOCEXCL`,
//! switches it to raw mode and applies the speed. On top of that the
//! descriptor is put back into non-blocking mode so reads and writes move
//! only what the driver has or takes right now, and readiness is reported
//! through `poll(2)` on the raw descriptor.

use super::os_error::OsError;
use super::traits::{BaudRate, Line, OpenMode, OsHandle, ReadinessWaiter, SerialBackend};
use serialport::{SerialPort, TTYPort};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Backend for `/dev/tty*` style device nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixBackend;

impl SerialBackend for PosixBackend {
    type Handle = PosixHandle;

    /// `TTYPort` always opens read-write; the device enforces `mode`.
    fn open(&self, port: &str, _mode: OpenMode, baud: BaudRate) -> Result<PosixHandle, OsError> {
        let port = serialport::new(port, baud.as_u32())
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::ZERO)
            .open_native()
            .map_err(serial_error)?;

        // Dropping `port` on failure closes the descriptor.
        set_nonblocking(port.as_raw_fd())?;
        Ok(PosixHandle { port })
    }
}

/// An open terminal device.
pub struct PosixHandle {
    port: TTYPort,
}

impl fmt::Debug for PosixHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixHandle")
            .field("port", &self.port.name())
            .field("fd", &self.port.as_raw_fd())
            .finish()
    }
}

impl OsHandle for PosixHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OsError> {
        nonblocking(self.port.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OsError> {
        nonblocking(self.port.write(buf))
    }

    fn set_line(&mut self, line: Line, level: bool) -> Result<(), OsError> {
        match line {
            Line::Dtr => self.port.write_data_terminal_ready(level),
            Line::Rts => self.port.write_request_to_send(level),
        }
        .map_err(serial_error)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, OsError> {
        poll_readable(self.port.as_raw_fd(), timeout)
    }

    fn bytes_available(&self) -> Result<usize, OsError> {
        queued_bytes(&self.port)
    }

    fn waiter(&self) -> Result<Box<dyn ReadinessWaiter>, OsError> {
        let port = self.port.try_clone_native().map_err(serial_error)?;
        Ok(Box::new(PosixWaiter { port }))
    }
}

/// Duplicated descriptor polled by the read monitor.
struct PosixWaiter {
    port: TTYPort,
}

impl ReadinessWaiter for PosixWaiter {
    fn wait(&mut self, timeout: Duration) -> Result<bool, OsError> {
        poll_readable(self.port.as_raw_fd(), timeout)
    }

    fn pending(&mut self) -> Result<usize, OsError> {
        queued_bytes(&self.port)
    }
}

fn queued_bytes(port: &TTYPort) -> Result<usize, OsError> {
    port.bytes_to_read()
        .map(|n| n as usize)
        .map_err(serial_error)
}

/// `TTYPort` reports an empty queue or a full output buffer as a timeout.
fn nonblocking(result: io::Result<usize>) -> Result<usize, OsError> {
    match result {
        Ok(n) => Ok(n),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        Err(err) => Err(io_error(err)),
    }
}

/// `serialport` keeps the errno text but not the number; recover the code
/// from the error kind and keep the original message.
fn serial_error(err: serialport::Error) -> OsError {
    let code = match err.kind() {
        serialport::ErrorKind::NoDevice => libc::ENOENT,
        serialport::ErrorKind::InvalidInput => libc::EINVAL,
        serialport::ErrorKind::Io(kind) => errno_for(kind),
        _ => libc::EIO,
    };
    with_message(code, err.to_string())
}

fn io_error(err: io::Error) -> OsError {
    match err.raw_os_error() {
        Some(code) => OsError::from_code(code),
        None => with_message(errno_for(err.kind()), err.to_string()),
    }
}

fn with_message(code: i32, message: String) -> OsError {
    if message.is_empty() {
        OsError::from_code(code)
    } else {
        OsError { code, message }
    }
}

fn errno_for(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        _ => libc::EIO,
    }
}

/// `TTYPort` clears `O_NONBLOCK` after opening; put it back.
fn set_nonblocking(fd: RawFd) -> Result<(), OsError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(OsError::last());
    }
    Ok(())
}

fn poll_readable(fd: RawFd, timeout: Duration) -> Result<bool, OsError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = OsError::last();
            if err.code == libc::EINTR && !remaining.is_zero() {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & libc::POLLIN != 0 {
            return Ok(true);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(OsError::from_code(libc::EBADF));
        }
        // POLLHUP / POLLERR: the device went away.
        return Err(OsError::from_code(libc::EIO));
    }
}
