//! Win32 serial backend (overlapped I/O on COM handles).
//!
//! Handles are created with share mode 0 and `FILE_FLAG_OVERLAPPED`. Comm
//! timeouts are set so `ReadFile` returns at once with whatever is queued and
//! `WriteFile` gives up after [`WRITE_TIMEOUT_MS`] with a partial count, so
//! neither blocks on a held flow-control line. Readiness waits use an
//! overlapped `WaitCommEvent(EV_RXCHAR)` bounded by `WaitForSingleObject`.
//! Every overlapped operation that is abandoned is cancelled and reaped before
//! its `OVERLAPPED` goes out of scope.

use super::os_error::OsError;
use super::traits::{BaudRate, Line, OpenMode, OsHandle, ReadinessWaiter, SerialBackend};
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::time::Duration;

use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
use winapi::shared::winerror::{ERROR_IO_PENDING, ERROR_SEM_TIMEOUT, WAIT_TIMEOUT};
use winapi::um::commapi::{
    ClearCommError, EscapeCommFunction, GetCommState, SetCommMask, SetCommState, SetCommTimeouts,
    WaitCommEvent,
};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::{CloseHandle, DuplicateHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::{CancelIoEx, GetOverlappedResult};
use winapi::um::minwinbase::OVERLAPPED;
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::synchapi::{CreateEventW, WaitForSingleObject};
use winapi::um::winbase::{
    CBR_115200, CBR_1200, CBR_19200, CBR_2400, CBR_300, CBR_38400, CBR_4800, CBR_57600, CBR_9600,
    CLRDTR, CLRRTS, COMMTIMEOUTS, COMSTAT, DCB, FILE_FLAG_OVERLAPPED, SETDTR, SETRTS,
    WAIT_OBJECT_0,
};
use winapi::um::winnt::{DUPLICATE_SAME_ACCESS, GENERIC_READ, GENERIC_WRITE, HANDLE, MAXDWORD};

/// Comm event mask bit for "a character was received" (`winbase.h`).
const EV_RXCHAR: DWORD = 0x0001;

/// Longest a single `WriteFile` may wait for the driver to take bytes.
const WRITE_TIMEOUT_MS: DWORD = 50;

/// Upper bound on waiting for a started read or write to complete. Reads
/// finish at once and writes within [`WRITE_TIMEOUT_MS`]; this only guards
/// against a driver ignoring its timeouts.
const COMPLETION_LIMIT: Duration = Duration::from_millis(500);

/// Backend for `COMn` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsBackend;

impl SerialBackend for WindowsBackend {
    type Handle = ComHandle;

    fn open(&self, port: &str, mode: OpenMode, baud: BaudRate) -> Result<ComHandle, OsError> {
        let mut access: DWORD = 0;
        if mode.readable() {
            access |= GENERIC_READ;
        }
        if mode.writable() {
            access |= GENERIC_WRITE;
        }

        let path = device_path(port);
        let raw = unsafe {
            CreateFileW(
                path.as_ptr(),
                access,
                0,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if raw == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }

        // Any `?` below drops `owned`, which closes the handle.
        let owned = OwnedHandle(raw);
        let event = Event::new()?;
        let handle = ComHandle {
            handle: owned,
            event,
        };
        handle.configure(baud)?;
        Ok(handle)
    }
}

/// An open COM port plus the event used for its overlapped operations.
#[derive(Debug)]
pub struct ComHandle {
    handle: OwnedHandle,
    event: Event,
}

impl ComHandle {
    fn configure(&self, baud: BaudRate) -> Result<(), OsError> {
        let h = self.handle.0;
        let mut dcb: DCB = unsafe { std::mem::zeroed() };
        dcb.DCBlength = std::mem::size_of::<DCB>() as DWORD;
        if unsafe { GetCommState(h, &mut dcb) } == FALSE {
            return Err(last_error());
        }
        dcb.BaudRate = cbr_constant(baud);
        if unsafe { SetCommState(h, &mut dcb) } == FALSE {
            return Err(last_error());
        }

        let mut timeouts = comm_timeouts();
        if unsafe { SetCommTimeouts(h, &mut timeouts) } == FALSE {
            return Err(last_error());
        }
        if unsafe { SetCommMask(h, EV_RXCHAR) } == FALSE {
            return Err(last_error());
        }
        Ok(())
    }

    fn transfer<F>(&mut self, start: F) -> Result<usize, OsError>
    where
        F: FnOnce(HANDLE, *mut DWORD, *mut OVERLAPPED) -> i32,
    {
        let mut overlapped = self.event.overlapped();
        let mut done: DWORD = 0;
        let started = start(
            self.handle.0,
            &mut done as *mut DWORD,
            &mut overlapped as *mut OVERLAPPED,
        );
        if started == FALSE {
            let err = unsafe { GetLastError() };
            if err != ERROR_IO_PENDING {
                return Err(OsError::from_code(err as i32));
            }
            done = match finish_pending(self.handle.0, &mut overlapped, COMPLETION_LIMIT)? {
                Pending::Completed(n) | Pending::Cancelled(n) => n,
            };
        }
        Ok(done as usize)
    }
}

impl OsHandle for ComHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OsError> {
        let len = buf.len().min(MAXDWORD as usize) as DWORD;
        let data = buf.as_mut_ptr();
        self.transfer(|h, done, ov| unsafe { ReadFile(h, data as *mut _, len, done, ov) })
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OsError> {
        let len = buf.len().min(MAXDWORD as usize) as DWORD;
        let data = buf.as_ptr();
        self.transfer(|h, done, ov| unsafe { WriteFile(h, data as *const _, len, done, ov) })
    }

    fn set_line(&mut self, line: Line, level: bool) -> Result<(), OsError> {
        let func = match (line, level) {
            (Line::Dtr, true) => SETDTR,
            (Line::Dtr, false) => CLRDTR,
            (Line::Rts, true) => SETRTS,
            (Line::Rts, false) => CLRRTS,
        };
        if unsafe { EscapeCommFunction(self.handle.0, func) } == FALSE {
            return Err(last_error());
        }
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, OsError> {
        wait_rx(self.handle.0, &self.event, timeout)
    }

    fn bytes_available(&self) -> Result<usize, OsError> {
        queued_bytes(self.handle.0)
    }

    fn waiter(&self) -> Result<Box<dyn ReadinessWaiter>, OsError> {
        let mut dup: HANDLE = ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                self.handle.0,
                GetCurrentProcess(),
                &mut dup,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == FALSE {
            return Err(last_error());
        }
        let handle = OwnedHandle(dup);
        Ok(Box::new(ComWaiter {
            handle,
            event: Event::new()?,
        }))
    }
}

/// Duplicated COM handle waited on by the read monitor.
struct ComWaiter {
    handle: OwnedHandle,
    event: Event,
}

impl ReadinessWaiter for ComWaiter {
    fn wait(&mut self, timeout: Duration) -> Result<bool, OsError> {
        wait_rx(self.handle.0, &self.event, timeout)
    }

    fn pending(&mut self) -> Result<usize, OsError> {
        queued_bytes(self.handle.0)
    }
}

/// `CloseHandle` on drop.
#[derive(Debug)]
struct OwnedHandle(HANDLE);

// The handle is only ever used by its single owner.
unsafe impl Send for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Manual-reset event backing overlapped operations.
#[derive(Debug)]
struct Event(OwnedHandle);

impl Event {
    fn new() -> Result<Self, OsError> {
        let raw = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
        if raw.is_null() {
            return Err(last_error());
        }
        Ok(Self(OwnedHandle(raw)))
    }

    fn overlapped(&self) -> OVERLAPPED {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.hEvent = (self.0).0;
        overlapped
    }
}

/// MAXDWORD/0/0 makes reads complete immediately with whatever is queued.
/// A zero write constant would disable write timeouts altogether.
fn comm_timeouts() -> COMMTIMEOUTS {
    COMMTIMEOUTS {
        ReadIntervalTimeout: MAXDWORD,
        ReadTotalTimeoutMultiplier: 0,
        ReadTotalTimeoutConstant: 0,
        WriteTotalTimeoutMultiplier: 0,
        WriteTotalTimeoutConstant: WRITE_TIMEOUT_MS,
    }
}

/// How an overlapped operation that was pending ended.
enum Pending {
    /// Completed within the limit, with the bytes it transferred.
    Completed(DWORD),
    /// Cancelled at the limit; bytes moved before cancellation.
    Cancelled(DWORD),
}

/// Wait up to `limit` for the operation started on `overlapped`.
///
/// If the wait times out or fails, the operation is cancelled and reaped so
/// the driver no longer references `overlapped` when this returns.
fn finish_pending(
    h: HANDLE,
    overlapped: &mut OVERLAPPED,
    limit: Duration,
) -> Result<Pending, OsError> {
    let millis = limit.as_millis().min((MAXDWORD - 1) as u128) as DWORD;
    let waited = unsafe { WaitForSingleObject(overlapped.hEvent, millis) };
    let mut done: DWORD = 0;

    if waited == WAIT_OBJECT_0 {
        if unsafe { GetOverlappedResult(h, overlapped, &mut done, FALSE) } == FALSE {
            let err = unsafe { GetLastError() };
            // A write that hit its total timeout still reports what it sent.
            if err != ERROR_SEM_TIMEOUT {
                return Err(OsError::from_code(err as i32));
            }
        }
        return Ok(Pending::Completed(done));
    }

    let wait_error = (waited != WAIT_TIMEOUT).then(last_error);
    unsafe {
        CancelIoEx(h, overlapped);
        GetOverlappedResult(h, overlapped, &mut done, TRUE);
    }
    match wait_error {
        Some(err) => Err(err),
        None => Ok(Pending::Cancelled(done)),
    }
}

fn wait_rx(h: HANDLE, event: &Event, timeout: Duration) -> Result<bool, OsError> {
    if queued_bytes(h)? > 0 {
        return Ok(true);
    }

    let mut overlapped = event.overlapped();
    let mut mask: DWORD = 0;
    if unsafe { WaitCommEvent(h, &mut mask, &mut overlapped) } == FALSE {
        let err = unsafe { GetLastError() };
        if err != ERROR_IO_PENDING {
            return Err(OsError::from_code(err as i32));
        }
        if let Pending::Cancelled(_) = finish_pending(h, &mut overlapped, timeout)? {
            return Ok(queued_bytes(h)? > 0);
        }
    }

    Ok(mask & EV_RXCHAR != 0 || queued_bytes(h)? > 0)
}

fn queued_bytes(h: HANDLE) -> Result<usize, OsError> {
    let mut errors: DWORD = 0;
    let mut stat: COMSTAT = unsafe { std::mem::zeroed() };
    if unsafe { ClearCommError(h, &mut errors, &mut stat) } == FALSE {
        return Err(last_error());
    }
    Ok(stat.cbInQue as usize)
}

fn last_error() -> OsError {
    OsError::from_code(unsafe { GetLastError() } as i32)
}

/// `COM10` and above are only reachable through the `\\.\` namespace.
fn device_path(port: &str) -> Vec<u16> {
    let name = if port.starts_with(r"\\.\") {
        port.to_string()
    } else {
        format!(r"\\.\{port}")
    };
    OsStr::new(&name).encode_wide().chain(Some(0)).collect()
}

fn cbr_constant(baud: BaudRate) -> DWORD {
    match baud {
        BaudRate::B300 => CBR_300,
        BaudRate::B1200 => CBR_1200,
        BaudRate::B2400 => CBR_2400,
        BaudRate::B4800 => CBR_4800,
        BaudRate::B9600 => CBR_9600,
        BaudRate::B19200 => CBR_19200,
        BaudRate::B38400 => CBR_38400,
        BaudRate::B57600 => CBR_57600,
        BaudRate::B115200 => CBR_115200,
    }
}
