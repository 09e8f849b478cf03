//! Behavioural contract of `SerialDevice`, exercised through the loopback
//! backend and, where a missing device is enough, the native one.

mod common;

use arduino_serial::port::{
    describe, DeviceEvent, FaultOp, Line, LineControlError, OpenMode, PortError, SerialDevice,
};
use common::{board, next_event, null_modem, read_exact, write_all};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

// ============================================================================
// Open / close lifecycle
// ============================================================================

#[test]
fn test_invalid_baud_is_rejected_before_the_os() {
    for baud in [0, 110, 14400, 250000] {
        let (mut dev, peer) = board("COM3", baud);
        let err = dev.open(OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, PortError::InvalidBaudRate(b) if b == baud));
        assert!(!dev.is_open());
        assert_eq!(peer.open_calls(), 0);
    }
}

#[test]
fn test_every_supported_baud_opens() {
    for baud in [300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200] {
        let (mut dev, peer) = board("COM3", baud);
        dev.open(OpenMode::ReadWrite).unwrap();
        let (_, opened_at) = peer.last_open().unwrap();
        assert_eq!(u32::from(opened_at), baud);
    }
}

#[test]
fn test_double_open_keeps_first_session() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadWrite).unwrap();

    let err = dev.open(OpenMode::ReadWrite).unwrap_err();
    assert!(matches!(err, PortError::AlreadyOpen { .. }));
    assert_eq!(peer.open_calls(), 1);

    assert_eq!(dev.write(b"still here").unwrap(), 10);
    assert_eq!(peer.take_written(), b"still here");
}

#[test]
fn test_operations_fail_after_close_until_reopen() {
    let (mut dev, _peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadWrite).unwrap();
    dev.close();

    let mut buf = [0u8; 8];
    assert!(matches!(dev.read(&mut buf), Err(PortError::NotOpen)));
    assert!(matches!(dev.write(b"x"), Err(PortError::NotOpen)));
    assert!(matches!(
        dev.set_dtr(true),
        Err(PortError::LineControl(LineControlError::NotOpen))
    ));
    assert!(!dev.wait_for_ready_read(Duration::from_millis(1)));

    dev.open(OpenMode::ReadWrite).unwrap();
    assert_eq!(dev.write(b"x").unwrap(), 1);
    dev.set_dtr(true).unwrap();
}

#[test]
fn test_close_is_idempotent() {
    let (mut dev, peer) = board("COM3", 9600);
    let mut events = dev.subscribe();
    dev.close();
    dev.open(OpenMode::ReadOnly).unwrap();
    dev.close();
    dev.close();

    assert!(!peer.is_in_use());
    assert_eq!(events.try_recv().unwrap(), DeviceEvent::AboutToClose);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_port_is_exclusive() {
    let backend = arduino_serial::LoopbackBackend::new();
    let _peer = backend.add_port("COM3");
    let mut first = SerialDevice::with_backend(backend.clone(), "COM3", 9600);
    let mut second = SerialDevice::with_backend(backend, "COM3", 9600);

    first.open(OpenMode::ReadWrite).unwrap();
    let err = second.open(OpenMode::ReadWrite).unwrap_err();
    assert!(matches!(err, PortError::HandleAcquisition { .. }));
    assert!(!second.error_string().is_empty());

    first.close();
    second.open(OpenMode::ReadWrite).unwrap();
}

// ============================================================================
// Error reporting
// ============================================================================

#[test]
fn test_distinct_os_codes_give_distinct_messages() {
    let (mut dev, peer) = board("COM3", 9600);
    let mut seen = HashSet::new();

    for code in [2, 5, 13, 16] {
        peer.fail_next(FaultOp::Open, code);
        let err = dev.open(OpenMode::ReadWrite).unwrap_err();
        let os = err.os_error().expect("acquisition carries the OS error");
        assert_eq!(os.code, code);

        let message = dev.error_string().to_string();
        assert!(!message.is_empty());
        assert_eq!(message, describe(code));
        seen.insert(message);
    }
    assert_eq!(seen.len(), 4);
}

#[test]
fn test_read_and_write_faults_are_captured() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadWrite).unwrap();

    peer.fail_next(FaultOp::Write, 5);
    assert!(matches!(dev.write(b"x"), Err(PortError::Write(ref os)) if os.code == 5));
    assert_eq!(dev.error_string(), describe(5));

    peer.fail_next(FaultOp::Read, 13);
    let mut buf = [0u8; 1];
    assert!(matches!(dev.read(&mut buf), Err(PortError::Read(ref os)) if os.code == 13));
    assert_eq!(dev.error_string(), describe(13));

    // Device stays open after transient failures.
    assert_eq!(dev.write(b"ok").unwrap(), 2);
}

// ============================================================================
// Data transfer
// ============================================================================

#[test]
fn test_read_never_blocks() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadOnly).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(dev.read(&mut buf).unwrap(), 0);

    peer.inject(b"hello");
    assert_eq!(dev.bytes_available().unwrap(), 5);
    assert_eq!(dev.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
}

#[test]
fn test_wait_for_ready_read_is_bounded() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadOnly).unwrap();

    let started = std::time::Instant::now();
    assert!(!dev.wait_for_ready_read(Duration::from_millis(30)));
    assert!(started.elapsed() >= Duration::from_millis(30));

    peer.inject(b"!");
    assert!(dev.wait_for_ready_read(Duration::from_millis(30)));
}

#[test]
fn test_short_writes_resume() {
    let (mut dev, peer) = board("COM3", 9600);
    peer.set_chunk_limit(Some(7));
    dev.open(OpenMode::ReadWrite).unwrap();

    let payload: Vec<u8> = (0..100).collect();
    let calls = write_all(&mut dev, &payload);
    assert_eq!(calls, 15);
    assert_eq!(peer.take_written(), payload);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_null_modem_preserves_bytes_and_order(
        payload in proptest::collection::vec(any::<u8>(), 1..1024),
        write_chunk in 1usize..64,
        read_chunk in 1usize..97,
    ) {
        let (mut a, mut b, peer_a, _peer_b) = null_modem(115200);
        peer_a.set_chunk_limit(Some(write_chunk));
        a.open(OpenMode::WriteOnly).unwrap();
        b.open(OpenMode::ReadOnly).unwrap();

        write_all(&mut a, &payload);
        let received = read_exact(&mut b, payload.len(), read_chunk, Duration::from_secs(5));
        prop_assert_eq!(received, payload);
    }
}

// ============================================================================
// Line control
// ============================================================================

#[test]
fn test_dtr_and_rts_are_independent() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadWrite).unwrap();

    dev.set_dtr(true).unwrap();
    dev.set_rts(true).unwrap();
    dev.set_rts(false).unwrap();

    assert!(peer.line_level(Line::Dtr));
    assert!(!peer.line_level(Line::Rts));
    assert_eq!(peer.line_log().len(), 3);
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn test_ready_read_fires_once_per_transition() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadOnly).unwrap();
    let mut events = dev.subscribe();
    dev.set_read_notifications(true).unwrap();

    peer.inject(b"first");
    assert_eq!(
        next_event(&mut events, Duration::from_secs(2)),
        Some(DeviceEvent::ReadyRead)
    );

    // More data before the queue was drained is the same transition.
    peer.inject(b" more");
    assert_eq!(next_event(&mut events, Duration::from_millis(200)), None);

    let mut buf = [0u8; 64];
    assert_eq!(dev.read(&mut buf).unwrap(), 10);

    peer.inject(b"second");
    assert_eq!(
        next_event(&mut events, Duration::from_secs(2)),
        Some(DeviceEvent::ReadyRead)
    );
}

#[test]
fn test_notifications_stop_when_disabled() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadOnly).unwrap();
    let mut events = dev.subscribe();
    dev.set_read_notifications(true).unwrap();
    dev.set_read_notifications(false).unwrap();

    peer.inject(b"ignored");
    assert_eq!(next_event(&mut events, Duration::from_millis(200)), None);
    assert!(!dev.read_notifications_enabled());
}

#[test]
fn test_close_hook_can_still_write() {
    let (mut dev, peer) = board("COM3", 9600);
    let mut events = dev.subscribe();
    dev.on_about_to_close(|closing| {
        // Tell the sketch we are leaving.
        let _ = closing.write(b"bye\n");
    });

    dev.open(OpenMode::ReadWrite).unwrap();
    dev.close();

    assert_eq!(peer.take_written(), b"bye\n");
    assert_eq!(events.try_recv().unwrap(), DeviceEvent::AboutToClose);
    assert!(!peer.is_in_use());
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_upload_style_session_on_com3() {
    let (mut dev, peer) = board("COM3", 9600);
    dev.open(OpenMode::ReadWrite).unwrap();

    let image: Vec<u8> = (0..128u8).collect();
    write_all(&mut dev, &image);

    dev.set_dtr(true).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    dev.set_dtr(false).unwrap();
    dev.close();

    let mut buf = [0u8; 4];
    assert!(dev.read(&mut buf).is_err());
    assert_eq!(peer.take_written(), image);

    let log = peer.line_log();
    assert_eq!(log.len(), 2);
    assert!(log[1].at - log[0].at >= Duration::from_millis(50));
}

#[test]
fn test_scenario_missing_port_com99() {
    let mut dev = SerialDevice::new("COM99", 9600);
    let err = dev.open(OpenMode::ReadWrite).unwrap_err();

    assert!(matches!(err, PortError::HandleAcquisition { ref port, .. } if port == "COM99"));
    assert!(!dev.is_open());
    assert!(!dev.error_string().is_empty());
}

#[test]
fn test_scenario_missing_port_loopback() {
    let backend = arduino_serial::LoopbackBackend::new();
    let mut dev = SerialDevice::with_backend(backend, "COM99", 9600);
    let err = dev.open(OpenMode::ReadWrite).unwrap_err();
    assert_eq!(err.os_error().map(|os| os.code), Some(2));
    assert_eq!(dev.error_string(), describe(2));
}

// ============================================================================
// Native backend over a pseudo-terminal
// ============================================================================

#[cfg(target_os = "linux")]
mod pty {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::ffi::CStr;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;
    use std::time::Instant;

    /// Open a pseudo-terminal; returns the master side and the slave path.
    fn open_pty() -> (File, String) {
        unsafe {
            let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(fd >= 0, "posix_openpt failed");
            let master = File::from_raw_fd(fd);
            assert_eq!(libc::grantpt(fd), 0);
            assert_eq!(libc::unlockpt(fd), 0);
            let name = libc::ptsname(fd);
            assert!(!name.is_null());
            let path = CStr::from_ptr(name).to_string_lossy().into_owned();
            (master, path)
        }
    }

    #[test]
    #[serial]
    fn test_native_device_on_pty() {
        let (mut master, slave) = open_pty();
        let mut dev = SerialDevice::new(slave, 115200);
        dev.open(OpenMode::ReadWrite).unwrap();

        let started = Instant::now();
        assert!(!dev.wait_for_ready_read(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(dev.bytes_available().unwrap(), 0);
        let mut buf = [0u8; 64];
        assert_eq!(dev.read(&mut buf).unwrap(), 0);

        let mut events = dev.subscribe();
        dev.set_read_notifications(true).unwrap();

        // Every byte value, CR, XON/XOFF and ^C included, must arrive as sent.
        let payload: Vec<u8> = (0..=255u8).collect();
        master.write_all(&payload).unwrap();

        assert_eq!(
            next_event(&mut events, Duration::from_secs(2)),
            Some(DeviceEvent::ReadyRead)
        );
        assert_eq!(next_event(&mut events, Duration::from_millis(100)), None);
        assert!(dev.wait_for_ready_read(Duration::from_secs(1)));
        assert!(dev.bytes_available().unwrap() > 0);

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < payload.len() && Instant::now() < deadline {
            let n = dev.read(&mut buf).unwrap();
            if n == 0 {
                dev.wait_for_ready_read(Duration::from_millis(50));
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);

        let outgoing: Vec<u8> = (0..128u8).collect();
        assert_eq!(dev.write(&outgoing).unwrap(), 128);
        let mut echoed = vec![0u8; 128];
        master.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, outgoing);

        dev.close();
        let mut saw_close = false;
        while let Ok(event) = events.try_recv() {
            saw_close |= event == DeviceEvent::AboutToClose;
        }
        assert!(saw_close);
        assert!(dev.error_string().is_empty());
    }
}

#[cfg(feature = "hardware-tests")]
mod hardware {
    use super::*;

    /// Needs a board on `ARDUINO_SERIAL_TEST_PORT`.
    #[test]
    fn test_real_board_reset() {
        let Ok(port) = std::env::var("ARDUINO_SERIAL_TEST_PORT") else {
            eprintln!("ARDUINO_SERIAL_TEST_PORT not set, skipping");
            return;
        };
        let mut dev = SerialDevice::new(port, 115200);
        dev.open(OpenMode::ReadWrite).unwrap();
        arduino_serial::upload::pulse_dtr(&mut dev, Duration::from_millis(100)).unwrap();
        dev.wait_for_ready_read(Duration::from_secs(2));
        dev.close();
        assert!(dev.error_string().is_empty());
    }
}
