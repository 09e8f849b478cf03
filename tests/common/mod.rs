//! Shared test utilities for arduino-serial integration tests.
//!
//! Everything here runs against the in-memory loopback backend so the tests
//! need no hardware.

#![allow(dead_code)]

use arduino_serial::port::{DeviceEvent, DeviceEvents, LoopbackBackend, LoopbackPeer, SerialDevice};
use arduino_serial::upload::UploadTimings;
use std::time::{Duration, Instant};

/// A backend with one virtual port and a device bound to it.
pub fn board(name: &str, baud: u32) -> (SerialDevice<LoopbackBackend>, LoopbackPeer) {
    let backend = LoopbackBackend::new();
    let peer = backend.add_port(name);
    (SerialDevice::with_backend(backend, name, baud), peer)
}

/// Two devices wired to each other through a null-modem pair.
pub fn null_modem(
    baud: u32,
) -> (
    SerialDevice<LoopbackBackend>,
    SerialDevice<LoopbackBackend>,
    LoopbackPeer,
    LoopbackPeer,
) {
    let backend = LoopbackBackend::new();
    let (peer_a, peer_b) = backend.add_pair("COM1", "COM2");
    let a = SerialDevice::with_backend(backend.clone(), "COM1", baud);
    let b = SerialDevice::with_backend(backend, "COM2", baud);
    (a, b, peer_a, peer_b)
}

/// Poll for the next event until `timeout`.
pub fn next_event(events: &mut DeviceEvents, timeout: Duration) -> Option<DeviceEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(event) = events.try_recv() {
            return Some(event);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Write all of `data`, resuming after short writes. Returns the call count.
pub fn write_all(device: &mut SerialDevice<LoopbackBackend>, data: &[u8]) -> usize {
    let mut written = 0;
    let mut calls = 0;
    while written < data.len() {
        written += device.write(&data[written..]).expect("write failed");
        calls += 1;
        assert!(calls < 100_000, "write made no progress");
    }
    calls
}

/// Read until `len` bytes arrived or `timeout` passed.
pub fn read_exact(
    device: &mut SerialDevice<LoopbackBackend>,
    len: usize,
    chunk: usize,
    timeout: Duration,
) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; chunk.max(1)];
    while out.len() < len && Instant::now() < deadline {
        let want = (len - out.len()).min(buf.len());
        let n = device.read(&mut buf[..want]).expect("read failed");
        if n == 0 {
            device.wait_for_ready_read(Duration::from_millis(20));
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Timings short enough for tests while still honouring the 50 ms pulse.
pub fn fast_timings() -> UploadTimings {
    UploadTimings {
        reset_pulse: Duration::from_millis(50),
        settle: Duration::from_millis(5),
        stall_timeout: Duration::from_millis(100),
        reply_timeout: Duration::from_millis(300),
    }
}

/// One Intel HEX record with a correct checksum.
pub fn hex_record(kind: u8, offset: u16, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8];
    bytes.extend_from_slice(&offset.to_be_bytes());
    bytes.push(kind);
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());
    let body: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{body}")
}
