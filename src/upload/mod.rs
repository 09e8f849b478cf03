//! Upload pipeline: reset the board, stream firmware, optionally collect the
//! bootloader's reply.
//!
//! The pipeline is a strict sequence over one [`SerialDevice`]:
//!
//! 1. open read/write at the requested baud rate
//! 2. pulse DTR (when [`ResetPolicy::PulseDtr`]) and let the bootloader settle
//! 3. write the whole image, resuming after short writes
//! 4. read the expected reply, if any
//! 5. close
//!
//! The first failure aborts with an [`UploadError`] naming the phase. The
//! device is dropped, and therefore closed, on every path.

mod error;
mod firmware;

pub use error::{UploadError, UploadPhase};
pub use firmware::{parse_intel_hex, Firmware, FirmwareError, MAX_IMAGE_SIZE};

use crate::config::{Config, ConfigError, UploadConfig, MIN_RESET_PULSE_MS};
use crate::port::{NativeBackend, OpenMode, PortError, SerialBackend, SerialDevice};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

/// Pause between writes the driver refused outright.
const WRITE_BACKOFF: Duration = Duration::from_millis(2);

const DRAIN_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Stream into whatever is already running.
    None,
    /// Assert then release DTR to drop the board into its bootloader.
    #[default]
    PulseDtr,
}

/// What to upload, where.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub port: String,
    pub baud_rate: u32,
    pub firmware: Vec<u8>,
    pub reset: ResetPolicy,
    /// Number of reply bytes to collect after the transfer.
    pub expect_reply: Option<usize>,
}

impl UploadRequest {
    pub fn new(port: impl Into<String>, baud_rate: u32, firmware: Vec<u8>) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            firmware,
            reset: ResetPolicy::default(),
            expect_reply: None,
        }
    }

    /// Build a request for the configured port and baud rate.
    pub fn from_config(config: &Config, firmware: Vec<u8>) -> Result<Self, ConfigError> {
        let port = config.serial.resolved_device_port().ok_or_else(|| {
            ConfigError::MissingRequired("serial.device_port".to_string())
        })?;

        Ok(Self {
            port,
            baud_rate: config.serial.baud_rate,
            firmware,
            reset: if config.upload.reset_before_upload {
                ResetPolicy::PulseDtr
            } else {
                ResetPolicy::None
            },
            expect_reply: config.upload.expect_reply_bytes,
        })
    }

    pub fn with_reset(mut self, reset: ResetPolicy) -> Self {
        self.reset = reset;
        self
    }

    pub fn expect_reply(mut self, bytes: usize) -> Self {
        self.expect_reply = Some(bytes);
        self
    }
}

/// Pipeline timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTimings {
    pub reset_pulse: Duration,
    pub settle: Duration,
    pub stall_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for UploadTimings {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadTimings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            reset_pulse: config.reset_pulse(),
            settle: config.settle(),
            stall_timeout: config.stall_timeout(),
            reply_timeout: config.reply_timeout(),
        }
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub port: String,
    pub baud_rate: u32,
    pub bytes_written: usize,
    /// Number of write calls it took; more than one means the driver took
    /// partial chunks.
    pub write_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Vec<u8>>,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Runs uploads against a backend. Each upload opens its own device.
#[derive(Debug, Clone)]
pub struct Uploader<B: SerialBackend + Clone = NativeBackend> {
    backend: B,
    timings: UploadTimings,
}

impl Uploader<NativeBackend> {
    pub fn new(timings: UploadTimings) -> Self {
        Self::with_backend(NativeBackend::default(), timings)
    }
}

impl<B: SerialBackend + Clone> Uploader<B> {
    pub fn with_backend(backend: B, timings: UploadTimings) -> Self {
        Self { backend, timings }
    }

    pub fn timings(&self) -> &UploadTimings {
        &self.timings
    }

    pub fn upload(&self, request: &UploadRequest) -> Result<UploadReport, UploadError> {
        if request.firmware.is_empty() {
            return Err(UploadError::EmptyFirmware);
        }
        let started = Instant::now();
        let total = request.firmware.len();
        tracing::info!(port = %request.port, baud = request.baud_rate, total, "upload starting");

        let mut device =
            SerialDevice::with_backend(self.backend.clone(), &request.port, request.baud_rate);
        device
            .open(OpenMode::ReadWrite)
            .map_err(|source| UploadError::Open {
                port: request.port.clone(),
                source,
            })?;

        if request.reset == ResetPolicy::PulseDtr {
            pulse_dtr(&mut device, self.timings.reset_pulse).map_err(UploadError::Reset)?;
            thread::sleep(self.timings.settle);
            discard_input(&mut device).map_err(UploadError::Reset)?;
        }

        let write_calls = self.transfer(&mut device, &request.firmware)?;

        let reply = match request.expect_reply {
            Some(expected) => Some(self.collect_reply(&mut device, expected)?),
            None => None,
        };

        device.close();
        let report = UploadReport {
            port: request.port.clone(),
            baud_rate: request.baud_rate,
            bytes_written: total,
            write_calls,
            reply,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            port = %report.port,
            bytes = report.bytes_written,
            calls = report.write_calls,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "upload finished"
        );
        Ok(report)
    }

    /// Write all of `data`, resuming after short writes. Returns the number
    /// of write calls made.
    fn transfer(&self, device: &mut SerialDevice<B>, data: &[u8]) -> Result<usize, UploadError> {
        let total = data.len();
        let mut written = 0;
        let mut calls = 0;
        let mut last_progress = Instant::now();

        while written < total {
            calls += 1;
            let n = device
                .write(&data[written..])
                .map_err(|source| UploadError::Transfer {
                    written,
                    total,
                    source,
                })?;

            if n > 0 {
                written += n;
                last_progress = Instant::now();
                tracing::debug!(written, total, "firmware chunk queued");
                continue;
            }

            if last_progress.elapsed() >= self.timings.stall_timeout {
                tracing::warn!(port = %device.port_name(), written, total, "transfer stalled");
                return Err(UploadError::Stalled { written, total });
            }
            thread::sleep(WRITE_BACKOFF);
        }

        Ok(calls)
    }

    fn collect_reply(
        &self,
        device: &mut SerialDevice<B>,
        expected: usize,
    ) -> Result<Vec<u8>, UploadError> {
        let deadline = Instant::now() + self.timings.reply_timeout;
        let mut reply = vec![0u8; expected];
        let mut received = 0;

        while received < expected {
            let n = device
                .read(&mut reply[received..])
                .map_err(UploadError::Handshake)?;
            received += n;
            if received == expected {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(UploadError::NoReply { received, expected });
            }
            if n == 0 {
                // A failed wait shows up again on the next read.
                device.wait_for_ready_read(deadline - now);
            }
        }

        tracing::debug!(port = %device.port_name(), bytes = received, "bootloader replied");
        Ok(reply)
    }
}

/// Reset a board through its auto-reset circuit: DTR asserted for `pulse`
/// (never less than 50 ms), then released.
pub fn pulse_dtr<B: SerialBackend>(
    device: &mut SerialDevice<B>,
    pulse: Duration,
) -> Result<(), PortError> {
    let pulse = pulse.max(Duration::from_millis(MIN_RESET_PULSE_MS));
    tracing::debug!(port = %device.port_name(), pulse_ms = pulse.as_millis() as u64, "pulsing DTR");
    device.set_dtr(true)?;
    thread::sleep(pulse);
    device.set_dtr(false)
}

/// Drop whatever the board sent while it was rebooting.
fn discard_input<B: SerialBackend>(device: &mut SerialDevice<B>) -> Result<(), PortError> {
    let mut scratch = [0u8; DRAIN_CHUNK];
    let mut dropped = 0;
    loop {
        let n = device.read(&mut scratch)?;
        if n == 0 {
            break;
        }
        dropped += n;
    }
    if dropped > 0 {
        tracing::debug!(port = %device.port_name(), dropped, "discarded stale input");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{FaultOp, Line, LoopbackBackend};
    use pretty_assertions::assert_eq;

    fn fast_timings() -> UploadTimings {
        UploadTimings {
            reset_pulse: Duration::from_millis(50),
            settle: Duration::from_millis(1),
            stall_timeout: Duration::from_millis(50),
            reply_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_upload_writes_everything() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        let uploader = Uploader::with_backend(backend, fast_timings());

        let firmware: Vec<u8> = (0..=255).collect();
        let report = uploader
            .upload(&UploadRequest::new("COM3", 115200, firmware.clone()))
            .unwrap();

        assert_eq!(board.take_written(), firmware);
        assert_eq!(report.bytes_written, 256);
        assert_eq!(report.write_calls, 1);
        assert!(!board.is_in_use());
    }

    #[test]
    fn test_reset_pulses_dtr_high_then_low() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        let uploader = Uploader::with_backend(backend, fast_timings());

        uploader
            .upload(&UploadRequest::new("COM3", 57600, vec![1, 2, 3]))
            .unwrap();

        let log = board.line_log();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].line, log[0].level), (Line::Dtr, true));
        assert_eq!((log[1].line, log[1].level), (Line::Dtr, false));
        assert!(log[1].at - log[0].at >= Duration::from_millis(50));
    }

    #[test]
    fn test_no_reset_leaves_lines_alone() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        let uploader = Uploader::with_backend(backend, fast_timings());

        let request = UploadRequest::new("COM3", 9600, vec![0xAA]).with_reset(ResetPolicy::None);
        uploader.upload(&request).unwrap();
        assert!(board.line_log().is_empty());
    }

    #[test]
    fn test_empty_firmware_never_opens() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        let uploader = Uploader::with_backend(backend, fast_timings());

        let err = uploader
            .upload(&UploadRequest::new("COM3", 9600, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, UploadError::EmptyFirmware));
        assert_eq!(board.open_calls(), 0);
    }

    #[test]
    fn test_pulse_is_clamped_to_minimum() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        let mut device = SerialDevice::with_backend(backend, "COM3", 9600);
        device.open(OpenMode::ReadWrite).unwrap();

        pulse_dtr(&mut device, Duration::from_millis(1)).unwrap();
        let log = board.line_log();
        assert!(log[1].at - log[0].at >= Duration::from_millis(MIN_RESET_PULSE_MS));
    }

    #[test]
    fn test_stale_input_discarded_after_reset() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        board.inject(b"garbage from the sketch");
        let uploader = Uploader::with_backend(backend, fast_timings());

        uploader
            .upload(&UploadRequest::new("COM3", 115200, vec![1]))
            .unwrap();
        assert_eq!(board.unread_len(), 0);
    }

    #[test]
    fn test_open_failure_reports_open_phase() {
        let backend = LoopbackBackend::new();
        let board = backend.add_port("COM3");
        board.fail_next(FaultOp::Open, 13);
        let uploader = Uploader::with_backend(backend, fast_timings());

        let err = uploader
            .upload(&UploadRequest::new("COM3", 9600, vec![1]))
            .unwrap_err();
        assert_eq!(err.phase(), UploadPhase::Open);
    }

    #[test]
    fn test_request_from_config() {
        let mut config = Config::default();
        assert!(UploadRequest::from_config(&config, vec![1]).is_err());

        config.serial.device_port = Some("uno".to_string());
        config
            .serial
            .port_aliases
            .insert("uno".to_string(), "/dev/ttyACM0".to_string());
        config.upload.reset_before_upload = false;
        config.upload.expect_reply_bytes = Some(2);

        let request = UploadRequest::from_config(&config, vec![1]).unwrap();
        assert_eq!(request.port, "/dev/ttyACM0");
        assert_eq!(request.baud_rate, 115200);
        assert_eq!(request.reset, ResetPolicy::None);
        assert_eq!(request.expect_reply, Some(2));
    }

    #[test]
    fn test_report_serializes_elapsed_as_millis() {
        let report = UploadReport {
            port: "COM3".to_string(),
            baud_rate: 9600,
            bytes_written: 4,
            write_calls: 1,
            reply: None,
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert!(json.get("reply").is_none());
    }
}
