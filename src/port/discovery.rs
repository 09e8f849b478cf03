//! Serial port enumeration.
//!
//! Wraps `serialport::available_ports` so the configuration store and the CLI
//! can offer device nodes to pick from. Enumeration is the only part of the
//! crate that goes through the `serialport` crate; I/O uses our own handles.

use super::error::PortError;
use serde::{Deserialize, Serialize};

/// What kind of device sits behind a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Usb,
    Pci,
    Bluetooth,
    Unknown,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Usb => "usb",
            Self::Pci => "pci",
            Self::Bluetooth => "bluetooth",
            Self::Unknown => "unknown",
        })
    }
}

/// One enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    /// Name to pass to [`SerialDevice`](super::SerialDevice), e.g. `COM3` or
    /// `/dev/ttyACM0`.
    pub name: String,
    pub kind: PortKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

/// USB vendor IDs commonly seen on Arduino boards and their USB-serial chips.
const BOARD_VENDORS: &[u16] = &[
    0x2341, // Arduino SA
    0x2a03, // Arduino.org
    0x1a86, // QinHeng CH340
    0x0403, // FTDI
    0x10c4, // Silicon Labs CP210x
];

impl PortSummary {
    /// Whether the port looks like an Arduino-compatible board.
    pub fn is_likely_board(&self) -> bool {
        if self.vid.is_some_and(|vid| BOARD_VENDORS.contains(&vid)) {
            return true;
        }
        self.manufacturer
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("arduino"))
    }
}

impl From<serialport::SerialPortInfo> for PortSummary {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let mut summary = PortSummary {
            name: info.port_name,
            kind: PortKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        };
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                summary.kind = PortKind::Usb;
                summary.vid = Some(usb.vid);
                summary.pid = Some(usb.pid);
                summary.manufacturer = usb.manufacturer;
                summary.product = usb.product;
            }
            serialport::SerialPortType::PciPort => summary.kind = PortKind::Pci,
            serialport::SerialPortType::BluetoothPort => summary.kind = PortKind::Bluetooth,
            serialport::SerialPortType::Unknown => {}
        }
        summary
    }
}

/// List the system's serial ports, likely boards first, then by name.
pub fn list_ports() -> Result<Vec<PortSummary>, PortError> {
    let mut ports: Vec<PortSummary> = serialport::available_ports()?
        .into_iter()
        .map(PortSummary::from)
        .collect();
    ports.sort_by(|a, b| {
        b.is_likely_board()
            .cmp(&a.is_likely_board())
            .then_with(|| a.name.cmp(&b.name))
    });
    tracing::debug!(count = ports.len(), "enumerated serial ports");
    Ok(ports)
}
