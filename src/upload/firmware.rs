//! Firmware images: raw binaries and Intel HEX files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest image an Intel HEX file may describe once gaps are filled.
pub const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

const FILL_BYTE: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Cannot read firmware '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Intel HEX line {line}: {message}")]
    Hex { line: usize, message: String },

    #[error("Firmware image is empty")]
    Empty,

    #[error("Firmware image spans {0} bytes, more than {MAX_IMAGE_SIZE}")]
    TooLarge(usize),
}

impl FirmwareError {
    fn hex(line: usize, message: impl Into<String>) -> Self {
        Self::Hex {
            line,
            message: message.into(),
        }
    }
}

/// A flat firmware image ready to stream to a bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    /// Address of the first byte, as given by the HEX records (0 for raw
    /// binaries).
    pub base_address: u32,
    pub bytes: Vec<u8>,
}

impl Firmware {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FirmwareError> {
        if bytes.is_empty() {
            return Err(FirmwareError::Empty);
        }
        Ok(Self {
            base_address: 0,
            bytes,
        })
    }

    /// Load an image from disk. Files ending in `.hex` or `.ihx`, or whose
    /// content starts with `:`, are decoded as Intel HEX.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| FirmwareError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let by_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihx"));
        let by_content = raw.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b':');

        let firmware = if by_extension || by_content {
            let text = String::from_utf8(raw)
                .map_err(|_| FirmwareError::hex(0, "file is not ASCII text"))?;
            parse_intel_hex(&text)?
        } else {
            Self::from_bytes(raw)?
        };

        tracing::debug!(
            path = %path.display(),
            len = firmware.len(),
            base = format_args!("{:#x}", firmware.base_address),
            "firmware loaded"
        );
        Ok(firmware)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Decode Intel HEX text into a flat image starting at the lowest address
/// written. Gaps between records are filled with `0xFF`, the erased-flash
/// value.
pub fn parse_intel_hex(text: &str) -> Result<Firmware, FirmwareError> {
    let mut memory: BTreeMap<u32, u8> = BTreeMap::new();
    let mut upper: u32 = 0;
    let mut saw_eof = false;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if saw_eof {
            return Err(FirmwareError::hex(line_no, "record after end-of-file"));
        }

        let record = decode_record(line).map_err(|msg| FirmwareError::hex(line_no, msg))?;
        match record.kind {
            0x00 => {
                let start = upper.wrapping_add(u32::from(record.offset));
                for (i, byte) in record.data.iter().enumerate() {
                    memory.insert(start.wrapping_add(i as u32), *byte);
                }
            }
            0x01 => saw_eof = true,
            0x02 => upper = u32::from(segment_value(&record, line_no)?) << 4,
            0x04 => upper = u32::from(segment_value(&record, line_no)?) << 16,
            // Start address records only matter to loaders that jump.
            0x03 | 0x05 => {}
            other => {
                return Err(FirmwareError::hex(
                    line_no,
                    format!("unknown record type {other:#04x}"),
                ))
            }
        }
    }

    let (Some((&first, _)), Some((&last, _))) =
        (memory.first_key_value(), memory.last_key_value())
    else {
        return Err(FirmwareError::Empty);
    };

    let span = (last - first) as usize + 1;
    if span > MAX_IMAGE_SIZE {
        return Err(FirmwareError::TooLarge(span));
    }

    let mut bytes = vec![FILL_BYTE; span];
    for (addr, byte) in memory {
        bytes[(addr - first) as usize] = byte;
    }

    Ok(Firmware {
        base_address: first,
        bytes,
    })
}

struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

fn decode_record(line: &str) -> Result<Record, String> {
    let hex = line
        .strip_prefix(':')
        .ok_or_else(|| "missing ':' start code".to_string())?;
    if hex.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }

    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex digits at column {}", i + 2))
        })
        .collect::<Result<Vec<u8>, String>>()?;

    if bytes.len() < 5 {
        return Err("record too short".to_string());
    }
    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(format!(
            "byte count {count} does not match record length {}",
            bytes.len() - 5
        ));
    }

    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err("checksum mismatch".to_string());
    }

    Ok(Record {
        kind: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + count].to_vec(),
    })
}

fn segment_value(record: &Record, line: usize) -> Result<u16, FirmwareError> {
    match record.data.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(FirmwareError::hex(line, "address record needs 2 data bytes")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    /// Build a record line with a correct checksum.
    fn record(kind: u8, offset: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8];
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes.push(kind);
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(sum.wrapping_neg());
        let body: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        format!(":{body}")
    }

    #[test]
    fn test_known_good_records() {
        // Checksums computed by hand against the published format.
        let text = ":0300300002337A1E\n:00000001FF\n";
        let fw = parse_intel_hex(text).unwrap();
        assert_eq!(fw.base_address, 0x30);
        assert_eq!(fw.bytes, vec![0x02, 0x33, 0x7A]);
    }

    #[test]
    fn test_gap_is_filled() {
        let text = [
            record(0x00, 0x0000, &[1, 2]),
            record(0x00, 0x0004, &[5]),
            record(0x01, 0, &[]),
        ]
        .join("\n");
        let fw = parse_intel_hex(&text).unwrap();
        assert_eq!(fw.bytes, vec![1, 2, 0xFF, 0xFF, 5]);
    }

    #[test]
    fn test_extended_linear_address() {
        let text = [
            record(0x04, 0, &[0x00, 0x01]),
            record(0x00, 0x0010, &[0xAA, 0xBB]),
            record(0x01, 0, &[]),
        ]
        .join("\n");
        let fw = parse_intel_hex(&text).unwrap();
        assert_eq!(fw.base_address, 0x0001_0010);
        assert_eq!(fw.bytes, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_extended_segment_address() {
        let text = [
            record(0x02, 0, &[0x10, 0x00]),
            record(0x00, 0x0002, &[7]),
        ]
        .join("\n");
        let fw = parse_intel_hex(&text).unwrap();
        assert_eq!(fw.base_address, 0x10002);
    }

    #[test]
    fn test_bad_checksum_names_the_line() {
        let text = format!("{}\n:0300300002337A1F\n", record(0x00, 0, &[1]));
        match parse_intel_hex(&text) {
            Err(FirmwareError::Hex { line, message }) => {
                assert_eq!(line, 2);
                assert!(message.contains("checksum"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_intel_hex("0300300002337A1E").is_err());
        assert!(parse_intel_hex(":03003000").is_err());
        assert!(parse_intel_hex(":0G00000001FF").is_err());
        assert!(parse_intel_hex(&record(0x07, 0, &[])).is_err());
    }

    #[test]
    fn test_only_eof_is_empty() {
        assert!(matches!(
            parse_intel_hex(":00000001FF"),
            Err(FirmwareError::Empty)
        ));
    }

    #[test]
    fn test_record_after_eof_rejected() {
        let text = format!(":00000001FF\n{}", record(0x00, 0, &[1]));
        assert!(parse_intel_hex(&text).is_err());
    }

    #[test]
    fn test_huge_span_rejected() {
        let text = [
            record(0x00, 0, &[1]),
            record(0x04, 0, &[0x7F, 0x00]),
            record(0x00, 0, &[2]),
        ]
        .join("\n");
        assert!(matches!(
            parse_intel_hex(&text),
            Err(FirmwareError::TooLarge(_))
        ));
    }

    #[test]
    fn test_load_raw_and_hex_files() {
        let dir = tempfile::tempdir().unwrap();

        let bin = dir.path().join("blink.bin");
        std::fs::write(&bin, [0x0C, 0x94, 0x5C, 0x00]).unwrap();
        let fw = Firmware::load(&bin).unwrap();
        assert_eq!(fw.bytes, vec![0x0C, 0x94, 0x5C, 0x00]);

        let hex = dir.path().join("blink.hex");
        let mut file = std::fs::File::create(&hex).unwrap();
        writeln!(file, "{}", record(0x00, 0, &[0x0C, 0x94])).unwrap();
        writeln!(file, ":00000001FF").unwrap();
        drop(file);
        let fw = Firmware::load(&hex).unwrap();
        assert_eq!(fw.bytes, vec![0x0C, 0x94]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Firmware::load("/nonexistent/blink.hex").unwrap_err();
        assert!(matches!(err, FirmwareError::Io { .. }));
    }

    #[test]
    fn test_empty_raw_image_rejected() {
        assert!(matches!(
            Firmware::from_bytes(Vec::new()),
            Err(FirmwareError::Empty)
        ));
    }
}
