//! Translation of platform error codes into diagnostic text.
//!
//! The code is captured at the failing call site with [`OsError::last`] and
//! carried explicitly from there on, so nothing that runs between the failure
//! and the report can overwrite it.

use std::fmt;

/// An OS-level failure: the raw platform code plus its rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsError {
    /// Raw `errno` (POSIX) or `GetLastError` value (Windows).
    pub code: i32,
    /// Message rendered from the platform catalog.
    pub message: String,
}

impl OsError {
    /// Build an error from an explicit platform code.
    pub fn from_code(code: i32) -> Self {
        Self {
            code,
            message: describe(code),
        }
    }

    /// Capture the calling thread's last OS error.
    ///
    /// Must be called immediately after the failing system call.
    pub fn last() -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::from_code(code)
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (os error {})", self.message, self.code)
    }
}

impl std::error::Error for OsError {}

impl From<std::io::Error> for OsError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::from_code(code),
            None => Self {
                code: 0,
                message: err.to_string(),
            },
        }
    }
}

/// Render a platform error code with the system's message catalog.
///
/// `strerror_r` on POSIX and `FormatMessageW` on Windows, both reached through
/// `std::io::Error`. The trailing " (os error N)" suffix and any CR/LF the
/// catalog appends are stripped.
pub fn describe(code: i32) -> String {
    let rendered = std::io::Error::from_raw_os_error(code).to_string();
    let text = match rendered.rfind(" (os error ") {
        Some(idx) => &rendered[..idx],
        None => rendered.as_str(),
    };
    let text = text.trim_end_matches(['\r', '\n', ' ', '.']);

    if text.is_empty() {
        format!("Unknown system error {code}")
    } else {
        text.to_string()
    }
}
