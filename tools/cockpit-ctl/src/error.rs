//! CLI error classification and exit codes.
//!
//! Exit codes are part of the automation contract:
//! 0 success, 1 protocol error, 2 CRC error, 3 flash error,
//! 4 timeout, 5 bounds error.

use std::fmt;

use cockpit_wire::message::READ_CHUNK_MAX;

/// Everything the driver can fail with.
#[derive(Debug)]
pub enum CtlError {
    /// Transport-level I/O failure.
    Io(std::io::Error),
    /// No (complete) response within the timeout.
    Timeout,
    /// Frame or data CRC mismatch, either end.
    Crc(String),
    /// Flash erase/write/verify failure on the device.
    Flash(String),
    /// Read address/length outside the permitted regions.
    Bounds(String),
    /// Any other protocol-level failure.
    Protocol(String),
}

impl CtlError {
    /// The documented process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) | Self::Protocol(_) => 1,
            Self::Crc(_) => 2,
            Self::Flash(_) => 3,
            Self::Timeout => 4,
            Self::Bounds(_) => 5,
        }
    }

    /// Classifies a device `ErrorReport` by its numeric error code.
    #[must_use]
    pub fn from_report(error_code: u16, message: &str) -> Self {
        let detail = format!("device error {error_code:#06x}: {message}");
        match error_code {
            // Frame CRC and packet CRC.
            0x0102 | 0x0501 => Self::Crc(detail),
            // Device-side timeout.
            0x0104 => Self::Timeout,
            // Read bounds.
            0x0404 | 0x0405 => Self::Bounds(detail),
            // Remaining flash group.
            0x0401..=0x04FF => Self::Flash(detail),
            _ => Self::Protocol(detail),
        }
    }
}

impl fmt::Display for CtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::Timeout => write!(f, "timed out waiting for the bootloader"),
            Self::Crc(d) => write!(f, "integrity failure: {d}"),
            Self::Flash(d) => write!(f, "flash failure: {d}"),
            Self::Bounds(d) => write!(f, "bounds failure: {d}"),
            Self::Protocol(d) => write!(f, "protocol failure: {d}"),
        }
    }
}

impl std::error::Error for CtlError {}

impl From<std::io::Error> for CtlError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Sanity bound shared with `read` argument validation.
pub const MAX_READ_LENGTH: u32 = (READ_CHUNK_MAX as u32) * 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(CtlError::Protocol(String::new()).exit_code(), 1);
        assert_eq!(CtlError::Crc(String::new()).exit_code(), 2);
        assert_eq!(CtlError::Flash(String::new()).exit_code(), 3);
        assert_eq!(CtlError::Timeout.exit_code(), 4);
        assert_eq!(CtlError::Bounds(String::new()).exit_code(), 5);
    }

    #[test]
    fn report_classification() {
        assert_eq!(CtlError::from_report(0x0102, "crc").exit_code(), 2);
        assert_eq!(CtlError::from_report(0x0501, "crc").exit_code(), 2);
        assert_eq!(CtlError::from_report(0x0104, "t").exit_code(), 4);
        assert_eq!(CtlError::from_report(0x0404, "a").exit_code(), 5);
        assert_eq!(CtlError::from_report(0x0405, "l").exit_code(), 5);
        assert_eq!(CtlError::from_report(0x0402, "w").exit_code(), 3);
        assert_eq!(CtlError::from_report(0x0301, "s").exit_code(), 1);
    }
}
