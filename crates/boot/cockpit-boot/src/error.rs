//! Bootloader error taxonomy and wire mapping.
//!
//! Every fault surfaces on the wire as an `ErrorReport` carrying the
//! numeric code from [`BootError::code`] and the [`ResultCode`] class
//! from [`BootError::result_code`]. Transient errors (framing, CRC,
//! timeouts, packet corruption) leave session state in place so the
//! host can retry; flash errors are session-fatal.

use core::fmt;

use cockpit_wire::ResultCode;
use cockpit_wire::frame::FrameError;

/// All bootloader-side failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    // Framing / transport
    /// Structurally malformed frame.
    FrameInvalid,
    /// Frame CRC-16 mismatch.
    CrcMismatch,
    /// Declared frame payload above the maximum.
    PayloadTooLarge,
    /// Frame or session deadline expired.
    Timeout,

    // Decode
    /// Malformed message or unknown variant.
    DecodeError,

    // Protocol
    /// Sequence id not strictly greater than the last accepted.
    InvalidSequence,
    /// Request not legal in the current session state.
    StateInvalid,
    /// Request arguments out of domain.
    InvalidRequest,

    // Flash
    /// Page erase failed.
    FlashEraseFailed,
    /// Aligned write failed.
    FlashWriteFailed,
    /// Readback did not match the staged image.
    FlashVerifyFailed,
    /// Read start address outside every readable region.
    FlashReadAddressInvalid,
    /// Read length crosses a region boundary.
    FlashReadLengthInvalid,

    // Data
    /// DataPacket CRC-32 mismatch.
    DataCrcMismatch,

    // Resource
    /// A bounded buffer or budget was exhausted.
    ResourceExhaustion,
}

impl BootError {
    /// Stable numeric code carried in `ErrorReport.error_code`.
    ///
    /// High byte is the group, low byte the member.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::FrameInvalid => 0x0101,
            Self::CrcMismatch => 0x0102,
            Self::PayloadTooLarge => 0x0103,
            Self::Timeout => 0x0104,
            Self::DecodeError => 0x0201,
            Self::InvalidSequence => 0x0301,
            Self::StateInvalid => 0x0302,
            Self::InvalidRequest => 0x0303,
            Self::FlashEraseFailed => 0x0401,
            Self::FlashWriteFailed => 0x0402,
            Self::FlashVerifyFailed => 0x0403,
            Self::FlashReadAddressInvalid => 0x0404,
            Self::FlashReadLengthInvalid => 0x0405,
            Self::DataCrcMismatch => 0x0501,
            Self::ResourceExhaustion => 0x0601,
        }
    }

    /// The response envelope classification for this error.
    #[must_use]
    pub const fn result_code(self) -> ResultCode {
        match self {
            Self::FrameInvalid | Self::CrcMismatch | Self::PayloadTooLarge | Self::Timeout => {
                ResultCode::Communication
            }
            Self::DecodeError | Self::DataCrcMismatch => ResultCode::DataCorruption,
            Self::InvalidSequence | Self::StateInvalid | Self::InvalidRequest => {
                ResultCode::InvalidRequest
            }
            Self::FlashEraseFailed
            | Self::FlashWriteFailed
            | Self::FlashVerifyFailed
            | Self::FlashReadAddressInvalid
            | Self::FlashReadLengthInvalid => ResultCode::FlashOperation,
            Self::ResourceExhaustion => ResultCode::ResourceExhaustion,
        }
    }

    /// True when the session must move to error recovery (flash group).
    #[must_use]
    pub const fn is_session_fatal(self) -> bool {
        matches!(
            self,
            Self::FlashEraseFailed
                | Self::FlashWriteFailed
                | Self::FlashVerifyFailed
        )
    }

    /// Short description for `ErrorReport.diagnostic_message`.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::FrameInvalid => "malformed frame",
            Self::CrcMismatch => "frame crc mismatch",
            Self::PayloadTooLarge => "frame too large",
            Self::Timeout => "timeout",
            Self::DecodeError => "undecodable message",
            Self::InvalidSequence => "bad sequence id",
            Self::StateInvalid => "request not valid now",
            Self::InvalidRequest => "bad request arguments",
            Self::FlashEraseFailed => "flash erase failed",
            Self::FlashWriteFailed => "flash write failed",
            Self::FlashVerifyFailed => "flash verify failed",
            Self::FlashReadAddressInvalid => "read address invalid",
            Self::FlashReadLengthInvalid => "read length invalid",
            Self::DataCrcMismatch => "packet crc mismatch",
            Self::ResourceExhaustion => "resource exhausted",
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl core::error::Error for BootError {}

impl From<FrameError> for BootError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::FrameInvalid => Self::FrameInvalid,
            FrameError::CrcMismatch => Self::CrcMismatch,
            FrameError::PayloadTooLarge => Self::PayloadTooLarge,
            FrameError::Timeout => Self::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let all = [
            BootError::FrameInvalid,
            BootError::CrcMismatch,
            BootError::PayloadTooLarge,
            BootError::Timeout,
            BootError::DecodeError,
            BootError::InvalidSequence,
            BootError::StateInvalid,
            BootError::InvalidRequest,
            BootError::FlashEraseFailed,
            BootError::FlashWriteFailed,
            BootError::FlashVerifyFailed,
            BootError::FlashReadAddressInvalid,
            BootError::FlashReadLengthInvalid,
            BootError::DataCrcMismatch,
            BootError::ResourceExhaustion,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn flash_errors_are_session_fatal() {
        assert!(BootError::FlashWriteFailed.is_session_fatal());
        assert!(!BootError::CrcMismatch.is_session_fatal());
        assert!(!BootError::InvalidSequence.is_session_fatal());
        assert_eq!(
            BootError::FlashVerifyFailed.result_code(),
            ResultCode::FlashOperation
        );
    }
}
