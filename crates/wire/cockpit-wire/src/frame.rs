//! Byte-stuffed, CRC-protected framing.
//!
//! Wire shape:
//!
//! ```text
//! 0x7E | LEN(hi,lo) | PAYLOAD[LEN] | CRC16(hi,lo) | 0x7F
//! ```
//!
//! `LEN` is the post-unescaping payload length. Everything between the
//! delimiters is byte-stuffed: `0x7E -> 0x7D 0x5E`, `0x7F -> 0x7D 0x5F`,
//! `0x7D -> 0x7D 0x5D`. The CRC covers the pre-stuffing `LEN ‖ PAYLOAD`.
//!
//! The parser is a deterministic state machine fed one byte at a time by
//! the blocking main loop; it resets to [`ParserState::Idle`] after any
//! error or completed frame and enforces a forward-progress deadline.

use cockpit_core::time::{Deadline, Ticks};

use crate::crc16::Crc16;

/// Start-of-frame delimiter.
pub const SOF: u8 = 0x7E;
/// End-of-frame delimiter.
pub const EOF: u8 = 0x7F;
/// Escape byte.
pub const ESC: u8 = 0x7D;
/// XOR applied to the byte following an escape.
pub const ESC_XOR: u8 = 0x20;
/// Maximum post-unescaping payload length.
pub const PAYLOAD_MAX: usize = 1024;
/// Per-frame forward-progress budget in milliseconds.
pub const T_FRAME_MS: u32 = 500;

/// Framing-layer errors. The parser has already reset to `Idle` when
/// one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Structural violation: bad delimiter, raw delimiter inside a
    /// stuffed field, or trailing-byte mismatch.
    FrameInvalid,
    /// The received CRC does not match the computed one.
    CrcMismatch,
    /// Declared length exceeds [`PAYLOAD_MAX`].
    PayloadTooLarge,
    /// No forward progress within the frame deadline.
    Timeout,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::FrameInvalid => write!(f, "malformed frame"),
            Self::CrcMismatch => write!(f, "frame crc mismatch"),
            Self::PayloadTooLarge => write!(f, "frame payload too large"),
            Self::Timeout => write!(f, "frame timeout"),
        }
    }
}

/// Parser states, one per wire position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for a start delimiter; any other byte is ignored.
    Idle,
    /// Expecting the high length byte.
    LenHi,
    /// Expecting the low length byte.
    LenLo,
    /// Collecting payload bytes.
    Payload,
    /// Expecting the high CRC byte.
    CrcHi,
    /// Expecting the low CRC byte.
    CrcLo,
    /// Expecting the end delimiter.
    End,
    /// A verified frame is available via [`FrameParser::payload`].
    Complete,
}

/// The deterministic frame parser.
pub struct FrameParser {
    state: ParserState,
    escape_pending: bool,
    declared_len: usize,
    received: usize,
    payload: [u8; PAYLOAD_MAX],
    received_crc: u16,
    computed: Crc16,
    deadline: Option<Deadline>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Creates an idle parser.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ParserState::Idle,
            escape_pending: false,
            declared_len: 0,
            received: 0,
            payload: [0; PAYLOAD_MAX],
            received_crc: 0,
            computed: Crc16::new(),
            deadline: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ParserState {
        self.state
    }

    /// True once a verified frame is waiting to be consumed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    /// The verified payload of a completed frame.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        debug_assert!(self.is_complete(), "payload read before Complete");
        &self.payload[..self.declared_len]
    }

    /// Returns to `Idle`, dropping any partial or completed frame.
    pub fn reset(&mut self) {
        self.state = ParserState::Idle;
        self.escape_pending = false;
        self.declared_len = 0;
        self.received = 0;
        self.received_crc = 0;
        self.computed = Crc16::new();
        self.deadline = None;
    }

    /// Checks the forward-progress deadline. Call from the pump loop
    /// between reads.
    ///
    /// # Errors
    ///
    /// [`FrameError::Timeout`] when a frame was in flight and its
    /// deadline passed; the parser has reset.
    pub fn poll_deadline(&mut self, now: Ticks) -> Result<(), FrameError> {
        if let Some(deadline) = self.deadline {
            if deadline.expired(now) {
                self.reset();
                return Err(FrameError::Timeout);
            }
        }
        Ok(())
    }

    /// Feeds one received byte.
    ///
    /// Returns `true` when this byte completed a verified frame.
    ///
    /// # Errors
    ///
    /// Any [`FrameError`]; the parser has already reset to `Idle`.
    pub fn push_byte(&mut self, byte: u8, now: Ticks) -> Result<bool, FrameError> {
        match self.state {
            ParserState::Idle => {
                if byte == SOF {
                    self.begin(now);
                }
                Ok(false)
            }
            ParserState::Complete => {
                // The completed frame must be consumed (and the parser
                // reset) before new bytes are accepted.
                Ok(false)
            }
            _ => self.advance(byte, now),
        }
    }

    fn begin(&mut self, now: Ticks) {
        self.reset();
        self.state = ParserState::LenHi;
        self.deadline = Some(Deadline::new(now, T_FRAME_MS));
    }

    fn advance(&mut self, raw: u8, now: Ticks) -> Result<bool, FrameError> {
        // The trailer position accepts exactly one byte: a raw EOF.
        if self.state == ParserState::End {
            if raw == EOF {
                return self.finish();
            }
            self.reset();
            return Err(FrameError::FrameInvalid);
        }

        // Unescape: delimiters are only legal raw at the frame edges.
        let byte = if self.escape_pending {
            self.escape_pending = false;
            raw ^ ESC_XOR
        } else if raw == ESC {
            self.escape_pending = true;
            self.touch(now);
            return Ok(false);
        } else if raw == SOF || raw == EOF {
            self.reset();
            return Err(FrameError::FrameInvalid);
        } else {
            raw
        };

        self.touch(now);

        match self.state {
            ParserState::LenHi => {
                self.declared_len = (byte as usize) << 8;
                self.computed.update(byte);
                self.state = ParserState::LenLo;
            }
            ParserState::LenLo => {
                self.declared_len |= byte as usize;
                self.computed.update(byte);
                if self.declared_len > PAYLOAD_MAX {
                    self.reset();
                    return Err(FrameError::PayloadTooLarge);
                }
                self.state = if self.declared_len == 0 {
                    ParserState::CrcHi
                } else {
                    ParserState::Payload
                };
            }
            ParserState::Payload => {
                self.payload[self.received] = byte;
                self.received += 1;
                self.computed.update(byte);
                if self.received == self.declared_len {
                    self.state = ParserState::CrcHi;
                }
            }
            ParserState::CrcHi => {
                self.received_crc = u16::from(byte) << 8;
                self.state = ParserState::CrcLo;
            }
            ParserState::CrcLo => {
                self.received_crc |= u16::from(byte);
                self.state = ParserState::End;
            }
            ParserState::Idle | ParserState::End | ParserState::Complete => unreachable!(),
        }
        Ok(false)
    }

    fn finish(&mut self) -> Result<bool, FrameError> {
        if self.computed.finish() != self.received_crc {
            self.reset();
            return Err(FrameError::CrcMismatch);
        }
        self.state = ParserState::Complete;
        self.deadline = None;
        Ok(true)
    }

    fn touch(&mut self, now: Ticks) {
        if let Some(deadline) = &mut self.deadline {
            deadline.rearm(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Worst-case encoded size for a payload of `len` bytes: every LEN,
/// PAYLOAD, and CRC byte stuffed, plus the two delimiters.
#[must_use]
pub const fn max_encoded_len(len: usize) -> usize {
    2 * (len + 4) + 2
}

/// Encoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeFrameError {
    /// Payload longer than [`PAYLOAD_MAX`].
    PayloadTooLarge,
    /// Output buffer smaller than the stuffed frame.
    BufferTooSmall,
}

impl core::fmt::Display for EncodeFrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PayloadTooLarge => write!(f, "payload too large to frame"),
            Self::BufferTooSmall => write!(f, "encode buffer too small"),
        }
    }
}

/// Frames `payload` into `out`, returning the encoded length.
///
/// # Errors
///
/// [`EncodeFrameError`] on oversize payload or insufficient buffer.
/// Sizing `out` with [`max_encoded_len`] never fails.
pub fn encode_frame(payload: &[u8], out: &mut [u8]) -> Result<usize, EncodeFrameError> {
    if payload.len() > PAYLOAD_MAX {
        return Err(EncodeFrameError::PayloadTooLarge);
    }

    let len = payload.len() as u16;
    let mut crc = Crc16::new();
    crc.update((len >> 8) as u8);
    crc.update((len & 0xFF) as u8);
    crc.update_slice(payload);
    let crc = crc.finish();

    let mut w = Stuffer { out, pos: 0 };
    w.raw(SOF)?;
    w.stuffed((len >> 8) as u8)?;
    w.stuffed((len & 0xFF) as u8)?;
    for &b in payload {
        w.stuffed(b)?;
    }
    w.stuffed((crc >> 8) as u8)?;
    w.stuffed((crc & 0xFF) as u8)?;
    w.raw(EOF)?;
    Ok(w.pos)
}

struct Stuffer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl Stuffer<'_> {
    fn raw(&mut self, byte: u8) -> Result<(), EncodeFrameError> {
        if self.pos >= self.out.len() {
            return Err(EncodeFrameError::BufferTooSmall);
        }
        self.out[self.pos] = byte;
        self.pos += 1;
        Ok(())
    }

    fn stuffed(&mut self, byte: u8) -> Result<(), EncodeFrameError> {
        if byte == SOF || byte == EOF || byte == ESC {
            self.raw(ESC)?;
            self.raw(byte ^ ESC_XOR)
        } else {
            self.raw(byte)
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn t0() -> Ticks {
        Ticks::from_millis(0)
    }

    fn feed(parser: &mut FrameParser, bytes: &[u8]) -> Result<bool, FrameError> {
        let mut complete = false;
        for &b in bytes {
            complete = parser.push_byte(b, t0())?;
        }
        Ok(complete)
    }

    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = alloc::vec![0u8; max_encoded_len(payload.len())];
        let n = encode_frame(payload, &mut out).unwrap();
        out.truncate(n);
        out
    }

    // --- round trips -------------------------------------------------

    #[test]
    fn encode_parse_round_trip() {
        let payload = [0x01, 0x02, 0xAB, 0x00, 0xFF];
        let wire = encode(&payload);
        let mut parser = FrameParser::new();
        assert!(feed(&mut parser, &wire).unwrap());
        assert_eq!(parser.payload(), payload);
    }

    #[test]
    fn delimiters_in_payload_are_stuffed() {
        let payload = [SOF, EOF, ESC, 0x42];
        let wire = encode(&payload);
        // No raw delimiter between the outer pair.
        assert!(!wire[1..wire.len() - 1].contains(&SOF));
        assert!(!wire[1..wire.len() - 1].contains(&EOF));

        let mut parser = FrameParser::new();
        assert!(feed(&mut parser, &wire).unwrap());
        assert_eq!(parser.payload(), payload);
    }

    #[test]
    fn empty_payload_frame() {
        let wire = encode(&[]);
        let mut parser = FrameParser::new();
        assert!(feed(&mut parser, &wire).unwrap());
        assert_eq!(parser.payload(), &[] as &[u8]);
    }

    #[test]
    fn payload_max_accepted() {
        let payload = alloc::vec![0x55u8; PAYLOAD_MAX];
        let wire = encode(&payload);
        let mut parser = FrameParser::new();
        assert!(feed(&mut parser, &wire).unwrap());
        assert_eq!(parser.payload().len(), PAYLOAD_MAX);
    }

    #[test]
    fn encoded_len_is_bounded() {
        let payload = alloc::vec![ESC; 100];
        let wire = encode(&payload);
        assert!(wire.len() <= max_encoded_len(payload.len()));
    }

    // --- parser errors -----------------------------------------------

    #[test]
    fn oversize_length_rejected() {
        let mut parser = FrameParser::new();
        let too_big = (PAYLOAD_MAX + 1) as u16;
        let bytes = [SOF, (too_big >> 8) as u8, (too_big & 0xFF) as u8];
        assert_eq!(
            feed(&mut parser, &bytes).unwrap_err(),
            FrameError::PayloadTooLarge
        );
        assert_eq!(parser.state(), ParserState::Idle);
    }

    #[test]
    fn corrupted_byte_is_crc_mismatch() {
        let mut wire = encode(&[1, 2, 3, 4]);
        // Flip a payload bit (index 3 is inside the payload, unstuffed
        // values here are all plain).
        wire[4] ^= 0x01;
        let mut parser = FrameParser::new();
        assert_eq!(feed(&mut parser, &wire).unwrap_err(), FrameError::CrcMismatch);
        assert_eq!(parser.state(), ParserState::Idle);
    }

    #[test]
    fn raw_sof_inside_payload_is_invalid() {
        let mut parser = FrameParser::new();
        // SOF, len=2, then a raw SOF where payload bytes belong.
        let bytes = [SOF, 0x00, 0x02, SOF];
        assert_eq!(
            feed(&mut parser, &bytes).unwrap_err(),
            FrameError::FrameInvalid
        );
    }

    #[test]
    fn missing_end_delimiter_is_invalid() {
        let mut wire = encode(&[9, 9]);
        let last = wire.len() - 1;
        wire[last] = 0x11; // not EOF
        let mut parser = FrameParser::new();
        assert_eq!(
            feed(&mut parser, &wire).unwrap_err(),
            FrameError::FrameInvalid
        );
    }

    #[test]
    fn garbage_before_sof_is_ignored() {
        let wire = encode(&[7]);
        let mut parser = FrameParser::new();
        assert!(!feed(&mut parser, &[0x00, 0x55, 0xAA]).unwrap());
        assert_eq!(parser.state(), ParserState::Idle);
        assert!(feed(&mut parser, &wire).unwrap());
        assert_eq!(parser.payload(), &[7]);
    }

    #[test]
    fn recovers_after_error() {
        let mut parser = FrameParser::new();
        let _ = feed(&mut parser, &[SOF, 0xFF, 0xFF]); // PayloadTooLarge
        let wire = encode(&[3, 2, 1]);
        assert!(feed(&mut parser, &wire).unwrap());
        assert_eq!(parser.payload(), &[3, 2, 1]);
    }

    #[test]
    fn bytes_after_complete_are_ignored_until_reset() {
        let wire = encode(&[1]);
        let mut parser = FrameParser::new();
        assert!(feed(&mut parser, &wire).unwrap());
        assert!(!parser.push_byte(SOF, t0()).unwrap());
        assert_eq!(parser.payload(), &[1]);
        parser.reset();
        assert!(feed(&mut parser, &wire).unwrap());
    }

    // --- timeout -----------------------------------------------------

    #[test]
    fn stalled_frame_times_out() {
        let mut parser = FrameParser::new();
        parser.push_byte(SOF, t0()).unwrap();
        parser.push_byte(0x00, t0()).unwrap();
        // No bytes for longer than the budget.
        let later = Ticks::from_millis(T_FRAME_MS + 1);
        assert_eq!(parser.poll_deadline(later).unwrap_err(), FrameError::Timeout);
        assert_eq!(parser.state(), ParserState::Idle);
    }

    #[test]
    fn progress_rearms_deadline() {
        let mut parser = FrameParser::new();
        parser.push_byte(SOF, t0()).unwrap();
        let mid = Ticks::from_millis(400);
        parser.push_byte(0x00, mid).unwrap();
        // 400 ms later than start but only 100 ms since progress.
        parser.poll_deadline(Ticks::from_millis(500)).unwrap();
        // And idle parsers never time out.
        parser.reset();
        parser.poll_deadline(Ticks::from_millis(10_000)).unwrap();
    }
}
