//! `cockpit-wire` --- the bootloader wire format.
//!
//! Two layers, shared verbatim by the device and the host tooling:
//!
//! - [`frame`]: byte-stuffed, CRC-16-protected, length-prefixed framing
//!   with a deterministic parser state machine and a per-frame deadline.
//! - [`message`]: the tagged-union request/response envelopes carried in
//!   frame payloads, in a compact field-numbered encoding.
//!
//! The framing ABI is pinned here: delimiters `0x7E`/`0x7F`, escape
//! `0x7D` with XOR `0x20`, CRC-16/CCITT (poly `0x1021`, init `0xFFFF`,
//! non-reflected) over the pre-stuffing `LEN ‖ PAYLOAD`, both CRC and
//! LEN big-endian on the wire, payloads up to 1024 bytes.

#![no_std]

#[cfg(test)]
extern crate alloc;

pub mod bytes;
pub mod crc16;
pub mod frame;
pub mod message;

pub use bytes::ByteBuf;
pub use frame::{
    EncodeFrameError, FrameError, FrameParser, ParserState, encode_frame, max_encoded_len,
};
pub use message::{
    DecodeError, EncodeError, RecoveryAction, Request, RequestEnvelope, Response,
    ResponseEnvelope, ResultCode,
};
