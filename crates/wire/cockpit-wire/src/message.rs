//! Request/response messages carried in frame payloads.
//!
//! The encoding is a compact field-numbered tagged union, little-endian,
//! shared by device and host:
//!
//! ```text
//! request:  [type u8] [sequence_id u32] [field]*
//! response: [type u8] [sequence_id u32] [result u8] [field]*
//! field:    [field_no u8] [scalar (width fixed per field)
//!                          | len u16 + bytes]
//! ```
//!
//! Field numbers follow the protocol schema; field 1 is reserved for a
//! future version tag (one byte): it is skipped on decode and never
//! emitted. Unknown field numbers are a decode error --- the schema is
//! closed on both ends of this link.

use crate::bytes::ByteBuf;

// ---------------------------------------------------------------------------
// Size limits (bytes fields)
// ---------------------------------------------------------------------------

/// Maximum data bytes in one `DataPacket`.
pub const DATA_MAX: usize = 512;
/// Maximum flash bytes in one `FlashReadResp` chunk.
pub const READ_CHUNK_MAX: usize = 256;
/// Maximum bytes in the `FlashProgramResp` sample.
pub const SAMPLE_MAX: usize = 64;
/// Maximum short-string field length (versions, models, messages).
pub const SHORT_MAX: usize = 32;
/// Length of the `verification_hash` field (SHA-256).
pub const HASH_LEN: usize = 32;
/// Length of the unique device id.
pub const DEVICE_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Outcome classification carried by every response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// The request was executed.
    Success = 0,
    /// Framing/transport failure.
    Communication = 1,
    /// Flash erase/write/verify failure.
    FlashOperation = 2,
    /// Payload or packet integrity failure.
    DataCorruption = 3,
    /// A bounded resource was exhausted.
    ResourceExhaustion = 4,
    /// The request was malformed or violated the session state.
    InvalidRequest = 5,
}

impl ResultCode {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Success,
            1 => Self::Communication,
            2 => Self::FlashOperation,
            3 => Self::DataCorruption,
            4 => Self::ResourceExhaustion,
            5 => Self::InvalidRequest,
            _ => return None,
        })
    }
}

/// Host-selected recovery action after an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecoveryAction {
    /// Re-execute the operation that failed, reusing its sequence id.
    RetryLastOperation = 1,
    /// Abandon the session and return to idle.
    AbortAndReset = 2,
    /// Clear the error latch but keep session state.
    ClearErrorState = 3,
}

impl RecoveryAction {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::RetryLastOperation,
            2 => Self::AbortAndReset,
            3 => Self::ClearErrorState,
            _ => return None,
        })
    }
}

/// A request plus its envelope sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Strictly increasing within a session (retry exception aside).
    pub sequence_id: u32,
    /// The single operation variant.
    pub request: Request,
}

/// A response plus its envelope metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    /// Echoes the request this answers.
    pub sequence_id: u32,
    /// Outcome classification.
    pub result: ResultCode,
    /// The single payload variant.
    pub response: Response,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Host-to-device messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Opens a session.
    Handshake {
        /// Capability bits the host wants.
        capabilities: u32,
        /// Largest frame payload the host will send.
        max_packet_size: u16,
    },
    /// One chunk of data for the flash programmer (branch B).
    DataPacket {
        /// Byte offset within the staged image.
        offset: u32,
        /// The data itself.
        data: ByteBuf<DATA_MAX>,
        /// CRC-32 (IEEE) of `data`.
        data_crc32: u32,
    },
    /// Branch B control: prepare (erase) or verify (finalize).
    FlashProgram {
        /// Total image length the host intends to send.
        total_length: u32,
        /// False = prepare phase, true = verify/finalize phase.
        verify_after_program: bool,
    },
    /// Host-selected recovery after an `ErrorReport`.
    ErrorRecovery {
        /// What to do.
        action: RecoveryAction,
    },
    /// One chunk of flash readback (branch A2).
    FlashRead {
        /// First byte to read.
        start_address: u32,
        /// Bytes remaining in the overall read, from `start_address`.
        length: u32,
        /// Monotonic chunk index, starting at 0.
        chunk_sequence: u32,
        /// Whether the response should carry a CRC-32 of the chunk.
        include_checksum: bool,
    },
    /// Device identification (branch A1).
    DeviceInfo {
        /// Include the flash region map.
        include_memory_layout: bool,
        /// Include the unique device id.
        include_device_id: bool,
    },
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Device-to-host messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Session opened.
    HandshakeResp {
        /// Bootloader version string.
        bootloader_version: ByteBuf<SHORT_MAX>,
        /// Capability bits the device grants.
        supported_capabilities: u32,
        /// Erase unit of the bytecode page.
        flash_page_size: u32,
        /// Base address writes will target.
        target_flash_address: u32,
    },
    /// Generic acknowledgement.
    Ack {
        /// Whether the acknowledged request was applied.
        success: bool,
        /// Short human-readable detail.
        message: ByteBuf<SHORT_MAX>,
    },
    /// Branch B result.
    FlashProgramResp {
        /// Bytes written including alignment padding.
        bytes_programmed: u32,
        /// Bytes accepted from the host, without padding.
        actual_data_length: u32,
        /// SHA-256 of the unpadded image.
        verification_hash: ByteBuf<HASH_LEN>,
        /// CRC-32 of the whole programmed region.
        flash_crc32: u32,
        /// First bytes of the programmed region.
        flash_sample: ByteBuf<SAMPLE_MAX>,
        /// Whether readback matched the staged image byte for byte.
        hardware_verify_passed: bool,
    },
    /// Branch A2 chunk.
    FlashReadResp {
        /// The chunk data.
        flash_data: ByteBuf<READ_CHUNK_MAX>,
        /// Valid bytes in `flash_data`.
        actual_length: u32,
        /// CRC-32 of the chunk, 0 when not requested.
        data_crc32: u32,
        /// Address the chunk was read from.
        read_address: u32,
        /// Echoes the request chunk index.
        chunk_sequence: u32,
        /// True while more chunks remain.
        has_more_chunks: bool,
    },
    /// Branch A1 payload.
    DeviceInfoResp {
        /// Device model string.
        device_model: ByteBuf<SHORT_MAX>,
        /// Bootloader version string.
        bootloader_version: ByteBuf<SHORT_MAX>,
        /// Total flash size in bytes.
        flash_total_size: u32,
        /// Erase unit size.
        flash_page_size: u32,
        /// Exclusive end of the bootloader region.
        bootloader_region_end: u32,
        /// Exclusive end of the hypervisor region.
        hypervisor_region_end: u32,
        /// First byte of the writable bytecode page.
        bytecode_region_start: u32,
        /// Exclusive end of the bytecode region.
        bytecode_region_end: u32,
        /// Factory-unique id.
        unique_device_id: ByteBuf<DEVICE_ID_LEN>,
        /// Hardware revision.
        hardware_revision: u8,
    },
    /// Any fault, transient or fatal.
    ErrorReport {
        /// Numeric error code (see the bootloader error taxonomy).
        error_code: u16,
        /// Short human-readable detail.
        diagnostic_message: ByteBuf<SHORT_MAX>,
        /// The sequence id of the request that failed.
        failed_sequence_id: u32,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Decode failures: malformed message or unknown variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended inside a field.
    Truncated,
    /// Unknown message type tag.
    UnknownMessage(u8),
    /// Unknown field number for this message type.
    UnknownField(u8),
    /// A field value is out of domain (bad enum, oversize bytes).
    BadValue,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "message truncated"),
            Self::UnknownMessage(tag) => write!(f, "unknown message tag {tag:#04x}"),
            Self::UnknownField(field) => write!(f, "unknown field {field}"),
            Self::BadValue => write!(f, "field value out of domain"),
        }
    }
}

/// Encode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Output buffer too small for the message.
    BufferTooSmall,
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "message buffer too small"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire tags
// ---------------------------------------------------------------------------

const TAG_HANDSHAKE: u8 = 0x01;
const TAG_DATA_PACKET: u8 = 0x02;
const TAG_FLASH_PROGRAM: u8 = 0x03;
const TAG_ERROR_RECOVERY: u8 = 0x04;
const TAG_FLASH_READ: u8 = 0x05;
const TAG_DEVICE_INFO: u8 = 0x06;

const TAG_HANDSHAKE_RESP: u8 = 0x81;
const TAG_ACK: u8 = 0x82;
const TAG_FLASH_PROGRAM_RESP: u8 = 0x83;
const TAG_FLASH_READ_RESP: u8 = 0x84;
const TAG_DEVICE_INFO_RESP: u8 = 0x85;
const TAG_ERROR_REPORT: u8 = 0x86;

/// Reserved field number; one payload byte, skipped on decode.
const FIELD_RESERVED: u8 = 1;

// ---------------------------------------------------------------------------
// Reader / writer
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::BadValue),
        }
    }

    fn bytes<const N: usize>(&mut self) -> Result<ByteBuf<N>, DecodeError> {
        let len = self.u16()? as usize;
        if self.remaining() < len {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        ByteBuf::from_slice(slice).ok_or(DecodeError::BadValue)
    }

    /// Skips the reserved field's one-byte payload.
    fn skip_reserved(&mut self) -> Result<(), DecodeError> {
        self.u8().map(|_| ())
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self, v: u8) -> Result<(), EncodeError> {
        if self.pos >= self.buf.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        self.buf[self.pos] = v;
        self.pos += 1;
        Ok(())
    }

    fn u16(&mut self, v: u16) -> Result<(), EncodeError> {
        for b in v.to_le_bytes() {
            self.u8(b)?;
        }
        Ok(())
    }

    fn u32(&mut self, v: u32) -> Result<(), EncodeError> {
        for b in v.to_le_bytes() {
            self.u8(b)?;
        }
        Ok(())
    }

    fn field_u8(&mut self, field: u8, v: u8) -> Result<(), EncodeError> {
        self.u8(field)?;
        self.u8(v)
    }

    fn field_u16(&mut self, field: u8, v: u16) -> Result<(), EncodeError> {
        self.u8(field)?;
        self.u16(v)
    }

    fn field_u32(&mut self, field: u8, v: u32) -> Result<(), EncodeError> {
        self.u8(field)?;
        self.u32(v)
    }

    fn field_bool(&mut self, field: u8, v: bool) -> Result<(), EncodeError> {
        self.field_u8(field, u8::from(v))
    }

    fn field_bytes(&mut self, field: u8, v: &[u8]) -> Result<(), EncodeError> {
        self.u8(field)?;
        self.u16(v.len() as u16)?;
        for &b in v {
            self.u8(b)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request codec
// ---------------------------------------------------------------------------

/// Decodes a request envelope from a frame payload.
///
/// # Errors
///
/// [`DecodeError`] on truncation, unknown tags/fields, or out-of-domain
/// values.
pub fn decode_request(payload: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    let mut r = Reader::new(payload);
    let tag = r.u8()?;
    let sequence_id = r.u32()?;

    let request = match tag {
        TAG_HANDSHAKE => {
            let mut capabilities = 0;
            let mut max_packet_size = 0;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => capabilities = r.u32()?,
                    3 => max_packet_size = r.u16()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Request::Handshake {
                capabilities,
                max_packet_size,
            }
        }
        TAG_DATA_PACKET => {
            let mut offset = 0;
            let mut data = ByteBuf::new();
            let mut data_crc32 = 0;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => offset = r.u32()?,
                    3 => data = r.bytes()?,
                    4 => data_crc32 = r.u32()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Request::DataPacket {
                offset,
                data,
                data_crc32,
            }
        }
        TAG_FLASH_PROGRAM => {
            let mut total_length = 0;
            let mut verify_after_program = false;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => total_length = r.u32()?,
                    3 => verify_after_program = r.bool()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Request::FlashProgram {
                total_length,
                verify_after_program,
            }
        }
        TAG_ERROR_RECOVERY => {
            let mut action = None;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => action = RecoveryAction::from_u8(r.u8()?),
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Request::ErrorRecovery {
                action: action.ok_or(DecodeError::BadValue)?,
            }
        }
        TAG_FLASH_READ => {
            let mut start_address = 0;
            let mut length = 0;
            let mut chunk_sequence = 0;
            let mut include_checksum = false;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => start_address = r.u32()?,
                    3 => length = r.u32()?,
                    4 => chunk_sequence = r.u32()?,
                    5 => include_checksum = r.bool()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Request::FlashRead {
                start_address,
                length,
                chunk_sequence,
                include_checksum,
            }
        }
        TAG_DEVICE_INFO => {
            let mut include_memory_layout = false;
            let mut include_device_id = false;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => include_memory_layout = r.bool()?,
                    3 => include_device_id = r.bool()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Request::DeviceInfo {
                include_memory_layout,
                include_device_id,
            }
        }
        other => return Err(DecodeError::UnknownMessage(other)),
    };

    Ok(RequestEnvelope {
        sequence_id,
        request,
    })
}

/// Encodes a request envelope into `out`, returning the length.
///
/// # Errors
///
/// [`EncodeError::BufferTooSmall`].
pub fn encode_request(env: &RequestEnvelope, out: &mut [u8]) -> Result<usize, EncodeError> {
    let mut w = Writer::new(out);
    match &env.request {
        Request::Handshake {
            capabilities,
            max_packet_size,
        } => {
            w.u8(TAG_HANDSHAKE)?;
            w.u32(env.sequence_id)?;
            w.field_u32(2, *capabilities)?;
            w.field_u16(3, *max_packet_size)?;
        }
        Request::DataPacket {
            offset,
            data,
            data_crc32,
        } => {
            w.u8(TAG_DATA_PACKET)?;
            w.u32(env.sequence_id)?;
            w.field_u32(2, *offset)?;
            w.field_bytes(3, data.as_slice())?;
            w.field_u32(4, *data_crc32)?;
        }
        Request::FlashProgram {
            total_length,
            verify_after_program,
        } => {
            w.u8(TAG_FLASH_PROGRAM)?;
            w.u32(env.sequence_id)?;
            w.field_u32(2, *total_length)?;
            w.field_bool(3, *verify_after_program)?;
        }
        Request::ErrorRecovery { action } => {
            w.u8(TAG_ERROR_RECOVERY)?;
            w.u32(env.sequence_id)?;
            w.field_u8(2, *action as u8)?;
        }
        Request::FlashRead {
            start_address,
            length,
            chunk_sequence,
            include_checksum,
        } => {
            w.u8(TAG_FLASH_READ)?;
            w.u32(env.sequence_id)?;
            w.field_u32(2, *start_address)?;
            w.field_u32(3, *length)?;
            w.field_u32(4, *chunk_sequence)?;
            w.field_bool(5, *include_checksum)?;
        }
        Request::DeviceInfo {
            include_memory_layout,
            include_device_id,
        } => {
            w.u8(TAG_DEVICE_INFO)?;
            w.u32(env.sequence_id)?;
            w.field_bool(2, *include_memory_layout)?;
            w.field_bool(3, *include_device_id)?;
        }
    }
    Ok(w.pos)
}

// ---------------------------------------------------------------------------
// Response codec
// ---------------------------------------------------------------------------

/// Decodes a response envelope from a frame payload.
///
/// # Errors
///
/// [`DecodeError`] on truncation, unknown tags/fields, or out-of-domain
/// values.
pub fn decode_response(payload: &[u8]) -> Result<ResponseEnvelope, DecodeError> {
    let mut r = Reader::new(payload);
    let tag = r.u8()?;
    let sequence_id = r.u32()?;
    let result = ResultCode::from_u8(r.u8()?).ok_or(DecodeError::BadValue)?;

    let response = match tag {
        TAG_HANDSHAKE_RESP => {
            let mut bootloader_version = ByteBuf::new();
            let mut supported_capabilities = 0;
            let mut flash_page_size = 0;
            let mut target_flash_address = 0;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => bootloader_version = r.bytes()?,
                    3 => supported_capabilities = r.u32()?,
                    4 => flash_page_size = r.u32()?,
                    5 => target_flash_address = r.u32()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Response::HandshakeResp {
                bootloader_version,
                supported_capabilities,
                flash_page_size,
                target_flash_address,
            }
        }
        TAG_ACK => {
            let mut success = false;
            let mut message = ByteBuf::new();
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => success = r.bool()?,
                    3 => message = r.bytes()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Response::Ack { success, message }
        }
        TAG_FLASH_PROGRAM_RESP => {
            let mut bytes_programmed = 0;
            let mut actual_data_length = 0;
            let mut verification_hash = ByteBuf::new();
            let mut flash_crc32 = 0;
            let mut flash_sample = ByteBuf::new();
            let mut hardware_verify_passed = false;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => bytes_programmed = r.u32()?,
                    3 => actual_data_length = r.u32()?,
                    4 => verification_hash = r.bytes()?,
                    5 => flash_crc32 = r.u32()?,
                    6 => flash_sample = r.bytes()?,
                    7 => hardware_verify_passed = r.bool()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Response::FlashProgramResp {
                bytes_programmed,
                actual_data_length,
                verification_hash,
                flash_crc32,
                flash_sample,
                hardware_verify_passed,
            }
        }
        TAG_FLASH_READ_RESP => {
            let mut flash_data = ByteBuf::new();
            let mut actual_length = 0;
            let mut data_crc32 = 0;
            let mut read_address = 0;
            let mut chunk_sequence = 0;
            let mut has_more_chunks = false;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => flash_data = r.bytes()?,
                    3 => actual_length = r.u32()?,
                    4 => data_crc32 = r.u32()?,
                    5 => read_address = r.u32()?,
                    6 => chunk_sequence = r.u32()?,
                    7 => has_more_chunks = r.bool()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Response::FlashReadResp {
                flash_data,
                actual_length,
                data_crc32,
                read_address,
                chunk_sequence,
                has_more_chunks,
            }
        }
        TAG_DEVICE_INFO_RESP => {
            let mut device_model = ByteBuf::new();
            let mut bootloader_version = ByteBuf::new();
            let mut flash_total_size = 0;
            let mut flash_page_size = 0;
            let mut bootloader_region_end = 0;
            let mut hypervisor_region_end = 0;
            let mut bytecode_region_start = 0;
            let mut bytecode_region_end = 0;
            let mut unique_device_id = ByteBuf::new();
            let mut hardware_revision = 0;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => device_model = r.bytes()?,
                    3 => bootloader_version = r.bytes()?,
                    4 => flash_total_size = r.u32()?,
                    5 => flash_page_size = r.u32()?,
                    6 => bootloader_region_end = r.u32()?,
                    7 => hypervisor_region_end = r.u32()?,
                    8 => bytecode_region_start = r.u32()?,
                    9 => bytecode_region_end = r.u32()?,
                    10 => unique_device_id = r.bytes()?,
                    11 => hardware_revision = r.u8()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Response::DeviceInfoResp {
                device_model,
                bootloader_version,
                flash_total_size,
                flash_page_size,
                bootloader_region_end,
                hypervisor_region_end,
                bytecode_region_start,
                bytecode_region_end,
                unique_device_id,
                hardware_revision,
            }
        }
        TAG_ERROR_REPORT => {
            let mut error_code = 0;
            let mut diagnostic_message = ByteBuf::new();
            let mut failed_sequence_id = 0;
            while r.remaining() > 0 {
                match r.u8()? {
                    FIELD_RESERVED => r.skip_reserved()?,
                    2 => error_code = r.u16()?,
                    3 => diagnostic_message = r.bytes()?,
                    4 => failed_sequence_id = r.u32()?,
                    f => return Err(DecodeError::UnknownField(f)),
                }
            }
            Response::ErrorReport {
                error_code,
                diagnostic_message,
                failed_sequence_id,
            }
        }
        other => return Err(DecodeError::UnknownMessage(other)),
    };

    Ok(ResponseEnvelope {
        sequence_id,
        result,
        response,
    })
}

/// Encodes a response envelope into `out`, returning the length.
///
/// # Errors
///
/// [`EncodeError::BufferTooSmall`].
pub fn encode_response(env: &ResponseEnvelope, out: &mut [u8]) -> Result<usize, EncodeError> {
    let mut w = Writer::new(out);
    match &env.response {
        Response::HandshakeResp {
            bootloader_version,
            supported_capabilities,
            flash_page_size,
            target_flash_address,
        } => {
            w.u8(TAG_HANDSHAKE_RESP)?;
            w.u32(env.sequence_id)?;
            w.u8(env.result as u8)?;
            w.field_bytes(2, bootloader_version.as_slice())?;
            w.field_u32(3, *supported_capabilities)?;
            w.field_u32(4, *flash_page_size)?;
            w.field_u32(5, *target_flash_address)?;
        }
        Response::Ack { success, message } => {
            w.u8(TAG_ACK)?;
            w.u32(env.sequence_id)?;
            w.u8(env.result as u8)?;
            w.field_bool(2, *success)?;
            w.field_bytes(3, message.as_slice())?;
        }
        Response::FlashProgramResp {
            bytes_programmed,
            actual_data_length,
            verification_hash,
            flash_crc32,
            flash_sample,
            hardware_verify_passed,
        } => {
            w.u8(TAG_FLASH_PROGRAM_RESP)?;
            w.u32(env.sequence_id)?;
            w.u8(env.result as u8)?;
            w.field_u32(2, *bytes_programmed)?;
            w.field_u32(3, *actual_data_length)?;
            w.field_bytes(4, verification_hash.as_slice())?;
            w.field_u32(5, *flash_crc32)?;
            w.field_bytes(6, flash_sample.as_slice())?;
            w.field_bool(7, *hardware_verify_passed)?;
        }
        Response::FlashReadResp {
            flash_data,
            actual_length,
            data_crc32,
            read_address,
            chunk_sequence,
            has_more_chunks,
        } => {
            w.u8(TAG_FLASH_READ_RESP)?;
            w.u32(env.sequence_id)?;
            w.u8(env.result as u8)?;
            w.field_bytes(2, flash_data.as_slice())?;
            w.field_u32(3, *actual_length)?;
            w.field_u32(4, *data_crc32)?;
            w.field_u32(5, *read_address)?;
            w.field_u32(6, *chunk_sequence)?;
            w.field_bool(7, *has_more_chunks)?;
        }
        Response::DeviceInfoResp {
            device_model,
            bootloader_version,
            flash_total_size,
            flash_page_size,
            bootloader_region_end,
            hypervisor_region_end,
            bytecode_region_start,
            bytecode_region_end,
            unique_device_id,
            hardware_revision,
        } => {
            w.u8(TAG_DEVICE_INFO_RESP)?;
            w.u32(env.sequence_id)?;
            w.u8(env.result as u8)?;
            w.field_bytes(2, device_model.as_slice())?;
            w.field_bytes(3, bootloader_version.as_slice())?;
            w.field_u32(4, *flash_total_size)?;
            w.field_u32(5, *flash_page_size)?;
            w.field_u32(6, *bootloader_region_end)?;
            w.field_u32(7, *hypervisor_region_end)?;
            w.field_u32(8, *bytecode_region_start)?;
            w.field_u32(9, *bytecode_region_end)?;
            w.field_bytes(10, unique_device_id.as_slice())?;
            w.field_u8(11, *hardware_revision)?;
        }
        Response::ErrorReport {
            error_code,
            diagnostic_message,
            failed_sequence_id,
        } => {
            w.u8(TAG_ERROR_REPORT)?;
            w.u32(env.sequence_id)?;
            w.u8(env.result as u8)?;
            w.field_u16(2, *error_code)?;
            w.field_bytes(3, diagnostic_message.as_slice())?;
            w.field_u32(4, *failed_sequence_id)?;
        }
    }
    Ok(w.pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PAYLOAD_MAX;

    fn round_trip_request(env: &RequestEnvelope) {
        let mut buf = [0u8; PAYLOAD_MAX];
        let n = encode_request(env, &mut buf).unwrap();
        assert_eq!(&decode_request(&buf[..n]).unwrap(), env);
    }

    fn round_trip_response(env: &ResponseEnvelope) {
        let mut buf = [0u8; PAYLOAD_MAX];
        let n = encode_response(env, &mut buf).unwrap();
        assert_eq!(&decode_response(&buf[..n]).unwrap(), env);
    }

    #[test]
    fn request_round_trips() {
        round_trip_request(&RequestEnvelope {
            sequence_id: 1,
            request: Request::Handshake {
                capabilities: 0x0000_0007,
                max_packet_size: 1024,
            },
        });
        round_trip_request(&RequestEnvelope {
            sequence_id: 3,
            request: Request::DataPacket {
                offset: 512,
                data: ByteBuf::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap(),
                data_crc32: 0x1234_5678,
            },
        });
        round_trip_request(&RequestEnvelope {
            sequence_id: 2,
            request: Request::FlashProgram {
                total_length: 2000,
                verify_after_program: false,
            },
        });
        round_trip_request(&RequestEnvelope {
            sequence_id: 9,
            request: Request::ErrorRecovery {
                action: RecoveryAction::AbortAndReset,
            },
        });
        round_trip_request(&RequestEnvelope {
            sequence_id: 4,
            request: Request::FlashRead {
                start_address: 0x0801_0000,
                length: 768,
                chunk_sequence: 2,
                include_checksum: true,
            },
        });
        round_trip_request(&RequestEnvelope {
            sequence_id: 5,
            request: Request::DeviceInfo {
                include_memory_layout: true,
                include_device_id: true,
            },
        });
    }

    #[test]
    fn response_round_trips() {
        round_trip_response(&ResponseEnvelope {
            sequence_id: 1,
            result: ResultCode::Success,
            response: Response::HandshakeResp {
                bootloader_version: ByteBuf::from_str_lossy("4.5.2").unwrap(),
                supported_capabilities: 0x3F,
                flash_page_size: 2048,
                target_flash_address: 0x0801_F800,
            },
        });
        round_trip_response(&ResponseEnvelope {
            sequence_id: 2,
            result: ResultCode::Success,
            response: Response::Ack {
                success: true,
                message: ByteBuf::from_str_lossy("ok").unwrap(),
            },
        });
        round_trip_response(&ResponseEnvelope {
            sequence_id: 7,
            result: ResultCode::Success,
            response: Response::FlashProgramResp {
                bytes_programmed: 2000,
                actual_data_length: 2000,
                verification_hash: ByteBuf::from_slice(&[0xAB; 32]).unwrap(),
                flash_crc32: 0xCAFE_F00D,
                flash_sample: ByteBuf::from_slice(&[0x11; 64]).unwrap(),
                hardware_verify_passed: true,
            },
        });
        round_trip_response(&ResponseEnvelope {
            sequence_id: 8,
            result: ResultCode::Success,
            response: Response::FlashReadResp {
                flash_data: ByteBuf::from_slice(&[0x42; 256]).unwrap(),
                actual_length: 256,
                data_crc32: 0x0BAD_C0DE,
                read_address: 0x0801_F800,
                chunk_sequence: 0,
                has_more_chunks: true,
            },
        });
        round_trip_response(&ResponseEnvelope {
            sequence_id: 6,
            result: ResultCode::Success,
            response: Response::DeviceInfoResp {
                device_model: ByteBuf::from_str_lossy("STM32G431CB").unwrap(),
                bootloader_version: ByteBuf::from_str_lossy("4.5.2").unwrap(),
                flash_total_size: 128 * 1024,
                flash_page_size: 2048,
                bootloader_region_end: 16 * 1024,
                hypervisor_region_end: 64 * 1024,
                bytecode_region_start: 64 * 1024,
                bytecode_region_end: 128 * 1024,
                unique_device_id: ByteBuf::from_slice(&[1; 12]).unwrap(),
                hardware_revision: 3,
            },
        });
        round_trip_response(&ResponseEnvelope {
            sequence_id: 4,
            result: ResultCode::DataCorruption,
            response: Response::ErrorReport {
                error_code: 0x0301,
                diagnostic_message: ByteBuf::from_str_lossy("packet crc").unwrap(),
                failed_sequence_id: 4,
            },
        });
    }

    #[test]
    fn reserved_field_ignored_on_decode() {
        // Handshake with a leading reserved field spliced in.
        let env = RequestEnvelope {
            sequence_id: 1,
            request: Request::Handshake {
                capabilities: 5,
                max_packet_size: 256,
            },
        };
        let mut buf = [0u8; 64];
        let n = encode_request(&env, &mut buf).unwrap();
        // Insert [field=1, version=9] after the 5-byte header.
        let mut spliced = [0u8; 66];
        spliced[..5].copy_from_slice(&buf[..5]);
        spliced[5] = FIELD_RESERVED;
        spliced[6] = 9;
        spliced[7..n + 2].copy_from_slice(&buf[5..n]);
        assert_eq!(decode_request(&spliced[..n + 2]).unwrap(), env);
    }

    #[test]
    fn unknown_message_tag_rejected() {
        let payload = [0x7A, 0, 0, 0, 0];
        assert_eq!(
            decode_request(&payload).unwrap_err(),
            DecodeError::UnknownMessage(0x7A)
        );
    }

    #[test]
    fn unknown_field_rejected() {
        let env = RequestEnvelope {
            sequence_id: 1,
            request: Request::DeviceInfo {
                include_memory_layout: false,
                include_device_id: false,
            },
        };
        let mut buf = [0u8; 64];
        let n = encode_request(&env, &mut buf).unwrap();
        buf[5] = 99; // clobber the first field number
        assert_eq!(
            decode_request(&buf[..n]).unwrap_err(),
            DecodeError::UnknownField(99)
        );
    }

    #[test]
    fn truncated_message_rejected() {
        let env = RequestEnvelope {
            sequence_id: 3,
            request: Request::DataPacket {
                offset: 0,
                data: ByteBuf::from_slice(&[1, 2, 3]).unwrap(),
                data_crc32: 7,
            },
        };
        let mut buf = [0u8; 64];
        let n = encode_request(&env, &mut buf).unwrap();
        for cut in 1..n {
            assert!(decode_request(&buf[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn oversize_bytes_field_rejected() {
        // A DataPacket whose declared data length exceeds DATA_MAX.
        let mut buf = [0u8; DATA_MAX + 32];
        let mut w = Writer::new(&mut buf);
        w.u8(TAG_DATA_PACKET).unwrap();
        w.u32(1).unwrap();
        w.u8(3).unwrap(); // data field
        w.u16((DATA_MAX + 1) as u16).unwrap();
        let pos = w.pos;
        let total = pos + DATA_MAX + 1;
        assert_eq!(
            decode_request(&buf[..total]).unwrap_err(),
            DecodeError::BadValue
        );
    }

    #[test]
    fn bad_bool_rejected() {
        let env = RequestEnvelope {
            sequence_id: 2,
            request: Request::FlashProgram {
                total_length: 16,
                verify_after_program: true,
            },
        };
        let mut buf = [0u8; 64];
        let n = encode_request(&env, &mut buf).unwrap();
        buf[n - 1] = 7; // bool payload out of domain
        assert_eq!(decode_request(&buf[..n]).unwrap_err(), DecodeError::BadValue);
    }

    #[test]
    fn bad_result_code_rejected() {
        let env = ResponseEnvelope {
            sequence_id: 1,
            result: ResultCode::Success,
            response: Response::Ack {
                success: true,
                message: ByteBuf::new(),
            },
        };
        let mut buf = [0u8; 64];
        let n = encode_response(&env, &mut buf).unwrap();
        buf[5] = 0xEE; // result code byte
        assert_eq!(
            decode_response(&buf[..n]).unwrap_err(),
            DecodeError::BadValue
        );
    }

    #[test]
    fn messages_fit_the_frame_payload() {
        // The largest response (full read chunk) must fit PAYLOAD_MAX.
        let env = ResponseEnvelope {
            sequence_id: u32::MAX,
            result: ResultCode::Success,
            response: Response::FlashReadResp {
                flash_data: ByteBuf::from_slice(&[0xFF; READ_CHUNK_MAX]).unwrap(),
                actual_length: READ_CHUNK_MAX as u32,
                data_crc32: u32::MAX,
                read_address: u32::MAX,
                chunk_sequence: u32::MAX,
                has_more_chunks: false,
            },
        };
        let mut buf = [0u8; PAYLOAD_MAX];
        let n = encode_response(&env, &mut buf).unwrap();
        assert!(n <= PAYLOAD_MAX);
    }
}
