//! Host-side session driver.
//!
//! Wraps a byte transport with the shared `cockpit-wire` codec and
//! implements the per-command flows: one handshake, one operation
//! branch, strictly increasing sequence ids.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use cockpit_wire::frame::{PAYLOAD_MAX, encode_frame, max_encoded_len};
use cockpit_wire::message::{DATA_MAX, decode_response, encode_request};
use cockpit_wire::{
    ByteBuf, FrameParser, RecoveryAction, Request, RequestEnvelope, Response, ResponseEnvelope,
};
use sha2::{Digest, Sha256};

use crate::error::CtlError;

use cockpit_core::time::Ticks;

/// Result of a successful handshake.
#[derive(Debug)]
pub struct HandshakeInfo {
    /// Device bootloader version string.
    pub bootloader_version: String,
    /// Capability bits granted.
    pub capabilities: u32,
    /// Erase unit size.
    pub flash_page_size: u32,
    /// Address programming will target.
    pub target_flash_address: u32,
}

/// Result of a successful programming run.
#[derive(Debug)]
pub struct ProgramSummary {
    /// Bytes written including padding.
    pub bytes_programmed: u32,
    /// Bytes of the image accepted.
    pub actual_data_length: u32,
    /// Device-computed SHA-256 of the image.
    pub verification_hash: Vec<u8>,
    /// CRC-32 of the programmed region.
    pub flash_crc32: u32,
    /// Whether the device's readback verify ran and passed.
    pub hardware_verify_passed: bool,
}

/// A bootloader session driver over any byte transport.
pub struct BootClient<T> {
    transport: T,
    seq: u32,
    timeout: Duration,
    verbose: bool,
}

impl<T: Read + Write> BootClient<T> {
    /// Wraps a transport.
    pub fn new(transport: T, timeout: Duration, verbose: bool) -> Self {
        Self {
            transport,
            seq: 0,
            timeout,
            verbose,
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Any [`CtlError`] from the transport or the device.
    pub fn handshake(&mut self) -> Result<HandshakeInfo, CtlError> {
        let response = self.transact(Request::Handshake {
            capabilities: 0x07,
            max_packet_size: PAYLOAD_MAX as u16,
        })?;
        match response {
            Response::HandshakeResp {
                bootloader_version,
                supported_capabilities,
                flash_page_size,
                target_flash_address,
            } => Ok(HandshakeInfo {
                bootloader_version: bootloader_version.as_str().to_owned(),
                capabilities: supported_capabilities,
                flash_page_size,
                target_flash_address,
            }),
            other => Err(unexpected("HandshakeResp", &other)),
        }
    }

    /// Queries device identification. Requires a preceding handshake.
    ///
    /// # Errors
    ///
    /// Any [`CtlError`] from the transport or the device.
    pub fn device_info(&mut self) -> Result<Response, CtlError> {
        let response = self.transact(Request::DeviceInfo {
            include_memory_layout: true,
            include_device_id: true,
        })?;
        match response {
            info @ Response::DeviceInfoResp { .. } => Ok(info),
            other => Err(unexpected("DeviceInfoResp", &other)),
        }
    }

    /// Reads `length` bytes starting at `address`, chunk by chunk.
    /// Requires a preceding handshake.
    ///
    /// # Errors
    ///
    /// Any [`CtlError`]; chunk CRC mismatches surface as
    /// [`CtlError::Crc`] when `checksum` was requested.
    pub fn read_range(
        &mut self,
        address: u32,
        length: u32,
        checksum: bool,
    ) -> Result<Vec<u8>, CtlError> {
        let mut collected = Vec::with_capacity(length as usize);
        let mut start = address;
        let mut remaining = length;
        let mut chunk_sequence = 0u32;

        while remaining > 0 {
            let response = self.transact(Request::FlashRead {
                start_address: start,
                length: remaining,
                chunk_sequence,
                include_checksum: checksum,
            })?;
            let Response::FlashReadResp {
                flash_data,
                actual_length,
                data_crc32,
                read_address,
                chunk_sequence: echoed,
                has_more_chunks,
            } = response
            else {
                return Err(unexpected("FlashReadResp", &response));
            };

            if read_address != start || echoed != chunk_sequence || actual_length == 0 {
                return Err(CtlError::Protocol(format!(
                    "chunk mismatch: addr {read_address:#010x}, seq {echoed}"
                )));
            }
            if checksum && crc32fast::hash(flash_data.as_slice()) != data_crc32 {
                return Err(CtlError::Crc(format!(
                    "chunk {chunk_sequence} crc mismatch"
                )));
            }

            collected.extend_from_slice(flash_data.as_slice());
            start += actual_length;
            remaining = remaining.saturating_sub(actual_length);
            chunk_sequence += 1;

            if !has_more_chunks && remaining > 0 {
                return Err(CtlError::Protocol(format!(
                    "device ended the stream {remaining} bytes early"
                )));
            }
        }
        Ok(collected)
    }

    /// Programs `image` into the bytecode page. Requires a preceding
    /// handshake. With `verify` the device reads the page back and the
    /// driver additionally cross-checks the device's SHA-256.
    ///
    /// # Errors
    ///
    /// Any [`CtlError`]; a digest mismatch surfaces as
    /// [`CtlError::Flash`].
    pub fn program(&mut self, image: &[u8], verify: bool) -> Result<ProgramSummary, CtlError> {
        let response = self.transact(Request::FlashProgram {
            total_length: image.len() as u32,
            verify_after_program: false,
        })?;
        expect_ack("prepare", &response)?;

        for (i, chunk) in image.chunks(DATA_MAX).enumerate() {
            let response = self.transact(Request::DataPacket {
                offset: (i * DATA_MAX) as u32,
                data: ByteBuf::from_slice(chunk)
                    .ok_or_else(|| CtlError::Protocol("oversized chunk".into()))?,
                data_crc32: crc32fast::hash(chunk),
            })?;
            expect_ack("data packet", &response)?;
        }

        let response = self.transact(Request::FlashProgram {
            total_length: image.len() as u32,
            verify_after_program: verify,
        })?;
        let Response::FlashProgramResp {
            bytes_programmed,
            actual_data_length,
            verification_hash,
            flash_crc32,
            hardware_verify_passed,
            ..
        } = response
        else {
            return Err(unexpected("FlashProgramResp", &response));
        };

        let local: [u8; 32] = Sha256::digest(image).into();
        if verification_hash.as_slice() != local {
            return Err(CtlError::Flash(
                "device image digest does not match the local image".into(),
            ));
        }

        Ok(ProgramSummary {
            bytes_programmed,
            actual_data_length,
            verification_hash: verification_hash.as_slice().to_vec(),
            flash_crc32,
            hardware_verify_passed,
        })
    }

    /// Sends a recovery action.
    ///
    /// Uses the maximum sequence id: the failed session's counter is
    /// unknown to a fresh driver process, and any later handshake
    /// resets the ordering anyway.
    ///
    /// # Errors
    ///
    /// Any [`CtlError`] from the transport or the device.
    pub fn recover(&mut self, action: RecoveryAction) -> Result<(), CtlError> {
        self.seq = u32::MAX - 1;
        let response = self.transact(Request::ErrorRecovery { action })?;
        expect_ack("recovery", &response)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Request/response plumbing
    // -----------------------------------------------------------------

    fn transact(&mut self, request: Request) -> Result<Response, CtlError> {
        self.seq += 1;
        let env = RequestEnvelope {
            sequence_id: self.seq,
            request,
        };
        if self.verbose {
            eprintln!(">> {:?}", env.request);
        }

        let mut payload = [0u8; PAYLOAD_MAX];
        let len = encode_request(&env, &mut payload)
            .map_err(|e| CtlError::Protocol(format!("encode: {e}")))?;
        let mut wire = [0u8; max_encoded_len(PAYLOAD_MAX)];
        let n = encode_frame(&payload[..len], &mut wire)
            .map_err(|e| CtlError::Protocol(format!("frame: {e}")))?;
        self.transport.write_all(&wire[..n])?;
        self.transport.flush()?;

        let envelope = self.read_response()?;
        if self.verbose {
            eprintln!("<< {:?}", envelope.response);
        }
        if let Response::ErrorReport {
            error_code,
            diagnostic_message,
            ..
        } = &envelope.response
        {
            return Err(CtlError::from_report(
                *error_code,
                diagnostic_message.as_str(),
            ));
        }
        Ok(envelope.response)
    }

    fn read_response(&mut self) -> Result<ResponseEnvelope, CtlError> {
        let started = Instant::now();
        let mut parser = FrameParser::new();
        let mut byte = [0u8; 1];

        loop {
            if started.elapsed() > self.timeout {
                return Err(CtlError::Timeout);
            }
            match self.transport.read(&mut byte) {
                Ok(0) => {
                    // Nothing pending (VMIN=0 poll); back off briefly.
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(_) => {
                    let now = Ticks::from_millis(started.elapsed().as_millis() as u32);
                    let complete = parser
                        .push_byte(byte[0], now)
                        .map_err(|e| CtlError::Crc(format!("response frame: {e}")))?;
                    if complete {
                        return decode_response(parser.payload())
                            .map_err(|e| CtlError::Protocol(format!("decode: {e}")));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(CtlError::Timeout);
                }
                Err(e) => return Err(CtlError::Io(e)),
            }
        }
    }
}

fn expect_ack(what: &str, response: &Response) -> Result<(), CtlError> {
    match response {
        Response::Ack { success: true, .. } => Ok(()),
        Response::Ack {
            success: false,
            message,
        } => Err(CtlError::Protocol(format!(
            "{what} not acknowledged: {}",
            message.as_str()
        ))),
        other => Err(unexpected("Ack", other)),
    }
}

fn unexpected(wanted: &str, got: &Response) -> CtlError {
    CtlError::Protocol(format!("expected {wanted}, got {got:?}"))
}
