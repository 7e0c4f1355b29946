//! The protocol session state machine.
//!
//! One session = one handshake followed by exactly one operation
//! branch:
//!
//! ```text
//! Idle
//!  └─ Handshake ──▶ HandshakeAccept
//!        ├─ DeviceInfo ────────────────▶ Idle            (A1)
//!        ├─ FlashRead ──▶ FlashReadStream ─(last)─▶ Idle (A2)
//!        └─ FlashProgram(prepare) ──▶ FlashPrepareAccept
//!              └─ DataPacket* ──▶ FlashProgram(verify) ──▶ Idle (B)
//!
//! any state ── session-fatal flash error ──▶ ErrorRecoveryAccept
//! ```
//!
//! A second operation requires a new handshake. Responses are produced
//! strictly after the request is fully validated: frame CRC (layer
//! below), decode, sequence id, state precondition, then argument
//! domain. Every fault is answered with an `ErrorReport`; transient
//! faults keep session state, flash faults latch
//! [`SessionState::ErrorRecoveryAccept`].

use cockpit_core::time::{Deadline, Ticks};
use cockpit_core::{cvlog, log::LogLevel};
use cockpit_wire::frame::FrameError;
use cockpit_wire::message::{READ_CHUNK_MAX, SHORT_MAX};
use cockpit_wire::{
    ByteBuf, RecoveryAction, Request, RequestEnvelope, Response, ResponseEnvelope, ResultCode,
};

use crate::device::{DeviceIdentity, device_info_response, handshake_response};
use crate::error::BootError;
use crate::flash::{FlashRegion, FlashStore};
use crate::programmer::FlashProgrammer;

/// Session inactivity budget in milliseconds.
pub const T_SESSION_MS: u32 = 30_000;

/// The authoritative session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; only a handshake is accepted.
    Idle,
    /// Handshake done; waiting for the branch-selecting request.
    HandshakeAccept,
    /// Mid multi-chunk flash read (branch A2).
    FlashReadStream,
    /// Page erased; accepting data packets and the verify request
    /// (branch B).
    FlashPrepareAccept,
    /// A session-fatal error is latched; only recovery or a new
    /// handshake proceeds.
    ErrorRecoveryAccept,
}

/// The bootloader protocol engine.
///
/// Owns the flash capability, the device identity, the programmer, and
/// all session bookkeeping. Fed decoded requests by the main loop; its
/// responses go back through the codec unconditionally --- there are no
/// silent failures.
pub struct ProtocolEngine<F, D> {
    flash: F,
    device: D,
    state: SessionState,
    programmer: FlashProgrammer,
    /// Last sequence id that was processed (accepted or reported).
    last_seq: u32,
    /// Set when `last_seq` ended in an `ErrorReport`; allows one retry
    /// reusing that id.
    last_error_seq: Option<u32>,
    /// Next expected `chunk_sequence` for branch A2.
    expected_chunk: u32,
    session_deadline: Option<Deadline>,
}

impl<F: FlashStore, D: DeviceIdentity> ProtocolEngine<F, D> {
    /// Creates an idle engine.
    pub fn new(flash: F, device: D) -> Self {
        Self {
            flash,
            device,
            state: SessionState::Idle,
            programmer: FlashProgrammer::new(),
            last_seq: 0,
            last_error_seq: None,
            expected_chunk: 0,
            session_deadline: None,
        }
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The flash capability (test inspection).
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Checks the session deadline. On expiry the session is torn down
    /// and the caller gets the timeout to report/log.
    pub fn poll_session(&mut self, now: Ticks) -> Option<BootError> {
        let deadline = self.session_deadline?;
        if !deadline.expired(now) {
            return None;
        }
        cvlog!(LogLevel::Warn, BootError::Timeout.code(), "session timeout");
        self.teardown();
        Some(BootError::Timeout)
    }

    /// Processes one decoded request and produces its response.
    pub fn handle_request(&mut self, env: &RequestEnvelope, now: Ticks) -> ResponseEnvelope {
        let seq = env.sequence_id;

        // A handshake always (re)starts the session, so a hung host can
        // recover without power-cycling the device.
        if let Request::Handshake { .. } = env.request {
            self.teardown();
            self.state = SessionState::HandshakeAccept;
            self.last_seq = seq;
            self.session_deadline = Some(Deadline::new(now, T_SESSION_MS));
            cvlog!(LogLevel::Info, 0, "session open, seq {}", seq);
            return success(seq, handshake_response(&self.device));
        }

        if !self.sequence_ok(seq) {
            // Rejected outright: does not consume the sequence id.
            return self.failure(seq, BootError::InvalidSequence);
        }

        match self.dispatch(env, now) {
            Ok(response) => {
                self.last_seq = seq;
                self.last_error_seq = None;
                if let Some(deadline) = &mut self.session_deadline {
                    deadline.rearm(now);
                }
                success(seq, response)
            }
            Err(e) => {
                self.last_seq = seq;
                self.failure(seq, e)
            }
        }
    }

    /// Builds the `ErrorReport` for a framing/decode failure below the
    /// message layer. Session state is untouched (transient error).
    pub fn transport_failure(&mut self, error: FrameError) -> ResponseEnvelope {
        self.failure(self.last_seq, BootError::from(error))
    }

    /// Builds the `ErrorReport` for an undecodable payload.
    pub fn decode_failure(&mut self) -> ResponseEnvelope {
        self.failure(self.last_seq, BootError::DecodeError)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn sequence_ok(&self, seq: u32) -> bool {
        if seq > self.last_seq {
            return true;
        }
        // One retry of the exact id that just failed.
        seq == self.last_seq && self.last_error_seq == Some(seq)
    }

    fn dispatch(&mut self, env: &RequestEnvelope, _now: Ticks) -> Result<Response, BootError> {
        match (&env.request, self.state) {
            (Request::DeviceInfo {
                include_device_id, ..
            }, SessionState::HandshakeAccept) => {
                let response = device_info_response(&self.device, *include_device_id);
                self.state = SessionState::Idle;
                self.session_deadline = None;
                Ok(response)
            }

            (
                Request::FlashRead {
                    start_address,
                    length,
                    chunk_sequence,
                    include_checksum,
                },
                SessionState::HandshakeAccept | SessionState::FlashReadStream,
            ) => {
                let expected = if self.state == SessionState::HandshakeAccept {
                    0
                } else {
                    self.expected_chunk
                };
                if *chunk_sequence != expected {
                    return Err(BootError::InvalidRequest);
                }
                self.read_chunk(*start_address, *length, *chunk_sequence, *include_checksum)
            }

            (
                Request::FlashProgram {
                    total_length,
                    verify_after_program: false,
                },
                SessionState::HandshakeAccept,
            ) => {
                let result = self.programmer.prepare(&mut self.flash, *total_length);
                self.fatal_guard(result)?;
                self.state = SessionState::FlashPrepareAccept;
                Ok(ack("page erased"))
            }

            (
                Request::DataPacket {
                    offset,
                    data,
                    data_crc32,
                },
                SessionState::FlashPrepareAccept,
            ) => {
                let result = self.programmer.accept_packet(
                    &mut self.flash,
                    *offset,
                    data.as_slice(),
                    *data_crc32,
                );
                self.fatal_guard(result)?;
                Ok(ack("data staged"))
            }

            // In the prepare-accepted state a FlashProgram message is
            // the finalize step, verified or not.
            (
                Request::FlashProgram {
                    verify_after_program,
                    ..
                },
                SessionState::FlashPrepareAccept,
            ) => {
                let result = self.programmer.finalize(&mut self.flash, *verify_after_program);
                let report = self.fatal_guard(result)?;
                self.state = SessionState::Idle;
                self.session_deadline = None;
                Ok(Response::FlashProgramResp {
                    bytes_programmed: report.bytes_programmed,
                    actual_data_length: report.actual_data_length,
                    verification_hash: report.verification_hash,
                    flash_crc32: report.flash_crc32,
                    flash_sample: report.flash_sample,
                    hardware_verify_passed: report.hardware_verify_passed,
                })
            }

            (Request::ErrorRecovery { action }, _) => Ok(self.recover(*action)),

            // Everything else is a state violation.
            _ => Err(BootError::StateInvalid),
        }
    }

    fn read_chunk(
        &mut self,
        start: u32,
        length: u32,
        chunk_sequence: u32,
        include_checksum: bool,
    ) -> Result<Response, BootError> {
        if length == 0 {
            return Err(BootError::FlashReadLengthInvalid);
        }
        let region =
            FlashRegion::containing(start).ok_or(BootError::FlashReadAddressInvalid)?;
        let (_, region_end) = region.bounds();
        let end = start
            .checked_add(length)
            .ok_or(BootError::FlashReadLengthInvalid)?;
        // The whole remaining read must sit inside one region.
        if end > region_end {
            return Err(BootError::FlashReadLengthInvalid);
        }

        let chunk_len = length.min(READ_CHUNK_MAX as u32) as usize;
        let mut buf = [0u8; READ_CHUNK_MAX];
        self.flash
            .read(start, &mut buf[..chunk_len])
            .map_err(|_| BootError::FlashReadAddressInvalid)?;

        let has_more = length as usize > chunk_len;
        self.expected_chunk = chunk_sequence + 1;
        self.state = if has_more {
            SessionState::FlashReadStream
        } else {
            self.session_deadline = None;
            SessionState::Idle
        };

        Ok(Response::FlashReadResp {
            flash_data: ByteBuf::from_slice(&buf[..chunk_len]).unwrap_or_default(),
            actual_length: chunk_len as u32,
            data_crc32: if include_checksum {
                crc32fast::hash(&buf[..chunk_len])
            } else {
                0
            },
            read_address: start,
            chunk_sequence,
            has_more_chunks: has_more,
        })
    }

    fn recover(&mut self, action: RecoveryAction) -> Response {
        cvlog!(LogLevel::Info, 0, "recovery action {:?}", action);
        match action {
            RecoveryAction::AbortAndReset => {
                self.teardown();
                ack("session reset")
            }
            RecoveryAction::ClearErrorState => {
                self.last_error_seq = None;
                if self.state == SessionState::ErrorRecoveryAccept {
                    self.teardown();
                }
                ack("error cleared")
            }
            RecoveryAction::RetryLastOperation => {
                // A fatal flash error cannot be retried in-session; the
                // host must open a new one. Transient errors just retry
                // by resending, which the sequence rule already allows.
                if self.state == SessionState::ErrorRecoveryAccept {
                    self.teardown();
                }
                ack("retry armed")
            }
        }
    }

    /// Latches session-fatal errors before propagating.
    fn fatal_guard<T>(&mut self, result: Result<T, BootError>) -> Result<T, BootError> {
        if let Err(e) = &result {
            if e.is_session_fatal() {
                cvlog!(LogLevel::Error, e.code(), "session-fatal: {}", e);
                self.state = SessionState::ErrorRecoveryAccept;
            }
        }
        result
    }

    fn failure(&mut self, seq: u32, error: BootError) -> ResponseEnvelope {
        if error != BootError::InvalidSequence {
            self.last_error_seq = Some(seq);
        }
        cvlog!(LogLevel::Warn, error.code(), "request {} failed: {}", seq, error);
        ResponseEnvelope {
            sequence_id: seq,
            result: error.result_code(),
            response: Response::ErrorReport {
                error_code: error.code(),
                diagnostic_message: ByteBuf::<SHORT_MAX>::from_str_lossy(error.message())
                    .unwrap_or_default(),
                failed_sequence_id: seq,
            },
        }
    }

    fn teardown(&mut self) {
        self.state = SessionState::Idle;
        self.programmer.reset();
        self.expected_chunk = 0;
        // A new session restarts sequence ordering from scratch.
        self.last_seq = 0;
        self.last_error_seq = None;
        self.session_deadline = None;
    }
}

fn success(sequence_id: u32, response: Response) -> ResponseEnvelope {
    ResponseEnvelope {
        sequence_id,
        result: ResultCode::Success,
        response,
    }
}

fn ack(message: &str) -> Response {
    Response::Ack {
        success: true,
        message: ByteBuf::<SHORT_MAX>::from_str_lossy(message).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticIdentity;
    use crate::flash::{BYTECODE_TARGET_ADDR, FLASH_BASE, MemFlash};

    fn engine() -> ProtocolEngine<MemFlash, StaticIdentity> {
        ProtocolEngine::new(MemFlash::new(), StaticIdentity::default())
    }

    fn t(ms: u32) -> Ticks {
        Ticks::from_millis(ms)
    }

    fn req(seq: u32, request: Request) -> RequestEnvelope {
        RequestEnvelope {
            sequence_id: seq,
            request,
        }
    }

    fn handshake(seq: u32) -> RequestEnvelope {
        req(
            seq,
            Request::Handshake {
                capabilities: 0,
                max_packet_size: 1024,
            },
        )
    }

    fn assert_error(resp: &ResponseEnvelope, expected: BootError) {
        match &resp.response {
            Response::ErrorReport { error_code, .. } => {
                assert_eq!(*error_code, expected.code(), "wrong error in {resp:?}");
            }
            other => panic!("expected ErrorReport, got {other:?}"),
        }
        assert_eq!(resp.result, expected.result_code());
    }

    // --- branch A1 ----------------------------------------------------

    #[test]
    fn device_info_session() {
        let mut e = engine();
        let resp = e.handle_request(&handshake(1), t(0));
        assert_eq!(resp.result, ResultCode::Success);
        assert!(matches!(resp.response, Response::HandshakeResp { .. }));
        assert_eq!(e.state(), SessionState::HandshakeAccept);

        let resp = e.handle_request(
            &req(
                2,
                Request::DeviceInfo {
                    include_memory_layout: true,
                    include_device_id: true,
                },
            ),
            t(10),
        );
        assert_eq!(resp.result, ResultCode::Success);
        match resp.response {
            Response::DeviceInfoResp {
                flash_page_size,
                unique_device_id,
                ..
            } => {
                assert_eq!(flash_page_size, 2048);
                assert_eq!(unique_device_id.len(), 12);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(e.state(), SessionState::Idle);
    }

    #[test]
    fn second_operation_needs_new_handshake() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        e.handle_request(
            &req(
                2,
                Request::DeviceInfo {
                    include_memory_layout: false,
                    include_device_id: false,
                },
            ),
            t(1),
        );
        // Session complete; another operation without handshake fails.
        let resp = e.handle_request(
            &req(
                3,
                Request::DeviceInfo {
                    include_memory_layout: false,
                    include_device_id: false,
                },
            ),
            t(2),
        );
        assert_error(&resp, BootError::StateInvalid);
    }

    #[test]
    fn handshake_is_idempotent() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        let resp = e.handle_request(&handshake(2), t(1));
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(e.state(), SessionState::HandshakeAccept);
    }

    // --- sequencing ---------------------------------------------------

    #[test]
    fn stale_sequence_rejected() {
        let mut e = engine();
        e.handle_request(&handshake(5), t(0));
        let resp = e.handle_request(
            &req(
                5,
                Request::DeviceInfo {
                    include_memory_layout: false,
                    include_device_id: false,
                },
            ),
            t(1),
        );
        assert_error(&resp, BootError::InvalidSequence);
        // The engine state did not advance.
        assert_eq!(e.state(), SessionState::HandshakeAccept);
    }

    #[test]
    fn retry_allowed_after_error_on_same_id() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        e.handle_request(
            &req(
                2,
                Request::FlashProgram {
                    total_length: 64,
                    verify_after_program: false,
                },
            ),
            t(1),
        );

        // Packet with a bad CRC fails...
        let resp = e.handle_request(
            &req(
                3,
                Request::DataPacket {
                    offset: 0,
                    data: ByteBuf::from_slice(&[1, 2, 3, 4]).unwrap(),
                    data_crc32: 0,
                },
            ),
            t(2),
        );
        assert_error(&resp, BootError::DataCrcMismatch);
        assert_eq!(e.state(), SessionState::FlashPrepareAccept);

        // ...and the same id may be retried once, correctly.
        let data = [1u8, 2, 3, 4];
        let resp = e.handle_request(
            &req(
                3,
                Request::DataPacket {
                    offset: 0,
                    data: ByteBuf::from_slice(&data).unwrap(),
                    data_crc32: crc32fast::hash(&data),
                },
            ),
            t(3),
        );
        assert_eq!(resp.result, ResultCode::Success);

        // After the success the id is consumed.
        let resp = e.handle_request(
            &req(
                3,
                Request::DataPacket {
                    offset: 4,
                    data: ByteBuf::from_slice(&data).unwrap(),
                    data_crc32: crc32fast::hash(&data),
                },
            ),
            t(4),
        );
        assert_error(&resp, BootError::InvalidSequence);
    }

    // --- branch A2 ----------------------------------------------------

    #[test]
    fn read_bounds_validated() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));

        // Outside every region.
        let resp = e.handle_request(
            &req(
                2,
                Request::FlashRead {
                    start_address: FLASH_BASE - 4,
                    length: 16,
                    chunk_sequence: 0,
                    include_checksum: false,
                },
            ),
            t(1),
        );
        assert_error(&resp, BootError::FlashReadAddressInvalid);

        // One byte past the region end.
        let resp = e.handle_request(
            &req(
                3,
                Request::FlashRead {
                    start_address: crate::flash::BYTECODE_REGION_END - 8,
                    length: 9,
                    chunk_sequence: 0,
                    include_checksum: false,
                },
            ),
            t(2),
        );
        assert_error(&resp, BootError::FlashReadLengthInvalid);
    }

    #[test]
    fn single_chunk_read_completes_session() {
        let mut e = engine();
        e.flash_mut().preload(BYTECODE_TARGET_ADDR, &[0xA5; 64]);
        e.handle_request(&handshake(1), t(0));
        let resp = e.handle_request(
            &req(
                2,
                Request::FlashRead {
                    start_address: BYTECODE_TARGET_ADDR,
                    length: 64,
                    chunk_sequence: 0,
                    include_checksum: true,
                },
            ),
            t(1),
        );
        match resp.response {
            Response::FlashReadResp {
                flash_data,
                actual_length,
                data_crc32,
                has_more_chunks,
                ..
            } => {
                assert_eq!(actual_length, 64);
                assert_eq!(flash_data.as_slice(), &[0xA5; 64]);
                assert_eq!(data_crc32, crc32fast::hash(&[0xA5; 64]));
                assert!(!has_more_chunks);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(e.state(), SessionState::Idle);
    }

    #[test]
    fn chunk_sequence_must_be_monotonic() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        e.handle_request(
            &req(
                2,
                Request::FlashRead {
                    start_address: BYTECODE_TARGET_ADDR,
                    length: 600,
                    chunk_sequence: 0,
                    include_checksum: false,
                },
            ),
            t(1),
        );
        assert_eq!(e.state(), SessionState::FlashReadStream);

        // Skipping chunk 1 is rejected.
        let resp = e.handle_request(
            &req(
                3,
                Request::FlashRead {
                    start_address: BYTECODE_TARGET_ADDR + 512,
                    length: 88,
                    chunk_sequence: 2,
                    include_checksum: false,
                },
            ),
            t(2),
        );
        assert_error(&resp, BootError::InvalidRequest);
    }

    // --- branch B errors ---------------------------------------------

    #[test]
    fn flash_failure_latches_error_recovery() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        e.flash_mut().fail_next_erase = true;
        let resp = e.handle_request(
            &req(
                2,
                Request::FlashProgram {
                    total_length: 64,
                    verify_after_program: false,
                },
            ),
            t(1),
        );
        assert_error(&resp, BootError::FlashEraseFailed);
        assert_eq!(resp.result, ResultCode::FlashOperation);
        assert_eq!(e.state(), SessionState::ErrorRecoveryAccept);

        // Ordinary requests are refused while latched.
        let resp = e.handle_request(
            &req(
                3,
                Request::DeviceInfo {
                    include_memory_layout: false,
                    include_device_id: false,
                },
            ),
            t(2),
        );
        assert_error(&resp, BootError::StateInvalid);

        // Abort clears the latch.
        let resp = e.handle_request(
            &req(
                4,
                Request::ErrorRecovery {
                    action: RecoveryAction::AbortAndReset,
                },
            ),
            t(3),
        );
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(e.state(), SessionState::Idle);
    }

    #[test]
    fn finalize_without_verify_completes_branch_b() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        e.handle_request(
            &req(
                2,
                Request::FlashProgram {
                    total_length: 8,
                    verify_after_program: false,
                },
            ),
            t(1),
        );
        let data = [3u8; 8];
        e.handle_request(
            &req(
                3,
                Request::DataPacket {
                    offset: 0,
                    data: ByteBuf::from_slice(&data).unwrap(),
                    data_crc32: crc32fast::hash(&data),
                },
            ),
            t(2),
        );
        let resp = e.handle_request(
            &req(
                4,
                Request::FlashProgram {
                    total_length: 8,
                    verify_after_program: false,
                },
            ),
            t(3),
        );
        assert_eq!(resp.result, ResultCode::Success);
        match resp.response {
            Response::FlashProgramResp {
                bytes_programmed,
                hardware_verify_passed,
                ..
            } => {
                assert_eq!(bytes_programmed, 8);
                assert!(!hardware_verify_passed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(e.state(), SessionState::Idle);
    }

    #[test]
    fn data_packet_before_prepare_is_state_invalid() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        let data = [0u8; 8];
        let resp = e.handle_request(
            &req(
                2,
                Request::DataPacket {
                    offset: 0,
                    data: ByteBuf::from_slice(&data).unwrap(),
                    data_crc32: crc32fast::hash(&data),
                },
            ),
            t(1),
        );
        assert_error(&resp, BootError::StateInvalid);
    }

    // --- timeouts and transport errors -------------------------------

    #[test]
    fn session_times_out() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        assert!(e.poll_session(t(T_SESSION_MS - 1)).is_none());
        assert_eq!(e.poll_session(t(T_SESSION_MS)), Some(BootError::Timeout));
        assert_eq!(e.state(), SessionState::Idle);
        // No session, no deadline.
        assert!(e.poll_session(t(u32::MAX)).is_none());
    }

    #[test]
    fn transport_failure_keeps_state() {
        let mut e = engine();
        e.handle_request(&handshake(1), t(0));
        let resp = e.transport_failure(FrameError::CrcMismatch);
        assert_error(&resp, BootError::CrcMismatch);
        assert_eq!(e.state(), SessionState::HandshakeAccept);
    }
}
