//! The blocking bootloader main loop.
//!
//! Pumps the transport one byte at a time through the frame parser,
//! decodes completed frames, hands requests to the protocol engine, and
//! transmits every response framed. All faults produce an `ErrorReport`
//! on the wire; there are no silent failures. The loop owns serial RX
//! and TX exclusively --- diagnostics go to their own sink.

use cockpit_core::time::Ticks;
use cockpit_wire::frame::{PAYLOAD_MAX, encode_frame, max_encoded_len};
use cockpit_wire::message::{decode_request, encode_response};
use cockpit_wire::{FrameError, FrameParser, ParserState, ResponseEnvelope};

use crate::device::DeviceIdentity;
use crate::diag::{FlowMarker, mark};
use crate::emergency::{EmergencyCondition, EmergencyManager, EmergencyOutcome};
use crate::error::BootError;
use crate::flash::FlashStore;
use crate::session::ProtocolEngine;

/// Transport-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The underlying byte channel failed.
    Fault,
}

/// The byte transport plus clock the bootloader runs on.
///
/// All operations are blocking; `try_read_byte` returns `None` when no
/// byte is pending so the loop can service deadlines between bytes.
pub trait BootloaderIo {
    /// Fetches the next received byte, if any.
    fn try_read_byte(&mut self) -> Result<Option<u8>, IoError>;

    /// Writes the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError>;

    /// The free-running millisecond clock.
    fn now(&mut self) -> Ticks;
}

/// What one [`Bootloader::service`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Nothing pending.
    Idle,
    /// A byte was consumed; the frame is still in flight.
    InProgress,
    /// A request was processed and its response transmitted.
    Responded,
    /// A transport-level error was reported on the wire.
    TransportError(BootError),
    /// The session expired and was torn down.
    SessionTimeout,
}

/// The assembled bootloader: engine + parser + transport + emergency.
pub struct Bootloader<F, D, Io> {
    engine: ProtocolEngine<F, D>,
    parser: FrameParser,
    io: Io,
    emergency: EmergencyManager,
}

impl<F: FlashStore, D: DeviceIdentity, Io: BootloaderIo> Bootloader<F, D, Io> {
    /// Assembles a bootloader from its capabilities.
    pub fn new(flash: F, device: D, io: Io) -> Self {
        Self {
            engine: ProtocolEngine::new(flash, device),
            parser: FrameParser::new(),
            io,
            emergency: EmergencyManager::default(),
        }
    }

    /// The protocol engine (test inspection).
    pub fn engine_mut(&mut self) -> &mut ProtocolEngine<F, D> {
        &mut self.engine
    }

    /// The transport (test inspection).
    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }

    /// The emergency manager.
    pub fn emergency_mut(&mut self) -> &mut EmergencyManager {
        &mut self.emergency
    }

    /// Runs until the transport fails terminally.
    pub fn run(&mut self) -> EmergencyOutcome {
        loop {
            match self.service() {
                Ok(_) => {}
                Err(IoError::Fault) => {
                    let now = self.io.now();
                    let outcome = self
                        .emergency
                        .declare(EmergencyCondition::CommunicationFailure, now);
                    match outcome {
                        EmergencyOutcome::Recover { .. } => {
                            // The embedder's recovery hook re-inits the
                            // transport; the loop just keeps pumping.
                        }
                        EmergencyOutcome::Shutdown => return outcome,
                    }
                }
            }
        }
    }

    /// One pump iteration: deadlines, then at most one byte.
    ///
    /// # Errors
    ///
    /// [`IoError`] when the transport fails; protocol-level faults are
    /// reported on the wire instead.
    pub fn service(&mut self) -> Result<ServiceEvent, IoError> {
        let now = self.io.now();

        if let Some(e) = self.engine.poll_session(now) {
            debug_assert_eq!(e, BootError::Timeout);
            self.parser.reset();
            return Ok(ServiceEvent::SessionTimeout);
        }

        if let Err(e) = self.parser.poll_deadline(now) {
            return self.report_transport_error(e).map(ServiceEvent::TransportError)
        }

        let Some(byte) = self.io.try_read_byte()? else {
            return Ok(ServiceEvent::Idle);
        };

        let before = self.parser.state();
        match self.parser.push_byte(byte, now) {
            Ok(true) => {
                mark(FlowMarker::FrameCrcOk);
                self.respond_to_frame(now)?;
                Ok(ServiceEvent::Responded)
            }
            Ok(false) => {
                self.note_frame_progress(before);
                Ok(ServiceEvent::InProgress)
            }
            Err(e) => self.report_transport_error(e).map(ServiceEvent::TransportError),
        }
    }

    /// Emits the early flow markers on parser milestones.
    fn note_frame_progress(&self, before: ParserState) {
        let after = self.parser.state();
        if before == ParserState::Idle && after == ParserState::LenHi {
            mark(FlowMarker::FrameStart);
        } else if before == ParserState::LenLo && after != ParserState::LenLo {
            mark(FlowMarker::FrameLength);
        } else if before == ParserState::Payload && after == ParserState::CrcHi {
            mark(FlowMarker::FramePayload);
        }
    }

    fn respond_to_frame(&mut self, now: Ticks) -> Result<(), IoError> {
        mark(FlowMarker::DecodeStart);
        let response = match decode_request(self.parser.payload()) {
            Ok(env) => {
                mark(FlowMarker::DecodeOk);
                mark(FlowMarker::Processing);
                self.engine.handle_request(&env, now)
            }
            Err(_) => self.engine.decode_failure(),
        };
        self.parser.reset();
        mark(FlowMarker::ResponseGenerated);
        self.transmit(&response)
    }

    fn report_transport_error(&mut self, error: FrameError) -> Result<BootError, IoError> {
        let response = self.engine.transport_failure(error);
        self.transmit(&response)?;
        Ok(BootError::from(error))
    }

    fn transmit(&mut self, response: &ResponseEnvelope) -> Result<(), IoError> {
        let mut payload = [0u8; PAYLOAD_MAX];
        let Ok(len) = encode_response(response, &mut payload) else {
            // Responses are sized to fit by construction.
            debug_assert!(false, "response exceeded payload buffer");
            return Ok(());
        };
        mark(FlowMarker::ResponseEncoded);

        let mut wire = [0u8; max_encoded_len(PAYLOAD_MAX)];
        let Ok(frame_len) = encode_frame(&payload[..len], &mut wire) else {
            debug_assert!(false, "frame exceeded wire buffer");
            return Ok(());
        };
        self.io.write_all(&wire[..frame_len])?;
        mark(FlowMarker::ResponseSent);
        Ok(())
    }
}
