//! End-to-end bootloader sessions over the framed transport.
//!
//! Drives a [`Bootloader`] byte-for-byte the way a serial host would:
//! requests are message-encoded, framed, and pushed into a loopback
//! transport; responses come back as frames and are parsed and decoded
//! with the same shared codec.

use std::collections::VecDeque;

use cockpit_boot::flash::{BYTECODE_REGION_END, BYTECODE_TARGET_ADDR, MemFlash};
use cockpit_boot::mainloop::ServiceEvent;
use cockpit_boot::session::SessionState;
use cockpit_boot::{BootError, Bootloader, BootloaderIo, StaticIdentity};
use cockpit_boot::mainloop::IoError;
use cockpit_core::time::Ticks;
use cockpit_wire::frame::{PAYLOAD_MAX, encode_frame, max_encoded_len};
use cockpit_wire::message::{decode_response, encode_request};
use cockpit_wire::{
    ByteBuf, FrameParser, RecoveryAction, Request, RequestEnvelope, Response, ResponseEnvelope,
    ResultCode,
};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Loopback transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopbackIo {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    now_ms: u32,
}

impl BootloaderIo for LoopbackIo {
    fn try_read_byte(&mut self) -> Result<Option<u8>, IoError> {
        Ok(self.rx.pop_front())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        self.tx.extend_from_slice(bytes);
        Ok(())
    }

    fn now(&mut self) -> Ticks {
        Ticks::from_millis(self.now_ms)
    }
}

type TestBootloader = Bootloader<MemFlash, StaticIdentity, LoopbackIo>;

fn bootloader() -> TestBootloader {
    Bootloader::new(MemFlash::new(), StaticIdentity::default(), LoopbackIo::default())
}

/// Frames a request and queues its bytes on the loopback RX side.
fn send(boot: &mut TestBootloader, env: &RequestEnvelope) {
    let mut payload = [0u8; PAYLOAD_MAX];
    let len = encode_request(env, &mut payload).unwrap();
    let mut wire = [0u8; max_encoded_len(PAYLOAD_MAX)];
    let n = encode_frame(&payload[..len], &mut wire).unwrap();
    boot.io_mut().rx.extend(&wire[..n]);
}

/// Pumps the loop until a response frame was transmitted, then parses
/// and decodes it.
fn pump(boot: &mut TestBootloader) -> ResponseEnvelope {
    loop {
        match boot.service().unwrap() {
            ServiceEvent::Responded | ServiceEvent::TransportError(_) => break,
            ServiceEvent::Idle => panic!("bootloader idle with no response pending"),
            _ => {}
        }
    }
    let wire = std::mem::take(&mut boot.io_mut().tx);
    let mut parser = FrameParser::new();
    let mut complete = false;
    for &b in &wire {
        complete = parser.push_byte(b, Ticks::from_millis(0)).unwrap();
        if complete {
            break;
        }
    }
    assert!(complete, "no complete response frame on the wire");
    decode_response(parser.payload()).unwrap()
}

fn transact(boot: &mut TestBootloader, env: &RequestEnvelope) -> ResponseEnvelope {
    send(boot, env);
    pump(boot)
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
            capabilities: 0x07,
            max_packet_size: 1024,
        },
    )
}

fn data_packet(seq: u32, offset: u32, data: &[u8]) -> RequestEnvelope {
    req(
        seq,
        Request::DataPacket {
            offset,
            data: ByteBuf::from_slice(data).unwrap(),
            data_crc32: crc32fast::hash(data),
        },
    )
}

// ---------------------------------------------------------------------------
// Branch B: flash programming happy path (2000-byte image)
// ---------------------------------------------------------------------------

#[test]
fn program_session_happy_path() {
    let mut boot = bootloader();
    let image: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

    let resp = transact(&mut boot, &handshake(1));
    assert_eq!(resp.result, ResultCode::Success);
    match resp.response {
        Response::HandshakeResp {
            flash_page_size,
            target_flash_address,
            ..
        } => {
            assert_eq!(flash_page_size, 2048);
            assert_eq!(target_flash_address, BYTECODE_TARGET_ADDR);
        }
        other => panic!("unexpected {other:?}"),
    }

    let resp = transact(
        &mut boot,
        &req(
            2,
            Request::FlashProgram {
                total_length: 2000,
                verify_after_program: false,
            },
        ),
    );
    assert!(matches!(resp.response, Response::Ack { success: true, .. }));

    let mut seq = 3;
    for (i, chunk) in image.chunks(512).enumerate() {
        let resp = transact(&mut boot, &data_packet(seq, (i * 512) as u32, chunk));
        assert!(
            matches!(resp.response, Response::Ack { success: true, .. }),
            "packet {i} not acked: {resp:?}"
        );
        seq += 1;
    }

    let resp = transact(
        &mut boot,
        &req(
            seq,
            Request::FlashProgram {
                total_length: 2000,
                verify_after_program: true,
            },
        ),
    );
    assert_eq!(resp.result, ResultCode::Success);
    match resp.response {
        Response::FlashProgramResp {
            bytes_programmed,
            actual_data_length,
            verification_hash,
            flash_crc32,
            flash_sample,
            hardware_verify_passed,
        } => {
            assert_eq!(actual_data_length, 2000);
            assert_eq!(bytes_programmed, 2000); // already 8-aligned
            assert!(hardware_verify_passed);
            let expected: [u8; 32] = Sha256::digest(&image).into();
            assert_eq!(verification_hash.as_slice(), expected);
            assert_eq!(flash_crc32, crc32fast::hash(&image));
            assert_eq!(flash_sample.as_slice(), &image[..64]);
        }
        other => panic!("unexpected {other:?}"),
    }

    // The image landed in flash.
    assert_eq!(
        boot.engine_mut().flash_mut().contents(BYTECODE_TARGET_ADDR, 2000),
        &image[..]
    );
    assert_eq!(boot.engine_mut().state(), SessionState::Idle);
}

// ---------------------------------------------------------------------------
// Branch A2: chunked read (768 bytes => 3 chunks)
// ---------------------------------------------------------------------------

#[test]
fn chunked_read_session() {
    let mut boot = bootloader();
    let blob: Vec<u8> = (0..768u32).map(|i| (i * 7 % 256) as u8).collect();
    boot.engine_mut()
        .flash_mut()
        .preload(BYTECODE_TARGET_ADDR, &blob);

    transact(&mut boot, &handshake(1));

    let mut collected = Vec::new();
    let mut start = BYTECODE_TARGET_ADDR;
    let mut remaining = 768u32;
    for chunk_idx in 0u32..3 {
        let resp = transact(
            &mut boot,
            &req(
                2 + chunk_idx,
                Request::FlashRead {
                    start_address: start,
                    length: remaining,
                    chunk_sequence: chunk_idx,
                    include_checksum: true,
                },
            ),
        );
        match resp.response {
            Response::FlashReadResp {
                flash_data,
                actual_length,
                data_crc32,
                read_address,
                chunk_sequence,
                has_more_chunks,
            } => {
                assert_eq!(actual_length, 256);
                assert_eq!(read_address, start);
                assert_eq!(chunk_sequence, chunk_idx);
                assert_eq!(has_more_chunks, chunk_idx < 2);
                assert_eq!(data_crc32, crc32fast::hash(flash_data.as_slice()));
                collected.extend_from_slice(flash_data.as_slice());
            }
            other => panic!("unexpected {other:?}"),
        }
        start += 256;
        remaining -= 256;
    }
    assert_eq!(collected, blob);
    assert_eq!(boot.engine_mut().state(), SessionState::Idle);
}

// ---------------------------------------------------------------------------
// Error paths over the wire
// ---------------------------------------------------------------------------

#[test]
fn corrupted_frame_gets_error_report_and_session_survives() {
    let mut boot = bootloader();
    transact(&mut boot, &handshake(1));

    // A frame with a flipped payload byte.
    let env = req(
        2,
        Request::DeviceInfo {
            include_memory_layout: false,
            include_device_id: false,
        },
    );
    let mut payload = [0u8; PAYLOAD_MAX];
    let len = encode_request(&env, &mut payload).unwrap();
    let mut wire = [0u8; max_encoded_len(PAYLOAD_MAX)];
    let n = encode_frame(&payload[..len], &mut wire).unwrap();
    wire[4] ^= 0x40;
    boot.io_mut().rx.extend(&wire[..n]);

    let resp = pump(&mut boot);
    assert_eq!(resp.result, ResultCode::Communication);
    match resp.response {
        Response::ErrorReport { error_code, .. } => {
            assert_eq!(error_code, BootError::CrcMismatch.code());
        }
        other => panic!("unexpected {other:?}"),
    }

    // Transient error: the session is still open and usable.
    let resp = transact(&mut boot, &env);
    assert_eq!(resp.result, ResultCode::Success);
    assert!(matches!(resp.response, Response::DeviceInfoResp { .. }));
}

#[test]
fn undecodable_payload_gets_error_report() {
    let mut boot = bootloader();
    let garbage = [0x7Au8, 1, 2, 3, 4, 5];
    let mut wire = [0u8; 64];
    let n = encode_frame(&garbage, &mut wire).unwrap();
    boot.io_mut().rx.extend(&wire[..n]);

    let resp = pump(&mut boot);
    assert_eq!(resp.result, ResultCode::DataCorruption);
    match resp.response {
        Response::ErrorReport { error_code, .. } => {
            assert_eq!(error_code, BootError::DecodeError.code());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn out_of_band_read_rejected_then_recovered() {
    let mut boot = bootloader();
    transact(&mut boot, &handshake(1));

    // Read crossing out of the bytecode region.
    let resp = transact(
        &mut boot,
        &req(
            2,
            Request::FlashRead {
                start_address: BYTECODE_REGION_END - 16,
                length: 32,
                chunk_sequence: 0,
                include_checksum: false,
            },
        ),
    );
    match resp.response {
        Response::ErrorReport { error_code, .. } => {
            assert_eq!(error_code, BootError::FlashReadLengthInvalid.code());
        }
        other => panic!("unexpected {other:?}"),
    }

    // Clear and continue in the same session.
    let resp = transact(
        &mut boot,
        &req(
            3,
            Request::ErrorRecovery {
                action: RecoveryAction::ClearErrorState,
            },
        ),
    );
    assert!(matches!(resp.response, Response::Ack { success: true, .. }));

    let resp = transact(
        &mut boot,
        &req(
            4,
            Request::FlashRead {
                start_address: BYTECODE_TARGET_ADDR,
                length: 16,
                chunk_sequence: 0,
                include_checksum: false,
            },
        ),
    );
    assert_eq!(resp.result, ResultCode::Success);
}

#[test]
fn session_timeout_tears_down() {
    let mut boot = bootloader();
    transact(&mut boot, &handshake(1));
    assert_eq!(boot.engine_mut().state(), SessionState::HandshakeAccept);

    boot.io_mut().now_ms = 31_000;
    assert_eq!(boot.service().unwrap(), ServiceEvent::SessionTimeout);
    assert_eq!(boot.engine_mut().state(), SessionState::Idle);
}

#[test]
fn verify_failure_is_session_fatal_on_the_wire() {
    let mut boot = bootloader();
    transact(&mut boot, &handshake(1));
    transact(
        &mut boot,
        &req(
            2,
            Request::FlashProgram {
                total_length: 8,
                verify_after_program: false,
            },
        ),
    );

    boot.engine_mut().flash_mut().corrupt_next_write = true;
    transact(&mut boot, &data_packet(3, 0, &[0x5A; 8]));

    let resp = transact(
        &mut boot,
        &req(
            4,
            Request::FlashProgram {
                total_length: 8,
                verify_after_program: true,
            },
        ),
    );
    assert_eq!(resp.result, ResultCode::FlashOperation);
    match resp.response {
        Response::ErrorReport { error_code, .. } => {
            assert_eq!(error_code, BootError::FlashVerifyFailed.code());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(boot.engine_mut().state(), SessionState::ErrorRecoveryAccept);
}
