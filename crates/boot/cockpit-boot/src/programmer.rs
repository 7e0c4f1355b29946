//! The flash programming engine (branch B of the protocol).
//!
//! Algorithm:
//!
//! 1. `prepare` erases the full target page exactly once per session.
//! 2. Each accepted `DataPacket` is CRC-checked, appended to the page
//!    shadow, and flushed to flash one aligned quantum at a time.
//! 3. `finalize` pads the tail with `0xFF` to the alignment quantum,
//!    writes the last quantum, optionally verifies the programmed
//!    region byte-for-byte against the shadow, and produces the report
//!    (SHA-256 of the unpadded image, CRC-32 of the programmed region,
//!    leading sample).
//!
//! Any flash failure here is session-fatal; the page is left in
//! whatever state the hardware yielded and the host is expected to
//! re-erase via a new session.

use sha2::{Digest, Sha256};

use cockpit_wire::ByteBuf;
use cockpit_wire::message::{HASH_LEN, SAMPLE_MAX};

use crate::error::BootError;
use crate::flash::{BYTECODE_TARGET_ADDR, FLASH_PAGE_SIZE, FLASH_WRITE_ALIGN, FlashStore};

const PAGE: usize = FLASH_PAGE_SIZE as usize;
const ALIGN: usize = FLASH_WRITE_ALIGN as usize;

/// Result of a completed programming operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramReport {
    /// Bytes written to flash, including alignment padding.
    pub bytes_programmed: u32,
    /// Bytes accepted from the host, excluding padding.
    pub actual_data_length: u32,
    /// SHA-256 over the unpadded image.
    pub verification_hash: ByteBuf<HASH_LEN>,
    /// CRC-32 (IEEE) over the programmed region as read back.
    pub flash_crc32: u32,
    /// First `min(64, bytes_programmed)` bytes of the region.
    pub flash_sample: ByteBuf<SAMPLE_MAX>,
    /// Whether the byte-for-byte readback verify ran and passed.
    pub hardware_verify_passed: bool,
}

/// Staged programming state for one session.
pub struct FlashProgrammer {
    /// Page shadow: every accepted byte, then `0xFF` padding.
    shadow: [u8; PAGE],
    /// Bytes accepted from the host.
    accepted: usize,
    /// Bytes already flushed to flash (multiple of the quantum).
    flushed: usize,
    /// Image length announced at prepare.
    expected_total: usize,
    page_erased: bool,
}

impl Default for FlashProgrammer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashProgrammer {
    /// Creates an idle programmer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shadow: [0xFF; PAGE],
            accepted: 0,
            flushed: 0,
            expected_total: 0,
            page_erased: false,
        }
    }

    /// Discards all staged state (session teardown).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// True once `prepare` has erased the page this session.
    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.page_erased
    }

    /// Bytes accepted so far.
    #[must_use]
    pub const fn accepted(&self) -> usize {
        self.accepted
    }

    /// Erases the target page and arms the programmer.
    ///
    /// # Errors
    ///
    /// - `StateInvalid` on a second prepare in the same session.
    /// - `InvalidRequest` when the announced image exceeds the page.
    /// - `FlashEraseFailed` when the hardware erase fails.
    pub fn prepare(
        &mut self,
        flash: &mut dyn FlashStore,
        total_length: u32,
    ) -> Result<(), BootError> {
        if self.page_erased {
            return Err(BootError::StateInvalid);
        }
        if total_length == 0 || total_length as usize > PAGE {
            return Err(BootError::InvalidRequest);
        }
        flash
            .erase_page(BYTECODE_TARGET_ADDR)
            .map_err(|_| BootError::FlashEraseFailed)?;
        self.shadow = [0xFF; PAGE];
        self.accepted = 0;
        self.flushed = 0;
        self.expected_total = total_length as usize;
        self.page_erased = true;
        Ok(())
    }

    /// Validates and stages one data packet, flushing every completed
    /// alignment quantum to flash.
    ///
    /// # Errors
    ///
    /// - `StateInvalid` before `prepare`.
    /// - `DataCrcMismatch` when the packet CRC does not match.
    /// - `InvalidRequest` when the offset is not the next expected one.
    /// - `ResourceExhaustion` when the packet overruns the announced
    ///   image length.
    /// - `FlashWriteFailed` when the hardware write fails.
    pub fn accept_packet(
        &mut self,
        flash: &mut dyn FlashStore,
        offset: u32,
        data: &[u8],
        data_crc32: u32,
    ) -> Result<(), BootError> {
        if !self.page_erased {
            return Err(BootError::StateInvalid);
        }
        if crc32fast::hash(data) != data_crc32 {
            return Err(BootError::DataCrcMismatch);
        }
        if offset as usize != self.accepted {
            return Err(BootError::InvalidRequest);
        }
        if self.accepted + data.len() > self.expected_total {
            return Err(BootError::ResourceExhaustion);
        }

        self.shadow[self.accepted..self.accepted + data.len()].copy_from_slice(data);
        self.accepted += data.len();
        self.flush_full_quanta(flash)
    }

    /// Pads, writes the final quantum, optionally verifies, and builds
    /// the report.
    ///
    /// # Errors
    ///
    /// - `StateInvalid` before `prepare`.
    /// - `FlashWriteFailed` / `FlashVerifyFailed` from the hardware.
    pub fn finalize(
        &mut self,
        flash: &mut dyn FlashStore,
        verify_after_program: bool,
    ) -> Result<ProgramReport, BootError> {
        if !self.page_erased {
            return Err(BootError::StateInvalid);
        }

        // Tail padding up to the quantum; the shadow already holds 0xFF
        // in every unwritten slot.
        let programmed = self.accepted.next_multiple_of(ALIGN);
        if self.flushed < programmed {
            let quantum = &self.shadow[self.flushed..programmed];
            flash
                .program(BYTECODE_TARGET_ADDR + self.flushed as u32, quantum)
                .map_err(|_| BootError::FlashWriteFailed)?;
            self.flushed = programmed;
        }

        let mut verified = false;
        if verify_after_program {
            let mut readback = [0u8; PAGE];
            flash
                .read(BYTECODE_TARGET_ADDR, &mut readback[..programmed])
                .map_err(|_| BootError::FlashVerifyFailed)?;
            if readback[..programmed] != self.shadow[..programmed] {
                return Err(BootError::FlashVerifyFailed);
            }
            verified = true;
        }

        // Report fields come from the flash itself, not the shadow.
        let mut region = [0u8; PAGE];
        flash
            .read(BYTECODE_TARGET_ADDR, &mut region[..programmed])
            .map_err(|_| BootError::FlashVerifyFailed)?;

        let digest: [u8; HASH_LEN] = Sha256::digest(&self.shadow[..self.accepted]).into();
        let sample_len = programmed.min(SAMPLE_MAX);

        Ok(ProgramReport {
            bytes_programmed: programmed as u32,
            actual_data_length: self.accepted as u32,
            verification_hash: ByteBuf::from_slice(&digest).unwrap_or_default(),
            flash_crc32: crc32fast::hash(&region[..programmed]),
            flash_sample: ByteBuf::from_slice(&region[..sample_len]).unwrap_or_default(),
            hardware_verify_passed: verified,
        })
    }

    fn flush_full_quanta(&mut self, flash: &mut dyn FlashStore) -> Result<(), BootError> {
        while self.flushed + ALIGN <= self.accepted {
            let quantum = &self.shadow[self.flushed..self.flushed + ALIGN];
            flash
                .program(BYTECODE_TARGET_ADDR + self.flushed as u32, quantum)
                .map_err(|_| BootError::FlashWriteFailed)?;
            self.flushed += ALIGN;
        }
        Ok(())
    }
}
