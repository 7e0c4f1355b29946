//! Flash geometry, the storage capability trait, and the in-memory
//! implementation used by tests and the host loopback.
//!
//! Region map for the target class (128 KiB parts):
//!
//! | Region     | Extent           | Protocol access        |
//! |------------|------------------|------------------------|
//! | Bootloader | first 16 KiB     | readable, never written|
//! | Hypervisor | next 48 KiB      | readable, never written|
//! | Bytecode   | remaining 64 KiB | writable page only     |
//!
//! Writes go exclusively to the designated bytecode page at
//! [`BYTECODE_TARGET_ADDR`], in [`FLASH_WRITE_ALIGN`]-byte quanta.

use core::fmt;

/// Base address of flash on the target class.
pub const FLASH_BASE: u32 = 0x0800_0000;
/// Total flash size in bytes.
pub const FLASH_TOTAL_SIZE: u32 = 128 * 1024;
/// Erase unit in bytes.
pub const FLASH_PAGE_SIZE: u32 = 2048;
/// Write alignment quantum in bytes.
pub const FLASH_WRITE_ALIGN: u32 = 8;

/// Exclusive end of the bootloader region (16 KiB).
pub const BOOTLOADER_REGION_END: u32 = FLASH_BASE + 16 * 1024;
/// Exclusive end of the hypervisor region (next 48 KiB).
pub const HYPERVISOR_REGION_END: u32 = BOOTLOADER_REGION_END + 48 * 1024;
/// First byte of the bytecode region.
pub const BYTECODE_REGION_START: u32 = HYPERVISOR_REGION_END;
/// Exclusive end of the bytecode region.
pub const BYTECODE_REGION_END: u32 = FLASH_BASE + FLASH_TOTAL_SIZE;

/// The single page the protocol may program.
pub const BYTECODE_TARGET_ADDR: u32 = BYTECODE_REGION_START;

/// The three readable regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashRegion {
    /// The bootloader itself.
    Bootloader,
    /// The hypervisor/VM image.
    Hypervisor,
    /// User bytecode.
    Bytecode,
}

impl FlashRegion {
    /// The region containing `addr`, if any.
    #[must_use]
    pub const fn containing(addr: u32) -> Option<Self> {
        if addr >= FLASH_BASE && addr < BOOTLOADER_REGION_END {
            Some(Self::Bootloader)
        } else if addr < HYPERVISOR_REGION_END && addr >= BOOTLOADER_REGION_END {
            Some(Self::Hypervisor)
        } else if addr < BYTECODE_REGION_END && addr >= BYTECODE_REGION_START {
            Some(Self::Bytecode)
        } else {
            None
        }
    }

    /// Half-open `[start, end)` bounds of the region.
    #[must_use]
    pub const fn bounds(self) -> (u32, u32) {
        match self {
            Self::Bootloader => (FLASH_BASE, BOOTLOADER_REGION_END),
            Self::Hypervisor => (BOOTLOADER_REGION_END, HYPERVISOR_REGION_END),
            Self::Bytecode => (BYTECODE_REGION_START, BYTECODE_REGION_END),
        }
    }
}

/// Storage-layer failures reported by a [`FlashStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Erase did not complete.
    EraseFailed,
    /// Program did not complete.
    WriteFailed,
    /// Read did not complete.
    ReadFailed,
    /// Address or length violates alignment or device bounds.
    Bounds,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EraseFailed => write!(f, "flash erase failed"),
            Self::WriteFailed => write!(f, "flash write failed"),
            Self::ReadFailed => write!(f, "flash read failed"),
            Self::Bounds => write!(f, "flash access out of bounds"),
        }
    }
}

/// Blocking flash access, implemented by the chip layer.
pub trait FlashStore {
    /// Erases the page beginning at `addr` (page-aligned) to `0xFF`.
    fn erase_page(&mut self, addr: u32) -> Result<(), FlashError>;

    /// Programs `data` at `addr`. Both must be aligned to
    /// [`FLASH_WRITE_ALIGN`]; `data` length must be a whole number of
    /// quanta.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Reads `out.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError>;
}

// ---------------------------------------------------------------------------
// In-memory flash
// ---------------------------------------------------------------------------

/// NOR-like in-memory flash covering the whole device.
///
/// Programming can only clear bits (`new = old & data`), so writing to
/// an unerased page corrupts data exactly like real hardware would.
/// Fault injection flags exercise the failure paths.
pub struct MemFlash {
    cells: [u8; FLASH_TOTAL_SIZE as usize],
    /// Fail the next erase.
    pub fail_next_erase: bool,
    /// Fail the next program.
    pub fail_next_write: bool,
    /// Flip the low bit of the first byte of the next program, so a
    /// later readback verify fails.
    pub corrupt_next_write: bool,
    /// Erase operations performed.
    pub erase_count: u32,
}

impl Default for MemFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFlash {
    /// Creates a fully erased device.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: [0xFF; FLASH_TOTAL_SIZE as usize],
            fail_next_erase: false,
            fail_next_write: false,
            corrupt_next_write: false,
            erase_count: 0,
        }
    }

    /// Pre-loads bytes at `addr` without NOR semantics (test setup).
    pub fn preload(&mut self, addr: u32, data: &[u8]) {
        let off = (addr - FLASH_BASE) as usize;
        self.cells[off..off + data.len()].copy_from_slice(data);
    }

    /// Direct view of the bytes at `addr` (test assertions).
    #[must_use]
    pub fn contents(&self, addr: u32, len: usize) -> &[u8] {
        let off = (addr - FLASH_BASE) as usize;
        &self.cells[off..off + len]
    }

    fn check_range(addr: u32, len: usize) -> Result<usize, FlashError> {
        if addr < FLASH_BASE {
            return Err(FlashError::Bounds);
        }
        let off = (addr - FLASH_BASE) as usize;
        if off + len > FLASH_TOTAL_SIZE as usize {
            return Err(FlashError::Bounds);
        }
        Ok(off)
    }
}

impl FlashStore for MemFlash {
    fn erase_page(&mut self, addr: u32) -> Result<(), FlashError> {
        if addr % FLASH_PAGE_SIZE != 0 {
            return Err(FlashError::Bounds);
        }
        let off = Self::check_range(addr, FLASH_PAGE_SIZE as usize)?;
        if self.fail_next_erase {
            self.fail_next_erase = false;
            return Err(FlashError::EraseFailed);
        }
        self.cells[off..off + FLASH_PAGE_SIZE as usize].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if addr % FLASH_WRITE_ALIGN != 0 || data.len() % FLASH_WRITE_ALIGN as usize != 0 {
            return Err(FlashError::Bounds);
        }
        let off = Self::check_range(addr, data.len())?;
        if self.fail_next_write {
            self.fail_next_write = false;
            return Err(FlashError::WriteFailed);
        }
        for (i, &b) in data.iter().enumerate() {
            let mut value = b;
            if self.corrupt_next_write && i == 0 {
                value ^= 0x01;
            }
            // NOR: programming only clears bits.
            self.cells[off + i] &= value;
        }
        if self.corrupt_next_write && !data.is_empty() {
            self.corrupt_next_write = false;
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError> {
        let off = Self::check_range(addr, out.len())?;
        out.copy_from_slice(&self.cells[off..off + out.len()]);
        Ok(())
    }
}
