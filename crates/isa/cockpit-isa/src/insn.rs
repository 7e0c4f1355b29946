//! The 4-byte instruction word.
//!
//! Layout (little-endian in program memory, natural 4-byte alignment):
//!
//! ```text
//! byte 0   byte 1   byte 2   byte 3
//! opcode   flags    imm lo   imm hi
//! ```
//!
//! so `word = opcode | flags << 8 | immediate << 16`. The fixed width buys
//! constant-time fetch on 32-bit targets, and `flags` gives each opcode
//! cheap room for signed/wide variants without burning opcode space.

use bitflags::bitflags;

use crate::opcode::Opcode;

bitflags! {
    /// Per-instruction modifier bits.
    ///
    /// Interpretation is opcode-specific: `SIGNED` selects the arithmetic
    /// variant of `SHR`; `WIDE` is reserved for a future wide-immediate
    /// profile and is currently ignored by every handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsnFlags: u8 {
        /// Treat operands as signed where the opcode distinguishes.
        const SIGNED = 0x01;
        /// Reserved for wide-immediate forms.
        const WIDE = 0x02;
    }
}

/// One decoded instruction. Exactly four bytes of program memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Selector into the handler table. May be outside every valid band;
    /// the dispatcher is the validation point.
    pub opcode: u8,
    /// Per-instruction modifier bits, see [`InsnFlags`].
    pub flags: u8,
    /// Unsigned literal or jump target instruction index, opcode-specific.
    pub immediate: u16,
}

impl Instruction {
    /// Decodes a raw 32-bit word. Total: every word decodes to *some*
    /// instruction; invalid opcodes surface later as `InvalidOpcode`.
    #[must_use]
    pub const fn decode(word: u32) -> Self {
        Self {
            opcode: (word & 0xFF) as u8,
            flags: ((word >> 8) & 0xFF) as u8,
            immediate: (word >> 16) as u16,
        }
    }

    /// Packs the instruction back into a raw word.
    #[must_use]
    pub const fn encode(self) -> u32 {
        (self.opcode as u32) | ((self.flags as u32) << 8) | ((self.immediate as u32) << 16)
    }

    /// Builds an instruction from a known-valid opcode.
    #[must_use]
    pub const fn new(opcode: Opcode, flags: InsnFlags, immediate: u16) -> Self {
        Self {
            opcode: opcode.as_u8(),
            flags: flags.bits(),
            immediate,
        }
    }

    /// Shorthand for an instruction with no flags.
    #[must_use]
    pub const fn plain(opcode: Opcode, immediate: u16) -> Self {
        Self::new(opcode, InsnFlags::empty(), immediate)
    }

    /// The decoded flag bits. Unknown bits are truncated.
    #[must_use]
    pub const fn insn_flags(self) -> InsnFlags {
        InsnFlags::from_bits_truncate(self.flags)
    }
}
