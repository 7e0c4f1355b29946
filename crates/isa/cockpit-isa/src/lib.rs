//! `cockpit-isa` --- the CockpitVM instruction set.
//!
//! Defines the fixed 32-bit instruction encoding shared by the virtual
//! machine and the bytecode toolchain: the [`Instruction`] value type, the
//! [`Opcode`] taxonomy with its reserved numbering bands, per-instruction
//! [`InsnFlags`], and the zero-copy [`Program`] reader for the loader input
//! format (little-endian 32-bit words).
//!
//! Decoding a word is total and infallible; *validation* (is the opcode in
//! a reserved band, is a jump target inside the program) is a separate,
//! pure layer so the dispatcher can report precise errors.

#![no_std]

#[cfg(test)]
extern crate alloc;

pub mod disasm;
pub mod insn;
pub mod opcode;
pub mod program;

pub use disasm::Disasm;
pub use insn::{Instruction, InsnFlags};
pub use opcode::{Opcode, OpcodeBand};
pub use program::{Program, ProgramError, jump_target_in_bounds};
