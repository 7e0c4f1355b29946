//! One-line instruction disassembly for traces and host tooling.

use core::fmt;

use crate::insn::{InsnFlags, Instruction};
use crate::opcode::{Opcode, OpcodeBand};

/// Wraps an instruction with a `Display` impl that prints assembly
/// syntax, e.g. `PUSH 15`, `JMP 5`, `SHR.S`.
#[derive(Debug, Clone, Copy)]
pub struct Disasm(pub Instruction);

impl fmt::Display for Disasm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let insn = self.0;
        let Some(op) = Opcode::from_u8(insn.opcode) else {
            return write!(f, "DB {:#010x}", insn.encode());
        };

        write!(f, "{}", op.mnemonic())?;
        if insn.insn_flags().contains(InsnFlags::SIGNED) && op.band() == OpcodeBand::Bitwise {
            write!(f, ".S")?;
        }
        if uses_immediate(op) {
            write!(f, " {}", insn.immediate)?;
        }
        Ok(())
    }
}

/// Whether the mnemonic takes its immediate as an operand.
fn uses_immediate(op: Opcode) -> bool {
    matches!(
        op.band(),
        OpcodeBand::ControlFlow | OpcodeBand::Memory
    ) || matches!(op, Opcode::Push | Opcode::Call | Opcode::Printf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::Instruction;

    fn text(insn: Instruction) -> alloc::string::String {
        use alloc::string::ToString;
        Disasm(insn).to_string()
    }

    #[test]
    fn operands_shown_where_meaningful() {
        assert_eq!(text(Instruction::plain(Opcode::Push, 15)), "PUSH 15");
        assert_eq!(text(Instruction::plain(Opcode::Add, 0)), "ADD");
        assert_eq!(text(Instruction::plain(Opcode::Jmp, 5)), "JMP 5");
        assert_eq!(text(Instruction::plain(Opcode::Halt, 0)), "HALT");
        assert_eq!(
            text(Instruction::plain(Opcode::LoadGlobal, 3)),
            "LOAD_GLOBAL 3"
        );
    }

    #[test]
    fn arithmetic_shift_is_suffixed() {
        assert_eq!(
            text(Instruction::new(Opcode::Shr, InsnFlags::SIGNED, 0)),
            "SHR.S"
        );
        assert_eq!(text(Instruction::plain(Opcode::Shr, 0)), "SHR");
    }

    #[test]
    fn invalid_opcode_prints_raw_word() {
        let insn = Instruction {
            opcode: 0xEE,
            flags: 0,
            immediate: 0,
        };
        assert_eq!(text(insn), "DB 0x000000ee");
    }
}
