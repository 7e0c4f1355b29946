//! Control-flow handlers (band `0x30..=0x32`).
//!
//! Jump immediates are target *instruction indices*, never byte offsets.

use cockpit_isa::jump_target_in_bounds;

use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};
use crate::error::VmError;

impl ExecutionEngine<'_> {
    pub(crate) fn op_jmp(&mut self, immediate: u16, program_len: usize) -> HandlerReturn {
        if !jump_target_in_bounds(immediate, program_len) {
            return HandlerReturn::Error(VmError::PcOutOfBounds);
        }
        self.jump_to(immediate as usize);
        HandlerReturn::Jumped
    }

    /// JMP_TRUE / JMP_FALSE. Pops one value; zero is false, anything
    /// else is true. The target is validated when the branch is taken.
    pub(crate) fn op_jmp_cond(
        &mut self,
        immediate: u16,
        program_len: usize,
        jump_when: bool,
    ) -> HandlerReturn {
        let condition = vm_try!(self.pop()) != 0;
        if condition != jump_when {
            return HandlerReturn::Continue;
        }
        if !jump_target_in_bounds(immediate, program_len) {
            return HandlerReturn::Error(VmError::PcOutOfBounds);
        }
        self.jump_to(immediate as usize);
        HandlerReturn::Jumped
    }
}
