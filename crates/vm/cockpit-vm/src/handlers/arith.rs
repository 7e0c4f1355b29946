//! Core stack and arithmetic handlers (band `0x00..=0x0F`).

use cockpit_isa::Opcode;

use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};
use crate::error::VmError;

impl ExecutionEngine<'_> {
    pub(crate) fn op_push(&mut self, immediate: u16) -> HandlerReturn {
        vm_try!(self.push(i32::from(immediate)));
        HandlerReturn::Continue
    }

    pub(crate) fn op_pop(&mut self) -> HandlerReturn {
        vm_try!(self.pop());
        HandlerReturn::Continue
    }

    /// ADD/SUB/MUL. Pops `b` (top) then `a`, pushes `a OP b`, wrapping.
    pub(crate) fn op_arith(&mut self, op: Opcode) -> HandlerReturn {
        let b = vm_try!(self.pop());
        let a = vm_try!(self.pop());
        let result = match op {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub => a.wrapping_sub(b),
            _ => a.wrapping_mul(b),
        };
        vm_try!(self.push(result));
        HandlerReturn::Continue
    }

    /// DIV/MOD. A zero divisor faults with the stack untouched; the
    /// operands are inspected in place and only popped once the
    /// operation is known to succeed.
    pub(crate) fn op_div_mod(&mut self, op: Opcode) -> HandlerReturn {
        let b = vm_try!(self.peek(0));
        vm_try!(self.peek(1));
        if b == 0 {
            return HandlerReturn::Error(VmError::DivisionByZero);
        }
        let b = vm_try!(self.pop());
        let a = vm_try!(self.pop());
        // wrapping_* also covers i32::MIN / -1.
        let result = match op {
            Opcode::Div => a.wrapping_div(b),
            _ => a.wrapping_rem(b),
        };
        vm_try!(self.push(result));
        HandlerReturn::Continue
    }

    /// CALL pushes the *return* index (`pc + 1`, not the current pc) and
    /// jumps. Pushing the unincremented pc here once produced an infinite
    /// loop on return.
    pub(crate) fn op_call(&mut self, immediate: u16, program_len: usize) -> HandlerReturn {
        let target = immediate as usize;
        if target >= program_len {
            return HandlerReturn::Error(VmError::InvalidJump);
        }
        let return_index = self.pc() + 1;
        vm_try!(self.push(return_index as i32));
        self.jump_to(target);
        HandlerReturn::Jumped
    }

    /// RET pops the return index and validates it before assigning pc.
    pub(crate) fn op_ret(&mut self, program_len: usize) -> HandlerReturn {
        let value = vm_try!(self.pop());
        let Ok(target) = usize::try_from(value) else {
            return HandlerReturn::Error(VmError::InvalidJump);
        };
        if target >= program_len {
            return HandlerReturn::Error(VmError::InvalidJump);
        }
        self.jump_to(target);
        HandlerReturn::Jumped
    }
}
