//! Bitwise handlers (band `0x60..=0x65`).
//!
//! Shift counts are taken modulo 32. SHR is a logical shift by default;
//! the `SIGNED` flag selects the arithmetic variant.

use cockpit_isa::{InsnFlags, Opcode};

use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};

impl ExecutionEngine<'_> {
    pub(crate) fn op_bitwise(&mut self, op: Opcode) -> HandlerReturn {
        let b = vm_try!(self.pop());
        let a = vm_try!(self.pop());
        let result = match op {
            Opcode::BitAnd => a & b,
            Opcode::BitOr => a | b,
            _ => a ^ b,
        };
        vm_try!(self.push(result));
        HandlerReturn::Continue
    }

    pub(crate) fn op_bitwise_not(&mut self) -> HandlerReturn {
        let a = vm_try!(self.pop());
        vm_try!(self.push(!a));
        HandlerReturn::Continue
    }

    pub(crate) fn op_shl(&mut self) -> HandlerReturn {
        let b = vm_try!(self.pop());
        let a = vm_try!(self.pop());
        vm_try!(self.push(a.wrapping_shl(b as u32)));
        HandlerReturn::Continue
    }

    pub(crate) fn op_shr(&mut self, flags: InsnFlags) -> HandlerReturn {
        let b = vm_try!(self.pop());
        let a = vm_try!(self.pop());
        let result = if flags.contains(InsnFlags::SIGNED) {
            a.wrapping_shr(b as u32)
        } else {
            ((a as u32).wrapping_shr(b as u32)) as i32
        };
        vm_try!(self.push(result));
        HandlerReturn::Continue
    }
}
