//! Comparison handlers (bands `0x20..=0x25` unsigned, `0x26..=0x2B`
//! signed). The pushed result is always exactly 0 or 1.

use cockpit_isa::Opcode;

use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};

impl ExecutionEngine<'_> {
    /// EQ/NE/LT/GT/LE/GE over the raw bits as unsigned 32-bit.
    pub(crate) fn op_compare_unsigned(&mut self, op: Opcode) -> HandlerReturn {
        let b = vm_try!(self.pop()) as u32;
        let a = vm_try!(self.pop()) as u32;
        let result = match op {
            Opcode::Eq => a == b,
            Opcode::Ne => a != b,
            Opcode::Lt => a < b,
            Opcode::Gt => a > b,
            Opcode::Le => a <= b,
            _ => a >= b,
        };
        vm_try!(self.push(i32::from(result)));
        HandlerReturn::Continue
    }

    /// Signed variants, same operand discipline.
    pub(crate) fn op_compare_signed(&mut self, op: Opcode) -> HandlerReturn {
        let b = vm_try!(self.pop());
        let a = vm_try!(self.pop());
        let result = match op {
            Opcode::EqSigned => a == b,
            Opcode::NeSigned => a != b,
            Opcode::LtSigned => a < b,
            Opcode::GtSigned => a > b,
            Opcode::LeSigned => a <= b,
            _ => a >= b,
        };
        vm_try!(self.push(i32::from(result)));
        HandlerReturn::Continue
    }
}
