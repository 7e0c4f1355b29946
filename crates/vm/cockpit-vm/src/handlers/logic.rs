//! Logical handlers (band `0x40..=0x42`), C-boolean semantics: 0 is
//! false, any non-zero is true, and the pushed result is strictly 0 or 1
//! regardless of input magnitudes.

use cockpit_isa::Opcode;

use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};

impl ExecutionEngine<'_> {
    pub(crate) fn op_logical(&mut self, op: Opcode) -> HandlerReturn {
        let b = vm_try!(self.pop()) != 0;
        let a = vm_try!(self.pop()) != 0;
        let result = match op {
            Opcode::And => a && b,
            _ => a || b,
        };
        vm_try!(self.push(i32::from(result)));
        HandlerReturn::Continue
    }

    pub(crate) fn op_logical_not(&mut self) -> HandlerReturn {
        let a = vm_try!(self.pop()) != 0;
        vm_try!(self.push(i32::from(!a)));
        HandlerReturn::Continue
    }
}
