//! Memory handlers (band `0x50..=0x56`).
//!
//! `LOAD_LOCAL`/`STORE_LOCAL` alias the global slot space in this
//! profile; the bytecode compiler allocates locals as globals. A future
//! profile may give them real stack frames, at which point the aliasing
//! routes in the dispatcher split.
//!
//! Operand conventions:
//! - `LOAD_GLOBAL g` pushes `globals[g]`; `STORE_GLOBAL g` pops the value.
//! - `LOAD_ARRAY a` pops the index and pushes the element.
//! - `STORE_ARRAY a` pops the value, then the index.
//! - `CREATE_ARRAY a` pops the length.

use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};
use crate::error::VmError;
use crate::memory::MemoryContext;

/// Converts a popped stack value into a non-negative index.
fn index_from(value: i32) -> Result<usize, VmError> {
    usize::try_from(value).map_err(|_| VmError::MemoryBounds)
}

impl ExecutionEngine<'_> {
    pub(crate) fn op_load_global(
        &mut self,
        immediate: u16,
        mem: &mut MemoryContext,
    ) -> HandlerReturn {
        let Some(value) = mem.load_global(immediate as usize) else {
            return HandlerReturn::Error(VmError::MemoryBounds);
        };
        vm_try!(self.push(value));
        self.count_memory_op();
        HandlerReturn::Continue
    }

    pub(crate) fn op_store_global(
        &mut self,
        immediate: u16,
        mem: &mut MemoryContext,
    ) -> HandlerReturn {
        let value = vm_try!(self.peek(0));
        vm_try!(mem.store_global(immediate as usize, value));
        // Popped only after the store was accepted, so a bounds fault
        // leaves the stack intact.
        vm_try!(self.pop());
        self.count_memory_op();
        HandlerReturn::Continue
    }

    pub(crate) fn op_load_array(
        &mut self,
        immediate: u16,
        mem: &mut MemoryContext,
    ) -> HandlerReturn {
        let idx = vm_try!(index_from(vm_try!(self.pop())));
        let value = vm_try!(mem.load_array(immediate as usize, idx));
        vm_try!(self.push(value));
        self.count_memory_op();
        HandlerReturn::Continue
    }

    pub(crate) fn op_store_array(
        &mut self,
        immediate: u16,
        mem: &mut MemoryContext,
    ) -> HandlerReturn {
        let value = vm_try!(self.pop());
        let idx = vm_try!(index_from(vm_try!(self.pop())));
        vm_try!(mem.store_array(immediate as usize, idx, value));
        self.count_memory_op();
        HandlerReturn::Continue
    }

    pub(crate) fn op_create_array(
        &mut self,
        immediate: u16,
        mem: &mut MemoryContext,
    ) -> HandlerReturn {
        let len = vm_try!(index_from(vm_try!(self.pop())));
        vm_try!(mem.create_array(immediate as usize, len));
        self.count_memory_op();
        HandlerReturn::Continue
    }
}
