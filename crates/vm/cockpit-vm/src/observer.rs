//! Execution observers: in-process trace subscribers.
//!
//! The bus stores up to [`OBSERVER_MAX`] borrowed observers without
//! taking ownership. Notification is synchronous and in registration
//! order, after the instruction retires; observers must not mutate VM
//! state (the trait only ever sees copies of execution data). Observers
//! may be removed at any time via the id returned at registration.

use crate::config::OBSERVER_MAX;

/// Capability set for execution tracing.
///
/// All methods have empty defaults so an observer implements only the
/// events it cares about.
pub trait ExecutionObserver {
    /// Called after each successful instruction retire with the pc the
    /// instruction was fetched from.
    fn on_instruction_executed(&mut self, _pc: usize, _opcode: u8, _immediate: u16) {}

    /// Called once when a run ends, on HALT or on a fault, with the
    /// number of instructions retired and wall-clock milliseconds.
    fn on_execution_complete(&mut self, _total_instructions: u32, _elapsed_ms: u32) {}

    /// Called when the engine is reset.
    fn on_vm_reset(&mut self) {}
}

/// Stable handle for unregistering an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(usize);

/// Bounded set of observer references, notified in registration order.
pub struct ObserverBus<'o> {
    slots: [Option<&'o mut dyn ExecutionObserver>; OBSERVER_MAX],
}

impl Default for ObserverBus<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'o> ObserverBus<'o> {
    /// Creates an empty bus.
    #[must_use]
    pub const fn new() -> Self {
        // Spelled out because `[None; N]` needs `Copy` and `&mut dyn` is not.
        const { assert!(OBSERVER_MAX == 4) };
        Self {
            slots: [None, None, None, None],
        }
    }

    /// Registers an observer in the first free slot.
    ///
    /// Returns `None` when all [`OBSERVER_MAX`] slots are taken.
    pub fn register(&mut self, observer: &'o mut dyn ExecutionObserver) -> Option<ObserverId> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(observer);
                return Some(ObserverId(i));
            }
        }
        None
    }

    /// Removes a previously registered observer. Safe to call twice.
    pub fn remove(&mut self, id: ObserverId) {
        self.slots[id.0] = None;
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn notify_instruction(&mut self, pc: usize, opcode: u8, immediate: u16) {
        for slot in self.slots.iter_mut().flatten() {
            slot.on_instruction_executed(pc, opcode, immediate);
        }
    }

    pub(crate) fn notify_complete(&mut self, total_instructions: u32, elapsed_ms: u32) {
        for slot in self.slots.iter_mut().flatten() {
            slot.on_execution_complete(total_instructions, elapsed_ms);
        }
    }

    pub(crate) fn notify_reset(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.on_vm_reset();
        }
    }
}
