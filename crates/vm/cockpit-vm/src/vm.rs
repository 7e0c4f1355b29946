//! The `ComponentVM` facade.
//!
//! One `ComponentVM` bundles an engine, the [`MemoryContext`] it
//! exclusively owns, the injected host, and the observer bus. Multiple
//! VMs are just multiple independent instances; nothing is shared and
//! there is no global state. An external scheduler that wants to
//! interleave VMs cooperatively drives [`ComponentVM::step`] round-robin.

use cockpit_isa::{Program, ProgramError};

use crate::config::{A_MAX, E_MAX, G_MAX};
use crate::engine::{EngineState, ExecutionEngine, PerfCounters};
use crate::error::{ConfigError, VmError};
use crate::host::HostInterface;
use crate::memory::MemoryContext;
use crate::observer::{ExecutionObserver, ObserverBus, ObserverId};

/// Requested `MemoryContext` sizing, validated by the factory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Global slot count, `1..=G_MAX`.
    pub globals: usize,
    /// Array count, `1..=A_MAX`.
    pub arrays: usize,
    /// Elements per array, `1..=E_MAX`.
    pub elements: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            globals: G_MAX,
            arrays: A_MAX,
            elements: E_MAX,
        }
    }
}

/// A complete VM instance: engine + exclusively owned memory + host +
/// observers.
pub struct ComponentVM<'p, H: HostInterface> {
    engine: ExecutionEngine<'p>,
    memory: MemoryContext,
    host: H,
    observers: ObserverBus<'p>,
}

impl<'p, H: HostInterface> ComponentVM<'p, H> {
    /// Builds a VM with a factory-validated memory context.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] from [`MemoryContext::create`] when
    /// the requested sizing is out of range.
    pub fn new(host: H, config: MemoryConfig) -> Result<Self, ConfigError> {
        let memory = MemoryContext::create(config.globals, config.arrays, config.elements)?;
        Ok(Self {
            engine: ExecutionEngine::new(),
            memory,
            host,
            observers: ObserverBus::new(),
        })
    }

    /// Loads a bytecode program (little-endian 32-bit words).
    ///
    /// # Errors
    ///
    /// Propagates [`ProgramError`] for misaligned, empty, or oversize
    /// input.
    pub fn load_program(&mut self, bytes: &'p [u8]) -> Result<(), ProgramError> {
        let program = Program::parse(bytes)?;
        self.engine.load_program(program);
        Ok(())
    }

    /// Registers the PRINTF string table (dense indices, out-of-band
    /// from the program bytes).
    pub fn set_string_table(&mut self, strings: &'p [&'p str]) {
        self.engine.set_string_table(strings);
    }

    /// Overrides the engine's instruction budget.
    pub fn set_insn_limit(&mut self, limit: u32) {
        self.engine.set_insn_limit(limit);
    }

    /// Runs the loaded program to HALT or a terminal fault.
    ///
    /// # Errors
    ///
    /// The terminal [`VmError`].
    pub fn run(&mut self) -> Result<(), VmError> {
        self.engine
            .execute_program(&mut self.memory, &mut self.host, &mut self.observers)
    }

    /// Executes exactly one instruction; see
    /// [`ExecutionEngine::execute_single_step`].
    ///
    /// # Errors
    ///
    /// The terminal [`VmError`] when the step faults.
    pub fn step(&mut self) -> Result<bool, VmError> {
        self.engine
            .execute_single_step(&mut self.memory, &mut self.host, &mut self.observers)
    }

    /// Resets execution state; optionally also the memory context.
    pub fn reset(&mut self, reset_memory: bool) {
        self.engine.reset(&mut self.observers);
        if reset_memory {
            self.memory.reset();
        }
    }

    /// Registers an execution observer; `None` when the bus is full.
    pub fn register_observer(
        &mut self,
        observer: &'p mut dyn ExecutionObserver,
    ) -> Option<ObserverId> {
        self.observers.register(observer)
    }

    /// Removes a previously registered observer.
    pub fn remove_observer(&mut self, id: ObserverId) {
        self.observers.remove(id);
    }

    /// Engine lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// The fault that ended the last run, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<VmError> {
        self.engine.last_error()
    }

    /// Counters for the current/last run.
    #[must_use]
    pub fn counters(&self) -> &PerfCounters {
        self.engine.counters()
    }

    /// The operand stack, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[i32] {
        self.engine.stack()
    }

    /// The exclusively owned memory context.
    #[must_use]
    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    /// The injected host.
    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Mutable access to the injected host (test scripting).
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}
