//! The fetch/decode/execute core.
//!
//! Every instruction handler tells the dispatcher what happened to
//! control flow through [`HandlerReturn`]; the dispatcher is the single
//! writer of `pc` on the fall-through path. An earlier design saved the
//! pc before dispatch and compared it afterwards to detect jumps, which
//! let a handler and the dispatcher both move the pc; the sum type makes
//! the ownership explicit at the type level.
//!
//! All faults are terminal for the run: the engine stores the error,
//! moves to [`EngineState::Faulted`], and delivers the completion
//! notification with the instruction count reached.

use planck_noalloc::vec::ArrayVec;

use cockpit_core::time::Ticks;
use cockpit_isa::{Instruction, Opcode, Program};

use crate::config::{DEFAULT_INSN_LIMIT, S_MAX};
use crate::error::VmError;
use crate::host::HostInterface;
use crate::memory::MemoryContext;
use crate::observer::ObserverBus;

/// Unwraps a fallible step inside a handler, converting the error into
/// [`HandlerReturn::Error`].
macro_rules! vm_try {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return $crate::engine::HandlerReturn::Error(e),
        }
    };
}
pub(crate) use vm_try;

/// A handler's declaration of what happened to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerReturn {
    /// Normal instruction; the dispatcher advances `pc` by 1.
    Continue,
    /// The handler already assigned `pc`; the dispatcher must not.
    Jumped,
    /// The program halted cleanly.
    Halted,
    /// The run faulted.
    Error(VmError),
}

/// Per-run performance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounters {
    /// Instructions retired.
    pub instructions: u32,
    /// Global/array loads and stores executed.
    pub memory_ops: u32,
    /// Host interface calls executed.
    pub io_ops: u32,
    /// Wall-clock milliseconds between run start and completion.
    pub elapsed_ms: u32,
}

/// Engine lifecycle.
///
/// ```text
/// Idle ── load_program ──▶ Loaded ── step/execute ──▶ Running
/// Running ── HALT ──▶ Halted        Running ── fault ──▶ Faulted
/// Halted/Faulted ── reset ──▶ Loaded (program retained)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No program loaded.
    Idle,
    /// Program loaded, nothing executed yet.
    Loaded,
    /// Mid-run.
    Running,
    /// Clean HALT.
    Halted,
    /// Terminal fault; see `last_error`.
    Faulted,
}

/// The bytecode execution engine.
///
/// Borrows its program (flash-resident in production) and operates on a
/// [`MemoryContext`] and [`HostInterface`] passed per call, so one engine
/// never aliases another's state.
pub struct ExecutionEngine<'p> {
    program: Option<Program<'p>>,
    /// PRINTF string table, dense indices, registered by the loader.
    strings: &'p [&'p str],
    pc: usize,
    stack: ArrayVec<i32, S_MAX>,
    state: EngineState,
    last_error: Option<VmError>,
    counters: PerfCounters,
    insn_limit: u32,
    run_start: Ticks,
}

impl Default for ExecutionEngine<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'p> ExecutionEngine<'p> {
    /// Creates an idle engine with the default instruction budget.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            program: None,
            strings: &[],
            pc: 0,
            stack: ArrayVec::new(),
            state: EngineState::Idle,
            last_error: None,
            counters: PerfCounters {
                instructions: 0,
                memory_ops: 0,
                io_ops: 0,
                elapsed_ms: 0,
            },
            insn_limit: DEFAULT_INSN_LIMIT,
            run_start: Ticks::from_millis(0),
        }
    }

    /// Overrides the instruction budget for subsequent runs.
    pub fn set_insn_limit(&mut self, limit: u32) {
        self.insn_limit = limit;
    }

    /// Registers the PRINTF string table (dense indices).
    pub fn set_string_table(&mut self, strings: &'p [&'p str]) {
        self.strings = strings;
    }

    /// Loads a validated program and moves to [`EngineState::Loaded`].
    ///
    /// Clears pc, stack, error, and counters from any previous run.
    pub fn load_program(&mut self, program: Program<'p>) {
        self.program = Some(program);
        self.clear_run_state();
        self.state = EngineState::Loaded;
    }

    /// Resets execution state: pc, stack, halted/faulted status, error,
    /// counters. The loaded program and string table are retained; the
    /// `MemoryContext` is untouched (the embedder resets it separately
    /// when desired). Observers receive a reset event.
    pub fn reset(&mut self, observers: &mut ObserverBus<'_>) {
        self.clear_run_state();
        self.state = if self.program.is_some() {
            EngineState::Loaded
        } else {
            EngineState::Idle
        };
        observers.notify_reset();
    }

    fn clear_run_state(&mut self) {
        self.pc = 0;
        self.stack.clear();
        self.last_error = None;
        self.counters = PerfCounters::default();
        self.run_start = Ticks::from_millis(0);
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Program counter (instruction index of the next fetch).
    #[must_use]
    pub const fn pc(&self) -> usize {
        self.pc
    }

    /// Operand stack depth.
    #[must_use]
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    /// The operand stack, bottom first. For traces and tests.
    #[must_use]
    pub fn stack(&self) -> &[i32] {
        self.stack.as_slice()
    }

    /// The fault that ended the last run, if any.
    #[must_use]
    pub const fn last_error(&self) -> Option<VmError> {
        self.last_error
    }

    /// Counters for the current/last run.
    #[must_use]
    pub const fn counters(&self) -> &PerfCounters {
        &self.counters
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Runs until HALT, a fault, or the instruction budget is exhausted.
    ///
    /// # Errors
    ///
    /// The terminal [`VmError`] of the run. Also retrievable afterwards
    /// via [`last_error`](Self::last_error).
    pub fn execute_program(
        &mut self,
        mem: &mut MemoryContext,
        io: &mut dyn HostInterface,
        observers: &mut ObserverBus<'_>,
    ) -> Result<(), VmError> {
        loop {
            if !self.execute_single_step(mem, io, observers)? {
                return Ok(());
            }
        }
    }

    /// Executes exactly one instruction.
    ///
    /// Returns `Ok(true)` when an instruction retired and the engine can
    /// continue, `Ok(false)` when the engine is not runnable (no program,
    /// already halted or faulted) or the retired instruction was HALT.
    ///
    /// # Errors
    ///
    /// The terminal [`VmError`] when the step faults.
    pub fn execute_single_step(
        &mut self,
        mem: &mut MemoryContext,
        io: &mut dyn HostInterface,
        observers: &mut ObserverBus<'_>,
    ) -> Result<bool, VmError> {
        let Some(program) = self.program else {
            return Ok(false);
        };
        match self.state {
            EngineState::Loaded => {
                self.state = EngineState::Running;
                self.run_start = Ticks::from_millis(io.tick_ms());
            }
            EngineState::Running => {}
            EngineState::Idle | EngineState::Halted | EngineState::Faulted => {
                return Ok(false);
            }
        }

        if self.counters.instructions >= self.insn_limit {
            return Err(self.fault(VmError::ProgramLimitReached, io, observers));
        }

        // pc is validated before every fetch; jumps were bounds-checked
        // when taken, so this only trips when execution ran off the end.
        let Some(insn) = program.fetch(self.pc) else {
            return Err(self.fault(VmError::PcOutOfBounds, io, observers));
        };
        let pc_before = self.pc;

        match self.dispatch(insn, program.len(), mem, io) {
            HandlerReturn::Continue => {
                self.pc += 1;
                self.retire(pc_before, insn, observers);
                Ok(true)
            }
            HandlerReturn::Jumped => {
                self.retire(pc_before, insn, observers);
                Ok(true)
            }
            HandlerReturn::Halted => {
                self.state = EngineState::Halted;
                self.retire(pc_before, insn, observers);
                self.complete(io, observers);
                Ok(false)
            }
            HandlerReturn::Error(e) => Err(self.fault(e, io, observers)),
        }
    }

    /// Routes one instruction to its handler.
    ///
    /// The handler bodies live in the `handlers` modules, one per opcode
    /// band; each returns a [`HandlerReturn`] and never touches `pc`
    /// except through [`jump_to`](Self::jump_to).
    fn dispatch(
        &mut self,
        insn: Instruction,
        program_len: usize,
        mem: &mut MemoryContext,
        io: &mut dyn HostInterface,
    ) -> HandlerReturn {
        let Some(op) = Opcode::from_u8(insn.opcode) else {
            return HandlerReturn::Error(VmError::InvalidOpcode(insn.opcode));
        };

        match op {
            // Core control/stack
            Opcode::Halt => HandlerReturn::Halted,
            Opcode::Push => self.op_push(insn.immediate),
            Opcode::Pop => self.op_pop(),
            Opcode::Add | Opcode::Sub | Opcode::Mul => self.op_arith(op),
            Opcode::Div | Opcode::Mod => self.op_div_mod(op),
            Opcode::Call => self.op_call(insn.immediate, program_len),
            Opcode::Ret => self.op_ret(program_len),

            // Host/platform calls
            Opcode::PinMode
            | Opcode::DigitalWrite
            | Opcode::DigitalRead
            | Opcode::AnalogWrite
            | Opcode::AnalogRead
            | Opcode::Delay
            | Opcode::Millis
            | Opcode::Micros
            | Opcode::ButtonPressed
            | Opcode::ButtonReleased => self.op_host(op, io),
            Opcode::Printf => self.op_printf(insn.flags, insn.immediate, io),

            // Comparisons
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
                self.op_compare_unsigned(op)
            }
            Opcode::EqSigned
            | Opcode::NeSigned
            | Opcode::LtSigned
            | Opcode::GtSigned
            | Opcode::LeSigned
            | Opcode::GeSigned => self.op_compare_signed(op),

            // Control flow
            Opcode::Jmp => self.op_jmp(insn.immediate, program_len),
            Opcode::JmpTrue => self.op_jmp_cond(insn.immediate, program_len, true),
            Opcode::JmpFalse => self.op_jmp_cond(insn.immediate, program_len, false),

            // Logical
            Opcode::And | Opcode::Or => self.op_logical(op),
            Opcode::Not => self.op_logical_not(),

            // Memory
            Opcode::LoadGlobal | Opcode::LoadLocal => self.op_load_global(insn.immediate, mem),
            Opcode::StoreGlobal | Opcode::StoreLocal => self.op_store_global(insn.immediate, mem),
            Opcode::LoadArray => self.op_load_array(insn.immediate, mem),
            Opcode::StoreArray => self.op_store_array(insn.immediate, mem),
            Opcode::CreateArray => self.op_create_array(insn.immediate, mem),

            // Bitwise
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => self.op_bitwise(op),
            Opcode::BitNot => self.op_bitwise_not(),
            Opcode::Shl => self.op_shl(),
            Opcode::Shr => self.op_shr(insn.insn_flags()),
        }
    }

    fn retire(&mut self, pc_before: usize, insn: Instruction, observers: &mut ObserverBus<'_>) {
        self.counters.instructions += 1;
        observers.notify_instruction(pc_before, insn.opcode, insn.immediate);
    }

    fn complete(&mut self, io: &mut dyn HostInterface, observers: &mut ObserverBus<'_>) {
        // Wrap-safe: the tick counter rolls over every ~49.7 days.
        self.counters.elapsed_ms = Ticks::from_millis(io.tick_ms()).since(self.run_start);
        observers.notify_complete(self.counters.instructions, self.counters.elapsed_ms);
    }

    fn fault(
        &mut self,
        error: VmError,
        io: &mut dyn HostInterface,
        observers: &mut ObserverBus<'_>,
    ) -> VmError {
        self.last_error = Some(error);
        self.state = EngineState::Faulted;
        self.complete(io, observers);
        error
    }

    // -----------------------------------------------------------------
    // Stack and pc primitives used by the handlers
    // -----------------------------------------------------------------

    pub(crate) fn push(&mut self, value: i32) -> Result<(), VmError> {
        self.stack
            .try_push(value)
            .map_err(|_| VmError::StackOverflow)
    }

    pub(crate) fn pop(&mut self) -> Result<i32, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Reads `depth` slots below the top without popping (0 = top).
    pub(crate) fn peek(&self, depth: usize) -> Result<i32, VmError> {
        let len = self.stack.len();
        if depth >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack.as_slice()[len - 1 - depth])
    }

    /// Assigns `pc` on behalf of a jumping handler.
    pub(crate) fn jump_to(&mut self, target: usize) {
        self.pc = target;
    }

    pub(crate) fn count_memory_op(&mut self) {
        self.counters.memory_ops += 1;
    }

    pub(crate) fn count_io_op(&mut self) {
        self.counters.io_ops += 1;
    }

    pub(crate) fn string(&self, index: usize) -> Option<&'p str> {
        self.strings.get(index).copied()
    }
}
