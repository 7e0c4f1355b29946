//! Compile-time sizing for the target class (Cortex-M4, ~32 KiB SRAM).
//!
//! Per-instance storage is bounded by these maxima; the factory validates
//! requested sizes against them at construction. A full-size
//! `MemoryContext` is 64 + 1024 signed 32-bit slots plus descriptors,
//! about 4.4 KiB.

/// Maximum number of global variable slots per VM instance.
pub const G_MAX: usize = 64;

/// Maximum number of arrays per VM instance.
pub const A_MAX: usize = 16;

/// Maximum elements per array.
pub const E_MAX: usize = 64;

/// Total pool slots backing all arrays of one instance.
pub const POOL_SLOTS: usize = A_MAX * E_MAX;

/// Maximum operand stack depth.
pub const S_MAX: usize = 32;

/// Default instruction budget for [`execute_program`], preventing runaway
/// loops during testing. Configurable per engine.
///
/// [`execute_program`]: crate::engine::ExecutionEngine::execute_program
pub const DEFAULT_INSN_LIMIT: u32 = 1_000_000;

/// Maximum observers on one bus.
pub const OBSERVER_MAX: usize = 4;

/// Maximum integer arguments a single PRINTF may consume.
pub const PRINTF_ARG_MAX: usize = 8;
