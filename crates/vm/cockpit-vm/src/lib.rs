//! `cockpit-vm` --- the CockpitVM bytecode virtual machine.
//!
//! A stack-based interpreter for the fixed 32-bit instruction set defined
//! in `cockpit-isa`. Each [`ComponentVM`] instance exclusively owns one
//! statically sized [`MemoryContext`]; all hardware access is brokered
//! through the [`HostInterface`] capability trait; execution is observable
//! through the bounded [`ObserverBus`].
//!
//! The execution core is the [`ExecutionEngine`]: a fetch/decode/execute
//! loop in which every instruction handler declares its control-flow
//! intent through [`HandlerReturn`], leaving the dispatcher as the single
//! writer of the program counter on the fall-through path.
//!
//! The crate is `no_std` and allocation-free; programs borrow their
//! bytecode (typically flash-resident) and are never copied.

#![no_std]

#[cfg(test)]
extern crate alloc;

pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod memory;
pub mod observer;
pub mod vm;

mod handlers;

pub use engine::{EngineState, ExecutionEngine, HandlerReturn, PerfCounters};
pub use error::{ConfigError, VmError};
pub use host::{GpioMode, HostError, HostInterface};
pub use memory::MemoryContext;
pub use observer::{ExecutionObserver, ObserverBus, ObserverId};
pub use vm::{ComponentVM, MemoryConfig};
