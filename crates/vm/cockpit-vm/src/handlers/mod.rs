//! Instruction handlers, one module per opcode band.
//!
//! Handlers are methods on [`ExecutionEngine`] with a uniform contract:
//! they receive the instruction fields plus the memory/host capabilities
//! they need, and report control flow through `HandlerReturn`. A handler
//! never advances `pc` itself; jumping handlers assign it via
//! `ExecutionEngine::jump_to` and return `Jumped`.
//!
//! [`ExecutionEngine`]: crate::engine::ExecutionEngine

mod arith;
mod bitwise;
mod compare;
mod control;
mod hostcall;
mod logic;
mod memory_ops;
