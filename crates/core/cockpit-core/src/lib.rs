//! Shared infrastructure for the CockpitVM cores.
//!
//! This crate contains the pieces both the virtual machine and the
//! bootloader depend on but that belong to neither: the structured
//! diagnostics facade, overflow-safe millisecond clock arithmetic, and a
//! fixed-capacity event history ring.
//!
//! Everything here is `no_std` and allocation-free; tests run on the host
//! with `cargo test`.

#![no_std]

pub mod history;
pub mod log;
pub mod time;
