//! `cockpit-boot` --- the field-update bootloader core.
//!
//! A blocking, single-threaded protocol stack that programs the
//! dedicated bytecode flash page over the framed transport defined in
//! `cockpit-wire`:
//!
//! ```text
//! serial RX -> FrameParser -> message decode -> ProtocolEngine
//!           -> { DeviceInfo | FlashReadback | FlashProgrammer }
//!           -> message encode -> frame encode -> serial TX
//! ```
//!
//! The [`session::ProtocolEngine`] owns the authoritative session state
//! machine (one handshake, one operation branch per session); the
//! [`programmer::FlashProgrammer`] owns the erase/stage/write/verify
//! algorithm; [`emergency::EmergencyManager`] owns fail-safe shutdown
//! and bounded auto-recovery. Hardware is reached only through the
//! [`flash::FlashStore`] and [`mainloop::BootloaderIo`] capability
//! traits, so the whole stack runs on the host under `cargo test`.

#![no_std]

pub mod device;
pub mod diag;
pub mod emergency;
pub mod error;
pub mod flash;
pub mod mainloop;
pub mod programmer;
pub mod session;

pub use device::{DeviceIdentity, StaticIdentity};
pub use error::BootError;
pub use flash::{FlashError, FlashStore, MemFlash};
pub use mainloop::{Bootloader, BootloaderIo};
pub use session::{ProtocolEngine, SessionState};
