//! Byte transport for the bootloader link.
//!
//! The driver talks to anything implementing `Read + Write`. For real
//! hardware that is the serial device node, opened here; the line
//! discipline (115200 8-N-1, raw, VMIN=0/VTIME for polled reads) is
//! expected to be configured by the provisioning scripts before the
//! driver runs. Tests substitute an in-process device simulator.

use std::fs::{File, OpenOptions};
use std::io;

/// Opens the serial device node read/write.
///
/// # Errors
///
/// Propagates the underlying `open` failure.
pub fn open_serial(path: &str) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}
