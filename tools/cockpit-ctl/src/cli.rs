//! Command-line interface definitions for cockpit-ctl.

use clap::{Parser, Subcommand, ValueEnum};

/// Host-side driver for the CockpitVM field-update bootloader.
#[derive(Parser)]
#[command(name = "cockpit-ctl", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Serial device the bootloader is attached to.
    #[arg(long, short = 'p', global = true, default_value = "/dev/ttyUSB0")]
    pub port: String,

    /// Per-response timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 3000)]
    pub timeout_ms: u64,

    /// Print each request/response pair.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Open a session and print the bootloader's capabilities.
    Handshake,
    /// Query device identification and the flash region map.
    DeviceInfo,
    /// Read flash and dump it as hex.
    Read(ReadArgs),
    /// Program a bytecode image into the designated flash page.
    Program(ProgramArgs),
    /// Send an error-recovery action.
    Recover(RecoverArgs),
}

/// Arguments for the `read` subcommand.
#[derive(Parser)]
pub struct ReadArgs {
    /// Start address (hex with 0x prefix, or decimal).
    #[arg(value_parser = parse_address)]
    pub address: u32,

    /// Number of bytes to read.
    pub length: u32,

    /// Request a CRC-32 with every chunk and check it.
    #[arg(long)]
    pub checksum: bool,
}

/// Arguments for the `program` subcommand.
#[derive(Parser)]
pub struct ProgramArgs {
    /// Bytecode image file.
    pub file: std::path::PathBuf,

    /// Ask the device for a byte-for-byte readback verify.
    #[arg(long)]
    pub verify: bool,
}

/// Arguments for the `recover` subcommand.
#[derive(Parser)]
pub struct RecoverArgs {
    /// The recovery action to request.
    #[arg(value_enum)]
    pub action: RecoverActionArg,
}

/// CLI-level recovery action names.
#[derive(Clone, Copy, ValueEnum)]
pub enum RecoverActionArg {
    /// Re-arm the last failed operation.
    Retry,
    /// Abort the session and reset protocol state.
    Abort,
    /// Clear the error latch, keep session state.
    Clear,
}

/// Accepts `0x...` hex or plain decimal addresses.
fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("bad address {s:?}: {e}"))
}
