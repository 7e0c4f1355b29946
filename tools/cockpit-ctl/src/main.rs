//! Host-side bootloader driver.
//!
//! Drives one session per invocation: `handshake`, `device-info`,
//! `read`, `program`, or `recover`, over a serial device node. Exit
//! codes are the automation contract: 0 success, 1 protocol error,
//! 2 CRC error, 3 flash error, 4 timeout, 5 bounds error.

mod cli;
mod client;
mod error;
mod transport;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use cockpit_wire::{RecoveryAction, Response};

use crate::cli::{Cli, Command, RecoverActionArg};
use crate::client::BootClient;
use crate::error::{CtlError, MAX_READ_LENGTH};

fn main() {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(exit_code(&e));
        }
    }
}

/// Maps an error chain onto the documented exit codes.
fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<CtlError>().map_or(1, CtlError::exit_code)
}

fn run(cli: &Cli) -> Result<()> {
    let port = transport::open_serial(&cli.port)
        .with_context(|| format!("opening serial port {}", cli.port))?;
    let mut client = BootClient::new(
        port,
        Duration::from_millis(cli.timeout_ms),
        cli.verbose,
    );

    match &cli.command {
        Command::Handshake => cmd_handshake(&mut client),
        Command::DeviceInfo => cmd_device_info(&mut client),
        Command::Read(args) => cmd_read(&mut client, args),
        Command::Program(args) => cmd_program(&mut client, args),
        Command::Recover(args) => cmd_recover(&mut client, args.action),
    }
}

fn cmd_handshake<T: std::io::Read + std::io::Write>(client: &mut BootClient<T>) -> Result<()> {
    let info = client.handshake()?;
    println!("bootloader version : {}", info.bootloader_version);
    println!("capabilities       : {:#010b}", info.capabilities);
    println!("flash page size    : {} bytes", info.flash_page_size);
    println!("target address     : {:#010x}", info.target_flash_address);
    Ok(())
}

fn cmd_device_info<T: std::io::Read + std::io::Write>(client: &mut BootClient<T>) -> Result<()> {
    client.handshake()?;
    let info = client.device_info()?;
    let Response::DeviceInfoResp {
        device_model,
        bootloader_version,
        flash_total_size,
        flash_page_size,
        bootloader_region_end,
        hypervisor_region_end,
        bytecode_region_start,
        bytecode_region_end,
        unique_device_id,
        hardware_revision,
    } = info
    else {
        unreachable!("device_info() returns DeviceInfoResp");
    };

    println!("model              : {}", device_model.as_str());
    println!("bootloader version : {}", bootloader_version.as_str());
    println!("hardware revision  : {hardware_revision}");
    println!("flash              : {flash_total_size} bytes, {flash_page_size}-byte pages");
    println!("bootloader region  : ..{bootloader_region_end:#010x}");
    println!("hypervisor region  : ..{hypervisor_region_end:#010x}");
    println!("bytecode region    : {bytecode_region_start:#010x}..{bytecode_region_end:#010x}");
    print!("unique id          : ");
    for b in unique_device_id.as_slice() {
        print!("{b:02x}");
    }
    println!();
    Ok(())
}

fn cmd_read<T: std::io::Read + std::io::Write>(
    client: &mut BootClient<T>,
    args: &cli::ReadArgs,
) -> Result<()> {
    if args.length == 0 || args.length > MAX_READ_LENGTH {
        return Err(CtlError::Bounds(format!("length {} out of range", args.length)).into());
    }
    client.handshake()?;
    let data = client.read_range(args.address, args.length, args.checksum)?;
    hexdump(args.address, &data);
    Ok(())
}

fn cmd_program<T: std::io::Read + std::io::Write>(
    client: &mut BootClient<T>,
    args: &cli::ProgramArgs,
) -> Result<()> {
    let image = std::fs::read(&args.file)
        .with_context(|| format!("reading image {}", args.file.display()))?;
    let info = client.handshake()?;
    if image.len() as u32 > info.flash_page_size {
        return Err(CtlError::Bounds(format!(
            "image is {} bytes but the page holds {}",
            image.len(),
            info.flash_page_size
        ))
        .into());
    }

    let summary = client.program(&image, args.verify)?;
    println!("programmed         : {} bytes", summary.actual_data_length);
    println!("flash footprint    : {} bytes", summary.bytes_programmed);
    println!("flash crc32        : {:#010x}", summary.flash_crc32);
    print!("image sha-256      : ");
    for b in &summary.verification_hash {
        print!("{b:02x}");
    }
    println!();
    println!(
        "device verify      : {}",
        if summary.hardware_verify_passed {
            "passed"
        } else {
            "skipped"
        }
    );
    Ok(())
}

fn cmd_recover<T: std::io::Read + std::io::Write>(
    client: &mut BootClient<T>,
    action: RecoverActionArg,
) -> Result<()> {
    let action = match action {
        RecoverActionArg::Retry => RecoveryAction::RetryLastOperation,
        RecoverActionArg::Abort => RecoveryAction::AbortAndReset,
        RecoverActionArg::Clear => RecoveryAction::ClearErrorState,
    };
    client.recover(action)?;
    println!("recovery acknowledged");
    Ok(())
}

/// Sixteen-byte-wide hex dump with addresses.
fn hexdump(base: u32, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        print!("{:#010x}  ", base as usize + i * 16);
        for b in row {
            print!("{b:02x} ");
        }
        println!();
    }
}
