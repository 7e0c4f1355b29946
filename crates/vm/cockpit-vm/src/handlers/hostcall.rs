//! Host-call handlers (band `0x10..=0x1F`).
//!
//! Each opcode pops its arguments in the documented order and brokers
//! the operation through the injected [`HostInterface`]; any host
//! failure surfaces as `VmError::HardwareFault`. All calls are blocking.
//!
//! Argument contracts (top of stack listed last):
//! - `PIN_MODE`: pin, mode
//! - `DIGITAL_WRITE` / `ANALOG_WRITE`: pin, value
//! - `DIGITAL_READ` / `ANALOG_READ` / `BUTTON_*`: pin — pushes the result
//! - `DELAY`: milliseconds
//! - `MILLIS` / `MICROS`: no operands — push the tick counter
//! - `PRINTF`: `flags` = integer argument count, `immediate` = string
//!   table index; pops the arguments (last argument on top)

use core::fmt::Write as _;

use cockpit_isa::Opcode;

use crate::config::PRINTF_ARG_MAX;
use crate::engine::{ExecutionEngine, HandlerReturn, vm_try};
use crate::error::VmError;
use crate::host::{GpioMode, HostInterface};

/// Serial handle PRINTF writes to.
const PRINTF_HANDLE: u8 = 0;

/// Formatted-output scratch. Overlong messages are truncated, never an
/// error; diagnostics loss is preferable to faulting the program.
struct FmtBuf {
    buf: [u8; 192],
    len: usize,
}

impl FmtBuf {
    const fn new() -> Self {
        Self {
            buf: [0; 192],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl core::fmt::Write for FmtBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = self.buf.len() - self.len;
        let n = bytes.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

/// Expands `%d`/`%u`/`%x`/`%c`/`%%` directives against `args`. Unknown
/// directives and surplus directives are emitted literally.
fn render(out: &mut FmtBuf, fmt: &str, args: &[i32]) {
    let mut next = 0usize;
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            let _ = out.write_char(c);
            continue;
        }
        match chars.next() {
            Some('%') => {
                let _ = out.write_char('%');
            }
            Some(spec @ ('d' | 'u' | 'x' | 'c')) if next < args.len() => {
                let arg = args[next];
                next += 1;
                let _ = match spec {
                    'd' => write!(out, "{arg}"),
                    'u' => write!(out, "{}", arg as u32),
                    'x' => write!(out, "{:x}", arg as u32),
                    _ => out.write_char(char::from_u32(arg as u32).unwrap_or('?')),
                };
            }
            Some(other) => {
                let _ = out.write_char('%');
                let _ = out.write_char(other);
            }
            None => {
                let _ = out.write_char('%');
            }
        }
    }
}

impl ExecutionEngine<'_> {
    /// All host-call opcodes except PRINTF.
    pub(crate) fn op_host(&mut self, op: Opcode, io: &mut dyn HostInterface) -> HandlerReturn {
        match op {
            Opcode::PinMode => {
                let mode = vm_try!(self.pop());
                let pin = vm_try!(pop_u8(self));
                let Some(mode) = GpioMode::from_code(mode) else {
                    return HandlerReturn::Error(VmError::HardwareFault);
                };
                vm_try!(lift(io.gpio_config(pin, mode)));
            }
            Opcode::DigitalWrite => {
                let value = vm_try!(self.pop());
                let pin = vm_try!(pop_u8(self));
                vm_try!(lift(io.gpio_write(pin, value != 0)));
            }
            Opcode::DigitalRead => {
                let pin = vm_try!(pop_u8(self));
                let level = vm_try!(lift(io.gpio_read(pin)));
                vm_try!(self.push(i32::from(level)));
            }
            Opcode::AnalogWrite => {
                let value = vm_try!(self.pop());
                let pin = vm_try!(pop_u8(self));
                let Ok(value) = u16::try_from(value) else {
                    return HandlerReturn::Error(VmError::HardwareFault);
                };
                vm_try!(lift(io.analog_write(pin, value)));
            }
            Opcode::AnalogRead => {
                let pin = vm_try!(pop_u8(self));
                let sample = vm_try!(lift(io.analog_read(pin)));
                vm_try!(self.push(i32::from(sample)));
            }
            Opcode::Delay => {
                let ms = vm_try!(self.pop());
                let Ok(ms) = u32::try_from(ms) else {
                    return HandlerReturn::Error(VmError::HardwareFault);
                };
                vm_try!(lift(io.delay_ms(ms)));
            }
            Opcode::Millis => {
                let now = io.tick_ms();
                vm_try!(self.push(now as i32));
            }
            Opcode::Micros => {
                let now = io.tick_us();
                vm_try!(self.push(now as i32));
            }
            Opcode::ButtonPressed => {
                let button = vm_try!(pop_u8(self));
                let edge = vm_try!(lift(io.button_pressed(button)));
                vm_try!(self.push(i32::from(edge)));
            }
            Opcode::ButtonReleased => {
                let button = vm_try!(pop_u8(self));
                let edge = vm_try!(lift(io.button_released(button)));
                vm_try!(self.push(i32::from(edge)));
            }
            _ => return HandlerReturn::Error(VmError::InvalidOpcode(op.as_u8())),
        }
        self.count_io_op();
        HandlerReturn::Continue
    }

    /// PRINTF: renders the string-table entry at `immediate` with
    /// `flags` popped integer arguments and writes it to the serial
    /// handle. A missing string-table entry is a loader/program
    /// mismatch and faults with `MemoryBounds`.
    pub(crate) fn op_printf(
        &mut self,
        flags: u8,
        immediate: u16,
        io: &mut dyn HostInterface,
    ) -> HandlerReturn {
        let argc = flags as usize;
        if argc > PRINTF_ARG_MAX {
            return HandlerReturn::Error(VmError::MemoryBounds);
        }
        let Some(fmt) = self.string(immediate as usize) else {
            return HandlerReturn::Error(VmError::MemoryBounds);
        };

        let mut args = [0i32; PRINTF_ARG_MAX];
        for slot in args[..argc].iter_mut().rev() {
            *slot = vm_try!(self.pop());
        }

        let mut out = FmtBuf::new();
        render(&mut out, fmt, &args[..argc]);
        vm_try!(lift(io.serial_write_str(PRINTF_HANDLE, out.as_str())));
        self.count_io_op();
        HandlerReturn::Continue
    }
}

/// Lifts a host result into the VM fault domain.
fn lift<T>(result: Result<T, crate::host::HostError>) -> Result<T, VmError> {
    result.map_err(|_| VmError::HardwareFault)
}

/// Pops a value that must fit a `u8` (pin/button index).
fn pop_u8(engine: &mut ExecutionEngine<'_>) -> Result<u8, VmError> {
    let value = engine.pop()?;
    u8::try_from(value).map_err(|_| VmError::HardwareFault)
}
