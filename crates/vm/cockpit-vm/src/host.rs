//! The host interface: abstracted, blocking hardware access.
//!
//! Instruction handlers never touch registers; every I/O operation goes
//! through a [`HostInterface`] implementation injected into the VM. The
//! core methods (GPIO, timing, serial out) must be provided; extended
//! capabilities (analog, buttons) default to [`HostError::Unsupported`]
//! so boards implement only what they have. The engine lifts any
//! non-success into `VmError::HardwareFault`.

use core::fmt;

/// GPIO pin configuration selected by `PIN_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioMode {
    /// High-impedance input.
    Input,
    /// Push-pull output.
    Output,
    /// Input with internal pull-up.
    InputPullUp,
}

impl GpioMode {
    /// Maps the bytecode-level mode integer (0/1/2).
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            2 => Some(Self::InputPullUp),
            _ => None,
        }
    }
}

/// Host operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The resource is temporarily in use.
    Busy,
    /// The capability is not implemented on this board.
    Unsupported,
    /// The hardware reported a fault.
    Fault,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "host resource busy"),
            Self::Unsupported => write!(f, "host capability unsupported"),
            Self::Fault => write!(f, "host hardware fault"),
        }
    }
}

/// Blocking hardware capabilities consumed by the host-call handlers.
pub trait HostInterface {
    /// Configures a GPIO pin.
    fn gpio_config(&mut self, pin: u8, mode: GpioMode) -> Result<(), HostError>;

    /// Drives a GPIO output.
    fn gpio_write(&mut self, pin: u8, high: bool) -> Result<(), HostError>;

    /// Samples a GPIO input.
    fn gpio_read(&mut self, pin: u8) -> Result<bool, HostError>;

    /// Blocks for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32) -> Result<(), HostError>;

    /// Free-running millisecond counter (wraps at 2³²).
    fn tick_ms(&mut self) -> u32;

    /// Free-running microsecond counter (wraps at 2³²).
    fn tick_us(&mut self) -> u32;

    /// Writes a string to the serial handle (PRINTF output).
    fn serial_write_str(&mut self, handle: u8, s: &str) -> Result<(), HostError>;

    /// PWM/DAC output. Default: unsupported.
    fn analog_write(&mut self, _pin: u8, _value: u16) -> Result<(), HostError> {
        Err(HostError::Unsupported)
    }

    /// ADC input. Default: unsupported.
    fn analog_read(&mut self, _pin: u8) -> Result<u16, HostError> {
        Err(HostError::Unsupported)
    }

    /// Debounced press edge for a button index. Default: unsupported.
    fn button_pressed(&mut self, _button: u8) -> Result<bool, HostError> {
        Err(HostError::Unsupported)
    }

    /// Debounced release edge for a button index. Default: unsupported.
    fn button_released(&mut self, _button: u8) -> Result<bool, HostError> {
        Err(HostError::Unsupported)
    }
}

pub mod mock {
    //! Scripted host double for tests and host-side harnesses.

    use super::{GpioMode, HostError, HostInterface};

    /// Upper bound on pins the mock tracks.
    const PIN_COUNT: usize = 32;
    /// Capacity of the captured serial output.
    const SERIAL_CAP: usize = 256;

    /// A deterministic in-memory host.
    ///
    /// GPIO writes are recorded; reads return the last written level (or
    /// a scripted level); the clock only advances via `delay_ms` and
    /// [`MockHost::advance_ms`], keeping timing tests exact.
    #[derive(Debug)]
    pub struct MockHost {
        modes: [Option<GpioMode>; PIN_COUNT],
        levels: [bool; PIN_COUNT],
        analog: [u16; PIN_COUNT],
        buttons: [bool; PIN_COUNT],
        now_ms: u32,
        serial: [u8; SERIAL_CAP],
        serial_len: usize,
        /// Force every operation to fail; exercises `HardwareFault` paths.
        pub fail_all: bool,
    }

    impl Default for MockHost {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockHost {
        /// Creates a mock with all pins low and the clock at zero.
        #[must_use]
        pub fn new() -> Self {
            Self {
                modes: [None; PIN_COUNT],
                levels: [false; PIN_COUNT],
                analog: [0; PIN_COUNT],
                buttons: [false; PIN_COUNT],
                now_ms: 0,
                serial: [0; SERIAL_CAP],
                serial_len: 0,
                fail_all: false,
            }
        }

        /// Scripts the level a `gpio_read` of `pin` will return.
        pub fn set_level(&mut self, pin: u8, high: bool) {
            self.levels[pin as usize] = high;
        }

        /// Scripts the value an `analog_read` of `pin` will return.
        pub fn set_analog(&mut self, pin: u8, value: u16) {
            self.analog[pin as usize] = value;
        }

        /// Scripts the next `button_pressed`/`button_released` edge.
        pub fn set_button(&mut self, button: u8, active: bool) {
            self.buttons[button as usize] = active;
        }

        /// Advances the mock clock without a delay call.
        pub fn advance_ms(&mut self, ms: u32) {
            self.now_ms = self.now_ms.wrapping_add(ms);
        }

        /// The configured mode of `pin`, if any.
        #[must_use]
        pub fn mode(&self, pin: u8) -> Option<GpioMode> {
            self.modes[pin as usize]
        }

        /// The last driven level of `pin`.
        #[must_use]
        pub fn level(&self, pin: u8) -> bool {
            self.levels[pin as usize]
        }

        /// The last analog value written to `pin`.
        #[must_use]
        pub fn analog(&self, pin: u8) -> u16 {
            self.analog[pin as usize]
        }

        /// Everything written through `serial_write_str`, in order.
        #[must_use]
        pub fn serial_output(&self) -> &str {
            core::str::from_utf8(&self.serial[..self.serial_len]).unwrap_or("")
        }

        fn check(&self) -> Result<(), HostError> {
            if self.fail_all {
                Err(HostError::Fault)
            } else {
                Ok(())
            }
        }
    }

    impl HostInterface for MockHost {
        fn gpio_config(&mut self, pin: u8, mode: GpioMode) -> Result<(), HostError> {
            self.check()?;
            self.modes[pin as usize] = Some(mode);
            Ok(())
        }

        fn gpio_write(&mut self, pin: u8, high: bool) -> Result<(), HostError> {
            self.check()?;
            self.levels[pin as usize] = high;
            Ok(())
        }

        fn gpio_read(&mut self, pin: u8) -> Result<bool, HostError> {
            self.check()?;
            Ok(self.levels[pin as usize])
        }

        fn delay_ms(&mut self, ms: u32) -> Result<(), HostError> {
            self.check()?;
            self.now_ms = self.now_ms.wrapping_add(ms);
            Ok(())
        }

        fn tick_ms(&mut self) -> u32 {
            self.now_ms
        }

        fn tick_us(&mut self) -> u32 {
            self.now_ms.wrapping_mul(1000)
        }

        fn serial_write_str(&mut self, _handle: u8, s: &str) -> Result<(), HostError> {
            self.check()?;
            let bytes = s.as_bytes();
            let room = SERIAL_CAP - self.serial_len;
            let n = bytes.len().min(room);
            self.serial[self.serial_len..self.serial_len + n].copy_from_slice(&bytes[..n]);
            self.serial_len += n;
            Ok(())
        }

        fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), HostError> {
            self.check()?;
            self.analog[pin as usize] = value;
            Ok(())
        }

        fn analog_read(&mut self, pin: u8) -> Result<u16, HostError> {
            self.check()?;
            Ok(self.analog[pin as usize])
        }

        fn button_pressed(&mut self, button: u8) -> Result<bool, HostError> {
            self.check()?;
            Ok(self.buttons[button as usize])
        }

        fn button_released(&mut self, button: u8) -> Result<bool, HostError> {
            self.check()?;
            Ok(!self.buttons[button as usize])
        }
    }
}
