//! 16550 UART driver (COM1).
//!
//! Three consumers: the early boot logger (lock-free, allocation-free
//! print functions installed before anything else runs), the full
//! logger's serial sink, and the console TTY's output side.

use core::fmt::{self, Write as _};

use crate::arch::x86_64::port::Port;

/// COM1 base port.
const COM1_BASE: u16 = 0x3F8;

/// A 16550 UART at a base port.
pub struct Uart16550 {
    base: u16,
}

impl Uart16550 {
    /// Wraps a base port.
    #[must_use]
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// The COM1 instance.
    #[must_use]
    pub const fn com1() -> Self {
        Self::new(COM1_BASE)
    }

    /// Programs 115200 8N1 with FIFOs enabled.
    pub fn init(&self) {
        // SAFETY: Standard 16550 bring-up on our own port block.
        unsafe {
            Port::<u8>::new(self.base + 1).write(0x00); // IRQs off
            Port::<u8>::new(self.base + 3).write(0x80); // DLAB
            Port::<u8>::new(self.base).write(0x01); // divisor 1 → 115200
            Port::<u8>::new(self.base + 1).write(0x00);
            Port::<u8>::new(self.base + 3).write(0x03); // 8N1
            Port::<u8>::new(self.base + 2).write(0xC7); // FIFO
            Port::<u8>::new(self.base + 4).write(0x0B); // DTR|RTS|OUT2
        }
    }

    /// Writes one byte, spinning on the transmit FIFO.
    pub fn write_byte(&self, byte: u8) {
        // SAFETY: Port I/O on our own port block.
        unsafe {
            while Port::<u8>::new(self.base + 5).read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            Port::<u8>::new(self.base).write(byte);
        }
    }

    /// Reads one byte if the receive FIFO has one.
    #[must_use]
    pub fn try_read_byte(&self) -> Option<u8> {
        // SAFETY: Port I/O on our own port block.
        unsafe {
            if Port::<u8>::new(self.base + 5).read() & 0x01 != 0 {
                Some(Port::<u8>::new(self.base).read())
            } else {
                None
            }
        }
    }
}

struct EarlyWriter;

impl fmt::Write for EarlyWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let uart = Uart16550::com1();
        for byte in s.bytes() {
            if byte == b'\n' {
                uart.write_byte(b'\r');
            }
            uart.write_byte(byte);
        }
        Ok(())
    }
}

fn early_print(args: fmt::Arguments<'_>) {
    let _ = EarlyWriter.write_fmt(args);
}

fn early_log(level: crate::log::LogLevel, args: fmt::Arguments<'_>) {
    let _ = EarlyWriter.write_fmt(format_args!("[early] {} {args}\n", level.name()));
}

/// Installs the pre-heap serial logger.
pub fn init_early_log() {
    Uart16550::com1().init();
    // SAFETY: The early functions are lock-free and callable anywhere.
    unsafe {
        crate::log::set_print_fn(early_print);
        crate::log::set_log_fn(early_log);
    }
}

/// The full logger's serial sink.
pub struct SerialSink {
    uart: Uart16550,
    max_level: crate::log::LogLevel,
}

impl SerialSink {
    /// A COM1 sink at the compile-time maximum level.
    #[must_use]
    pub fn com1() -> Self {
        Self { uart: Uart16550::com1(), max_level: crate::config::MAX_LOG_LEVEL }
    }
}

impl crate::log::LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.uart.write_byte(b'\r');
            }
            self.uart.write_byte(byte);
        }
    }

    fn max_level(&self) -> crate::log::LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

/// COM1 as the console TTY's hardware side.
pub struct Com1TtyDriver;

impl crate::tty::TtyDriver for Com1TtyDriver {
    fn write_byte(&self, byte: u8) {
        Uart16550::com1().write_byte(byte);
    }
}
