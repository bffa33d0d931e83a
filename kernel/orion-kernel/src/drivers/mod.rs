//! In-tree drivers.
//!
//! Only the serial console lives in the kernel proper — it backs early
//! logging, the full-logger sink, and the console TTY. Real device
//! drivers register from outside through the `dev` contracts.

pub mod uart16550;

extern crate alloc;

use alloc::sync::Arc;

use orion_syscall::Errno;

/// Device-class major of the console.
pub const CONSOLE_MAJOR: u32 = 5;

/// The console TTY exposed as a character device.
pub struct ConsoleDevice {
    tty: Arc<crate::tty::Tty>,
}

impl ConsoleDevice {
    /// Wraps a TTY.
    #[must_use]
    pub fn new(tty: Arc<crate::tty::Tty>) -> Self {
        Self { tty }
    }
}

impl crate::dev::DeviceOps for ConsoleDevice {
    fn read(&self, _off: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.tty.read(buf)
    }

    fn write(&self, _off: u64, buf: &[u8]) -> Result<usize, Errno> {
        self.tty.write(buf)
    }

    fn ioctl(&self, request: u32, arg: usize) -> Result<usize, Errno> {
        self.tty.ioctl(request, arg)
    }
}
