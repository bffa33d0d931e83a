//! Terminals.
//!
//! A [`Tty`] couples a hardware driver (the output side and the source
//! of input bytes) with a line discipline, input/output queues, termios
//! settings, a window size, and job control: the foreground pgroup and
//! the owning session. Input bytes arrive from interrupt context through
//! [`Tty::input_byte`]; special characters turn into signals on the
//! foreground pgroup.

pub mod ldisc;

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use orion_syscall::Errno;
use orion_syscall::flags::{TIOCGPGRP, TIOCGWINSZ, TIOCSPGRP};
use orion_syscall::signal::{SIGINT, SIGTSTP, SIGWINCH};

use crate::sync::{Mutex, SpinMutex, WaitQueue};

pub use ldisc::{LdiscAction, LineDiscipline};

/// Terminal I/O settings.
#[derive(Debug, Clone, Copy)]
pub struct Termios {
    /// Canonical (line-cooked) input.
    pub canonical: bool,
    /// Echo input back to the output queue.
    pub echo: bool,
    /// Generate job-control signals for special characters.
    pub isig: bool,
    /// Line speed in baud; queue sizes follow it.
    pub baud: u32,
}

impl Default for Termios {
    fn default() -> Self {
        Self { canonical: true, echo: true, isig: true, baud: 38_400 }
    }
}

/// Terminal window dimensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinSize {
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

/// The hardware side of a terminal.
pub trait TtyDriver: Send + Sync {
    /// Pushes one byte to the output device.
    fn write_byte(&self, byte: u8);
    /// Applies a new line speed.
    fn set_baud(&self, _baud: u32) {}
    /// Modem control (DTR/RTS); bit meanings are driver-specific.
    fn modem(&self, _bits: u32) -> Result<u32, Errno> {
        Err(Errno::ENOTSUP)
    }
}

/// A bounded output queue sized from the baud rate.
struct TtyQueue {
    data: VecDeque<u8>,
    cap: usize,
}

impl TtyQueue {
    fn new(cap: usize) -> Self {
        Self { data: VecDeque::new(), cap }
    }

    fn resize(&mut self, cap: usize) {
        self.cap = cap.max(16);
        while self.data.len() > self.cap {
            self.data.pop_front();
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.data.len() >= self.cap {
            return false;
        }
        self.data.push_back(byte);
        true
    }
}

/// A terminal.
pub struct Tty {
    /// Serializes driver-facing entry points; recursive because echo
    /// paths re-enter.
    pub lock: Mutex<()>,
    ldisc: SpinMutex<LineDiscipline>,
    output: SpinMutex<TtyQueue>,
    termios: SpinMutex<Termios>,
    winsize: SpinMutex<WinSize>,
    /// Foreground process group (job control).
    fg_pgrp: SpinMutex<Option<u32>>,
    /// Owning session.
    session: SpinMutex<Option<u32>>,
    driver: SpinMutex<Option<Arc<dyn TtyDriver>>>,
    readers: WaitQueue,
    open_count: SpinMutex<u32>,
}

impl Tty {
    /// Creates a terminal with default settings.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let termios = Termios::default();
        Arc::new(Self {
            lock: Mutex::named("tty", ()),
            ldisc: SpinMutex::named("tty_ldisc", LineDiscipline::new()),
            output: SpinMutex::named("tty_out", TtyQueue::new(queue_cap(termios.baud))),
            termios: SpinMutex::new(termios),
            winsize: SpinMutex::new(WinSize { rows: 25, cols: 80 }),
            fg_pgrp: SpinMutex::new(None),
            session: SpinMutex::new(None),
            driver: SpinMutex::new(None),
            readers: WaitQueue::new(),
            open_count: SpinMutex::new(0),
        })
    }

    /// Binds the hardware driver.
    pub fn set_driver(&self, driver: Arc<dyn TtyDriver>) {
        *self.driver.lock() = Some(driver);
    }

    /// Driver-facing open.
    pub fn open(&self) {
        let _guard = self.lock.lock();
        *self.open_count.lock() += 1;
    }

    /// Driver-facing close.
    pub fn close(&self) {
        let _guard = self.lock.lock();
        let mut count = self.open_count.lock();
        *count = count.saturating_sub(1);
    }

    /// Applies new terminal settings; a baud change resizes the queues
    /// to `speed / 10` bytes.
    pub fn configure(&self, termios: Termios) {
        let _guard = self.lock.lock();
        let old_baud = self.termios.lock().baud;
        self.ldisc.lock().set_canonical(termios.canonical);
        if termios.baud != old_baud {
            self.output.lock().resize(queue_cap(termios.baud));
            if let Some(driver) = self.driver.lock().clone() {
                driver.set_baud(termios.baud);
            }
        }
        *self.termios.lock() = termios;
    }

    /// Current settings.
    #[must_use]
    pub fn termios(&self) -> Termios {
        *self.termios.lock()
    }

    /// Job control: assigns the foreground pgroup.
    pub fn set_foreground(&self, pgid: u32) {
        *self.fg_pgrp.lock() = Some(pgid);
    }

    /// The foreground pgroup.
    #[must_use]
    pub fn foreground(&self) -> Option<u32> {
        *self.fg_pgrp.lock()
    }

    /// Binds the owning session.
    pub fn set_session(&self, sid: u32) {
        *self.session.lock() = Some(sid);
    }

    /// Updates the window size, signalling the foreground pgroup.
    pub fn set_winsize(&self, size: WinSize) {
        *self.winsize.lock() = size;
        self.signal_pgrp(SIGWINCH);
    }

    /// Sends a signal to the foreground pgroup.
    pub fn signal_pgrp(&self, signo: i32) {
        if let Some(pgid) = self.foreground()
            && let Some(pgroup) = crate::proc::lookup_pgroup(pgid)
        {
            pgroup.signal_all(signo);
        }
    }

    /// Feeds one input byte from the driver (interrupt context).
    ///
    /// Cooks the byte through the line discipline, echoes when enabled,
    /// and converts special characters into foreground-pgroup signals.
    pub fn input_byte(&self, byte: u8) {
        let termios = *self.termios.lock();
        let action = self.ldisc.lock().input(byte);

        match action {
            LdiscAction::Interrupt if termios.isig => {
                self.echo_bytes(b"^C\n", termios.echo);
                self.signal_pgrp(SIGINT);
            }
            LdiscAction::Suspend if termios.isig => {
                self.echo_bytes(b"^Z\n", termios.echo);
                self.signal_pgrp(SIGTSTP);
            }
            LdiscAction::Backspace => {
                self.echo_bytes(&[0x08, b' ', 0x08], termios.echo);
            }
            LdiscAction::Newline => {
                self.echo_bytes(b"\n", termios.echo);
                self.readers.wake_all();
            }
            LdiscAction::Echo(b) => {
                self.echo_bytes(&[b], termios.echo);
                if !termios.canonical {
                    self.readers.wake_all();
                }
            }
            LdiscAction::Eof | LdiscAction::FlushLine => {
                self.readers.wake_all();
            }
            _ => {}
        }
    }

    fn echo_bytes(&self, bytes: &[u8], echo: bool) {
        if !echo {
            return;
        }
        let driver = self.driver.lock().clone();
        let mut output = self.output.lock();
        for &b in bytes {
            match &driver {
                // With a live driver the echo goes straight out.
                Some(driver) => driver.write_byte(b),
                // Otherwise it queues until one is bound.
                None => {
                    let _ = output.push(b);
                }
            }
        }
    }

    /// Blocking read of cooked input.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        loop {
            {
                let mut ldisc = self.ldisc.lock();
                if ldisc.readable() {
                    return Ok(ldisc.drain(buf));
                }
            }
            match self.readers.wait_sig("tty_read") {
                crate::sync::WaitResult::Interrupted => return Err(Errno::EINTR),
                _ => {
                    #[cfg(not(target_os = "none"))]
                    {
                        // Host builds cannot block.
                        if !self.ldisc.lock().readable() {
                            return Err(Errno::EAGAIN);
                        }
                    }
                }
            }
        }
    }

    /// Writes bytes to the output device.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        let _guard = self.lock.lock();
        let driver = self.driver.lock().clone();
        let Some(driver) = driver else {
            return Err(Errno::ENXIO);
        };
        for &b in buf {
            if b == b'\n' {
                driver.write_byte(b'\r');
            }
            driver.write_byte(b);
        }
        Ok(buf.len())
    }

    /// Terminal control requests.
    pub fn ioctl(&self, request: u32, arg: usize) -> Result<usize, Errno> {
        let _guard = self.lock.lock();
        match request {
            TIOCGWINSZ => {
                let size = *self.winsize.lock();
                Ok((u64::from(size.rows) << 16 | u64::from(size.cols)) as usize)
            }
            TIOCSPGRP => {
                self.set_foreground(arg as u32);
                Ok(0)
            }
            TIOCGPGRP => Ok(self.foreground().unwrap_or(0) as usize),
            _ => Err(Errno::ENOTTY),
        }
    }

    /// Modem control passthrough.
    pub fn modem(&self, bits: u32) -> Result<u32, Errno> {
        let _guard = self.lock.lock();
        let driver = self.driver.lock().clone();
        driver.ok_or(Errno::ENXIO)?.modem(bits)
    }
}

/// Queue capacity for a baud rate: `speed / 10` bytes.
fn queue_cap(baud: u32) -> usize {
    (baud / 10) as usize
}
