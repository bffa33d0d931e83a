//! Line discipline: canonical-mode input cooking.
//!
//! Processes raw input bytes into completed lines (canonical mode) or a
//! pass-through stream (raw mode), producing [`LdiscAction`] events the
//! owning [`super::Tty`] interprets: echo, line commits, and the special
//! characters that turn into foreground-pgroup signals.

use planck_noalloc::ringbuf::RingBuf;

/// Maximum line length for canonical editing.
const LINE_BUF_SIZE: usize = 256;

/// Backing size of the ready-byte ring (usable capacity is SIZE - 1).
const READY_BUF_SIZE: usize = 4096;

/// ASCII control characters the discipline interprets.
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const CTRL_Z: u8 = 0x1A;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

/// What the caller should do with one processed input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdiscAction {
    /// Nothing visible (byte buffered).
    Buffered,
    /// Erase one character: cursor back, space, cursor back.
    Backspace,
    /// Echo a newline; a completed line is ready for readers.
    Newline,
    /// Echo a single printable character.
    Echo(u8),
    /// Ctrl+C: discard the line, send `SIGINT` to the foreground pgroup.
    Interrupt,
    /// Ctrl+Z: send `SIGTSTP` to the foreground pgroup.
    Suspend,
    /// Ctrl+D on an empty line: EOF for the next read.
    Eof,
    /// Ctrl+D on a non-empty line: flush it without a newline.
    FlushLine,
}

/// Canonical/raw input cooking state.
pub struct LineDiscipline {
    /// Completed bytes ready for userspace reads.
    ready: RingBuf<u8, READY_BUF_SIZE>,
    /// The line being edited (canonical mode).
    line: [u8; LINE_BUF_SIZE],
    line_len: usize,
    canonical: bool,
    /// An EOF is pending for the next read.
    eof_pending: bool,
}

impl LineDiscipline {
    /// Creates a canonical-mode discipline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ready: RingBuf::new(),
            line: [0; LINE_BUF_SIZE],
            line_len: 0,
            canonical: true,
            eof_pending: false,
        }
    }

    /// Switches between canonical and raw mode, flushing the edit line.
    pub fn set_canonical(&mut self, canonical: bool) {
        if !canonical {
            self.commit_line();
        }
        self.canonical = canonical;
    }

    /// Whether canonical mode is active.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.canonical
    }

    /// Bytes ready for reading.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Processes one raw input byte.
    pub fn input(&mut self, byte: u8) -> LdiscAction {
        if !self.canonical {
            self.ready.push(byte);
            return LdiscAction::Echo(byte);
        }

        match byte {
            CTRL_C => {
                self.line_len = 0;
                LdiscAction::Interrupt
            }
            CTRL_Z => LdiscAction::Suspend,
            CTRL_D => {
                if self.line_len == 0 {
                    self.eof_pending = true;
                    LdiscAction::Eof
                } else {
                    self.commit_line();
                    LdiscAction::FlushLine
                }
            }
            BACKSPACE | DELETE => {
                if self.line_len > 0 {
                    self.line_len -= 1;
                    LdiscAction::Backspace
                } else {
                    LdiscAction::Buffered
                }
            }
            b'\r' | b'\n' => {
                self.commit_line();
                self.ready.push(b'\n');
                LdiscAction::Newline
            }
            _ => {
                if self.line_len < LINE_BUF_SIZE {
                    self.line[self.line_len] = byte;
                    self.line_len += 1;
                    LdiscAction::Echo(byte)
                } else {
                    LdiscAction::Buffered
                }
            }
        }
    }

    /// Moves the edit line into the ready buffer.
    fn commit_line(&mut self) {
        for i in 0..self.line_len {
            self.ready.push(self.line[i]);
        }
        self.line_len = 0;
    }

    /// Pulls cooked bytes for a read.
    ///
    /// Canonical mode only returns bytes once a line is complete (the
    /// edit line stays private). Returns 0 with a pending EOF consumed.
    pub fn drain(&mut self, buf: &mut [u8]) -> usize {
        if self.eof_pending && self.ready.is_empty() {
            self.eof_pending = false;
            return 0;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.ready.pop() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Whether a read would make progress (data ready or EOF pending).
    #[must_use]
    pub fn readable(&self) -> bool {
        !self.ready.is_empty() || self.eof_pending
    }
}

impl Default for LineDiscipline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ldisc: &mut LineDiscipline, bytes: &[u8]) {
        for &b in bytes {
            ldisc.input(b);
        }
    }

    #[test]
    fn canonical_line_assembly() {
        let mut ldisc = LineDiscipline::new();
        feed(&mut ldisc, b"hello");
        // The edit line is not readable until committed.
        assert!(!ldisc.readable());

        assert_eq!(ldisc.input(b'\n'), LdiscAction::Newline);
        assert!(ldisc.readable());
        let mut buf = [0u8; 16];
        assert_eq!(ldisc.drain(&mut buf), 6);
        assert_eq!(&buf[..6], b"hello\n");
    }

    #[test]
    fn backspace_erases() {
        let mut ldisc = LineDiscipline::new();
        feed(&mut ldisc, b"helpo");
        assert_eq!(ldisc.input(0x7F), LdiscAction::Backspace);
        assert_eq!(ldisc.input(0x7F), LdiscAction::Backspace);
        feed(&mut ldisc, b"lo\n");
        let mut buf = [0u8; 16];
        assert_eq!(ldisc.drain(&mut buf), 6);
        assert_eq!(&buf[..6], b"hello\n");
        // Backspace on an empty line does nothing.
        assert_eq!(ldisc.input(0x08), LdiscAction::Buffered);
    }

    #[test]
    fn ctrl_c_discards_line() {
        let mut ldisc = LineDiscipline::new();
        feed(&mut ldisc, b"doomed");
        assert_eq!(ldisc.input(0x03), LdiscAction::Interrupt);
        ldisc.input(b'\n');
        let mut buf = [0u8; 16];
        // Only the newline survives.
        assert_eq!(ldisc.drain(&mut buf), 1);
        assert_eq!(buf[0], b'\n');
    }

    #[test]
    fn ctrl_d_eof_and_flush() {
        let mut ldisc = LineDiscipline::new();
        // Empty line: EOF pending, drain reports 0 once.
        assert_eq!(ldisc.input(0x04), LdiscAction::Eof);
        assert!(ldisc.readable());
        let mut buf = [0u8; 4];
        assert_eq!(ldisc.drain(&mut buf), 0);
        assert!(!ldisc.readable());

        // Non-empty line: flushed without a newline.
        feed(&mut ldisc, b"ab");
        assert_eq!(ldisc.input(0x04), LdiscAction::FlushLine);
        assert_eq!(ldisc.drain(&mut buf), 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn raw_mode_passes_through() {
        let mut ldisc = LineDiscipline::new();
        ldisc.set_canonical(false);
        assert_eq!(ldisc.input(0x03), LdiscAction::Echo(0x03));
        assert!(ldisc.readable());
        let mut buf = [0u8; 4];
        assert_eq!(ldisc.drain(&mut buf), 1);
        assert_eq!(buf[0], 0x03);
    }

    #[test]
    fn suspend_action() {
        let mut ldisc = LineDiscipline::new();
        assert_eq!(ldisc.input(0x1A), LdiscAction::Suspend);
    }
}
