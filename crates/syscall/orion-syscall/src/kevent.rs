//! Kqueue wire format.
//!
//! Identical semantics to BSD kqueue for the filters Orion implements.
//! The kqueue endpoint is created and driven through `ioctl` (see
//! [`crate::flags::IOCTL_KQUEUE_CREATE`]).

/// A single event registration or report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Kevent {
    /// Identifier for the event (fd, pid, signal number, timer id).
    pub ident: usize,
    /// Filter selecting the event class (`EVFILT_*`, negative).
    pub filter: i16,
    /// Action flags (`EV_*`).
    pub flags: u16,
    /// Filter-specific flags (`NOTE_*`).
    pub fflags: u32,
    /// Filter-specific data (bytes readable, exit status, …).
    pub data: isize,
    /// Opaque user data passed through unchanged.
    pub udata: usize,
}

impl Kevent {
    /// The `EV_SET` initializer.
    #[must_use]
    pub const fn new(ident: usize, filter: i16, flags: u16, fflags: u32, data: isize, udata: usize) -> Self {
        Self { ident, filter, flags, fflags, data, udata }
    }
}

// ── Event filters ───────────────────────────────────────────────────

/// Descriptor readable.
pub const EVFILT_READ: i16 = -1;
/// Descriptor writable.
pub const EVFILT_WRITE: i16 = -2;
/// Vnode events.
pub const EVFILT_VNODE: i16 = -4;
/// Process events.
pub const EVFILT_PROC: i16 = -5;
/// Signal delivery.
pub const EVFILT_SIGNAL: i16 = -6;
/// Timers.
pub const EVFILT_TIMER: i16 = -7;
/// User-triggered events.
pub const EVFILT_USER: i16 = -11;

// ── Action flags ────────────────────────────────────────────────────

/// Add the event to the kqueue.
pub const EV_ADD: u16 = 0x0001;
/// Delete the event from the kqueue.
pub const EV_DELETE: u16 = 0x0002;
/// Enable the event.
pub const EV_ENABLE: u16 = 0x0004;
/// Disable the event (kept but not reported).
pub const EV_DISABLE: u16 = 0x0008;
/// Report only once, then delete.
pub const EV_ONESHOT: u16 = 0x0010;
/// Reset the event state after reporting.
pub const EV_CLEAR: u16 = 0x0020;
/// Force an immediate receipt with `EV_ERROR`.
pub const EV_RECEIPT: u16 = 0x0040;
/// Disable after reporting.
pub const EV_DISPATCH: u16 = 0x0080;
/// EOF detected (returned).
pub const EV_EOF: u16 = 0x8000;
/// Error; `data` holds the errno (returned).
pub const EV_ERROR: u16 = 0x4000;

// ── EVFILT_READ filter flags ────────────────────────────────────────

/// Use `data` as a low-water mark.
pub const NOTE_LOWAT: u32 = 0x0001;

// ── EVFILT_VNODE filter flags ───────────────────────────────────────

/// The vnode was removed.
pub const NOTE_DELETE: u32 = 0x0001;
/// The vnode was written.
pub const NOTE_WRITE: u32 = 0x0002;
/// The vnode grew.
pub const NOTE_EXTEND: u32 = 0x0004;
/// Attributes changed.
pub const NOTE_ATTRIB: u32 = 0x0008;
/// The link count changed.
pub const NOTE_LINK: u32 = 0x0010;
/// The vnode was renamed.
pub const NOTE_RENAME: u32 = 0x0020;

// ── EVFILT_PROC filter flags ────────────────────────────────────────

/// The process exited.
pub const NOTE_EXIT: u32 = 0x8000_0000;
/// The process forked.
pub const NOTE_FORK: u32 = 0x4000_0000;
/// The process exec'd.
pub const NOTE_EXEC: u32 = 0x2000_0000;

// ── EVFILT_TIMER filter flags ───────────────────────────────────────

/// `data` is in seconds.
pub const NOTE_SECONDS: u32 = 0x0000_0001;
/// `data` is in milliseconds (the default).
pub const NOTE_MSECONDS: u32 = 0x0000_0002;
/// `data` is in microseconds.
pub const NOTE_USECONDS: u32 = 0x0000_0004;
/// `data` is in nanoseconds.
pub const NOTE_NSECONDS: u32 = 0x0000_0008;

// ── EVFILT_USER filter flags ────────────────────────────────────────

/// Activate the event.
pub const NOTE_TRIGGER: u32 = 0x0100_0000;
/// Bitwise-AND `fflags`.
pub const NOTE_FFAND: u32 = 0x4000_0000;
/// Bitwise-OR `fflags`.
pub const NOTE_FFOR: u32 = 0x8000_0000;
/// Copy `fflags`.
pub const NOTE_FFCOPY: u32 = 0xC000_0000;
/// Mask selecting the `fflags` control mode.
pub const NOTE_FFCTRLMASK: u32 = 0xC000_0000;
/// Mask covering the user-defined `fflags` bits.
pub const NOTE_FFLAGSMASK: u32 = 0x00FF_FFFF;

/// Argument block for [`crate::flags::IOCTL_KQUEUE_CTL`].
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KeventIoc {
    /// Pointer to the changelist, or 0.
    pub changelist: usize,
    /// Number of changelist entries.
    pub nchanges: usize,
    /// Pointer to the output event buffer, or 0.
    pub eventlist: usize,
    /// Capacity of the output buffer in events.
    pub nevents: usize,
    /// Pointer to a `TimeSpec` timeout, or 0 to block indefinitely.
    pub timeout: usize,
}
