//! Flag and mode constants shared across the syscall boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const O_WRONLY = 0o1;
        /// Open for reading and writing.
        const O_RDWR = 0o2;
        /// Create the file if it does not exist.
        const O_CREAT = 0o100;
        /// With `O_CREAT`, fail if the file already exists.
        const O_EXCL = 0o200;
        /// Truncate to zero length on open.
        const O_TRUNC = 0o1000;
        /// All writes append.
        const O_APPEND = 0o2000;
        /// Non-blocking I/O.
        const O_NONBLOCK = 0o4000;
        /// Fail unless the path names a directory.
        const O_DIRECTORY = 0o200000;
        /// Fail with `ELOOP` if the final component is a symlink.
        const O_NOFOLLOW = 0o400000;
        /// Close the descriptor across `exec`.
        const O_CLOEXEC = 0o2000000;
    }
}

impl OpenFlags {
    /// `O_RDONLY` is the absence of `O_WRONLY | O_RDWR`.
    pub const O_RDONLY: OpenFlags = OpenFlags::empty();

    /// Whether the flags permit reading.
    #[must_use]
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::O_WRONLY) || self.contains(OpenFlags::O_RDWR)
    }

    /// Whether the flags permit writing.
    #[must_use]
    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

bitflags! {
    /// Memory protection bits for `mmap`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Readable.
        const READ = 0x1;
        /// Writable.
        const WRITE = 0x2;
        /// Executable.
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping kind bits for `mmap`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Changes are shared.
        const SHARED = 0x01;
        /// Changes are private (copy-on-write).
        const PRIVATE = 0x02;
        /// Place the mapping at exactly the given address.
        const FIXED = 0x10;
        /// Not backed by a file.
        const ANON = 0x20;
        /// Mapping is a stack: grows down with a guard page.
        const STACK = 0x20000;
    }
}

// ── File mode bits ──────────────────────────────────────────────────

/// Mask covering the file type bits of `st_mode`.
pub const S_IFMT: u32 = 0xF000;
/// FIFO.
pub const S_IFIFO: u32 = 0x1000;
/// Character device.
pub const S_IFCHR: u32 = 0x2000;
/// Directory.
pub const S_IFDIR: u32 = 0x4000;
/// Block device.
pub const S_IFBLK: u32 = 0x6000;
/// Regular file.
pub const S_IFREG: u32 = 0x8000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0xA000;
/// Socket.
pub const S_IFSOCK: u32 = 0xC000;

// ── Directory entry types (DT_*) ────────────────────────────────────

/// Unknown entry type.
pub const DT_UNKNOWN: u8 = 0;
/// FIFO.
pub const DT_FIFO: u8 = 1;
/// Character device.
pub const DT_CHR: u8 = 2;
/// Directory.
pub const DT_DIR: u8 = 4;
/// Block device.
pub const DT_BLK: u8 = 6;
/// Regular file.
pub const DT_REG: u8 = 8;
/// Symbolic link.
pub const DT_LNK: u8 = 10;
/// Socket.
pub const DT_SOCK: u8 = 12;

// ── lseek whence ────────────────────────────────────────────────────

/// Seek from the start of the file.
pub const SEEK_SET: u32 = 0;
/// Seek relative to the current offset.
pub const SEEK_CUR: u32 = 1;
/// Seek relative to the end of the file.
pub const SEEK_END: u32 = 2;

// ── fcntl commands ──────────────────────────────────────────────────

/// Duplicate a descriptor onto the lowest free slot ≥ arg.
pub const F_DUPFD: u32 = 0;
/// Get descriptor flags.
pub const F_GETFD: u32 = 1;
/// Set descriptor flags.
pub const F_SETFD: u32 = 2;
/// Get open-file status flags.
pub const F_GETFL: u32 = 3;
/// Set open-file status flags.
pub const F_SETFL: u32 = 4;

// ── ioctl requests (kernel-defined namespace) ───────────────────────

/// Create a kqueue endpoint on the ioctl'd descriptor's process.
pub const IOCTL_KQUEUE_CREATE: u32 = 0x4B00;
/// Register/modify/fetch kevents: arg points to a `KeventIoc`.
pub const IOCTL_KQUEUE_CTL: u32 = 0x4B01;
/// Get the terminal window size.
pub const TIOCGWINSZ: u32 = 0x5413;
/// Set the foreground process group.
pub const TIOCSPGRP: u32 = 0x5410;
/// Get the foreground process group.
pub const TIOCGPGRP: u32 = 0x540F;

// ── poll events ─────────────────────────────────────────────────────

/// Data may be read without blocking.
pub const POLLIN: u16 = 0x001;
/// Data may be written without blocking.
pub const POLLOUT: u16 = 0x004;
/// An error occurred.
pub const POLLERR: u16 = 0x008;
/// The peer hung up.
pub const POLLHUP: u16 = 0x010;
