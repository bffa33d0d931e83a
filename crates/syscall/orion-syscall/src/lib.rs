//! The Orion user↔kernel ABI.
//!
//! Everything that crosses the syscall boundary is defined here so the
//! kernel and userspace libraries agree on a single source of truth:
//! syscall numbers, the [`Errno`] namespace, wire structs ([`Stat`],
//! [`Kevent`], [`SigInfo`], [`TimeSpec`]), flag constants, and the
//! [`SyscallHandler`] trait the kernel implements together with the
//! [`dispatch`] function its entry stub calls.
//!
//! Register convention (x86-64 `syscall` instruction): call number in RAX,
//! arguments in RDI, RSI, RDX, R8, R9, R10, return value in RAX. Errors are
//! negative errno values.

#![no_std]
#![warn(missing_docs)]

mod errno;
pub mod flags;
pub mod kevent;
pub mod nr;
pub mod signal;
mod types;

pub use errno::{ERRNO_MAX, Errno, Result as SysResult};
pub use types::{DirEntHeader, Stat, TimeSpec, TimeVal};

#[cfg(feature = "kernel")]
mod dispatch;
#[cfg(feature = "kernel")]
pub use dispatch::{SyscallHandler, dispatch};

/// Maximum length of a single path component, excluding the terminator.
pub const NAME_MAX: usize = 255;

/// Maximum length of a path, including the terminator.
pub const PATH_MAX: usize = 4096;

/// Maximum number of open file descriptors per process.
pub const MAX_FILES: usize = 1024;
