//! Syscall numbers.
//!
//! The call number goes in RAX. Numbers are stable ABI and never reused.

/// Terminate the calling process.
pub const SYS_EXIT: usize = 0;
/// Replace the process image.
pub const SYS_EXEC: usize = 1;
/// Open a file.
pub const SYS_OPEN: usize = 2;
/// Close a file descriptor.
pub const SYS_CLOSE: usize = 3;
/// Read from a file descriptor.
pub const SYS_READ: usize = 4;
/// Write to a file descriptor.
pub const SYS_WRITE: usize = 5;
/// Wait for events on file descriptors.
pub const SYS_POLL: usize = 6;
/// Reposition a file offset.
pub const SYS_LSEEK: usize = 7;
/// File descriptor control.
pub const SYS_FCNTL: usize = 8;
/// Create a regular file.
pub const SYS_CREATE: usize = 9;
/// Create a device node.
pub const SYS_MKNOD: usize = 10;
/// Create a directory.
pub const SYS_MKDIR: usize = 11;
/// Create a hard link.
pub const SYS_LINK: usize = 12;
/// Remove a directory entry.
pub const SYS_UNLINK: usize = 13;
/// Create a symbolic link.
pub const SYS_SYMLINK: usize = 14;
/// Rename a directory entry.
pub const SYS_RENAME: usize = 15;
/// Read a symbolic link target.
pub const SYS_READLINK: usize = 16;
/// Read directory entries.
pub const SYS_READDIR: usize = 17;
/// Report the current directory-stream position.
pub const SYS_TELLDIR: usize = 18;
/// Set the directory-stream position.
pub const SYS_SEEKDIR: usize = 19;
/// Rewind a directory stream.
pub const SYS_REWINDDIR: usize = 20;
/// Remove an empty directory.
pub const SYS_RMDIR: usize = 21;
/// Change the working directory.
pub const SYS_CHDIR: usize = 22;
/// Change file mode bits.
pub const SYS_CHMOD: usize = 23;
/// Stat by path.
pub const SYS_STAT: usize = 24;
/// Stat by file descriptor.
pub const SYS_FSTAT: usize = 25;
/// Sleep for whole seconds.
pub const SYS_SLEEP: usize = 26;
/// Sleep with nanosecond resolution.
pub const SYS_NANOSLEEP: usize = 27;
/// Yield the CPU.
pub const SYS_YIELD: usize = 28;
/// Get the process id.
pub const SYS_GETPID: usize = 29;
/// Get the parent process id.
pub const SYS_GETPPID: usize = 30;
/// Get the thread id.
pub const SYS_GETTID: usize = 31;
/// Get the real user id.
pub const SYS_GETUID: usize = 32;
/// Get the real group id.
pub const SYS_GETGID: usize = 33;
/// Get the working directory path.
pub const SYS_GETCWD: usize = 34;
/// Map memory.
pub const SYS_MMAP: usize = 35;
/// Unmap memory.
pub const SYS_MUNMAP: usize = 36;
/// Duplicate the calling process.
pub const SYS_FORK: usize = 37;
/// Positioned read.
pub const SYS_PREAD: usize = 38;
/// Positioned write.
pub const SYS_PWRITE: usize = 39;
/// Device control.
pub const SYS_IOCTL: usize = 40;
/// Set the FS segment base (TLS).
pub const SYS_SET_FS_BASE: usize = 41;
/// Panic the kernel with a user-supplied message (debug builds).
pub const SYS_PANIC: usize = 42;
/// Write a message to the kernel log.
pub const SYS_LOG: usize = 43;
/// Send a signal to a process.
pub const SYS_KILL: usize = 44;
/// Install a simple signal handler.
pub const SYS_SIGNAL: usize = 45;
/// Examine or change a signal action.
pub const SYS_SIGACTION: usize = 46;
/// Read a clock.
pub const SYS_CLOCK_GETTIME: usize = 47;
/// Report a clock's resolution.
pub const SYS_CLOCK_GETRES: usize = 48;

/// One past the highest assigned syscall number.
pub const SYS_MAX: usize = 49;
