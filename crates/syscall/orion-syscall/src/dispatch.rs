//! Kernel-side syscall dispatch.
//!
//! The kernel implements [`SyscallHandler`] and its entry stub calls
//! [`dispatch`] with the raw register values. Pointer arguments arrive as
//! untrusted `usize` values; validation happens in the handler.

/// One method per syscall. Implemented by the kernel's dispatch object.
#[allow(missing_docs, reason = "methods mirror the documented numbers in `nr`")]
pub trait SyscallHandler {
    fn sys_exit(&self, status: usize) -> isize;
    fn sys_exec(&self, path: usize, argv: usize, envp: usize) -> isize;
    fn sys_open(&self, path: usize, flags: usize, mode: usize) -> isize;
    fn sys_close(&self, fd: usize) -> isize;
    fn sys_read(&self, fd: usize, buf: usize, len: usize) -> isize;
    fn sys_write(&self, fd: usize, buf: usize, len: usize) -> isize;
    fn sys_poll(&self, fds: usize, nfds: usize, timeout_ms: usize) -> isize;
    fn sys_lseek(&self, fd: usize, offset: usize, whence: usize) -> isize;
    fn sys_fcntl(&self, fd: usize, cmd: usize, arg: usize) -> isize;
    fn sys_create(&self, path: usize, mode: usize) -> isize;
    fn sys_mknod(&self, path: usize, mode: usize, dev: usize) -> isize;
    fn sys_mkdir(&self, path: usize, mode: usize) -> isize;
    fn sys_link(&self, oldpath: usize, newpath: usize) -> isize;
    fn sys_unlink(&self, path: usize) -> isize;
    fn sys_symlink(&self, target: usize, linkpath: usize) -> isize;
    fn sys_rename(&self, oldpath: usize, newpath: usize) -> isize;
    fn sys_readlink(&self, path: usize, buf: usize, len: usize) -> isize;
    fn sys_readdir(&self, fd: usize, buf: usize, len: usize) -> isize;
    fn sys_telldir(&self, fd: usize) -> isize;
    fn sys_seekdir(&self, fd: usize, cookie: usize) -> isize;
    fn sys_rewinddir(&self, fd: usize) -> isize;
    fn sys_rmdir(&self, path: usize) -> isize;
    fn sys_chdir(&self, path: usize) -> isize;
    fn sys_chmod(&self, path: usize, mode: usize) -> isize;
    fn sys_stat(&self, path: usize, statbuf: usize) -> isize;
    fn sys_fstat(&self, fd: usize, statbuf: usize) -> isize;
    fn sys_sleep(&self, seconds: usize) -> isize;
    fn sys_nanosleep(&self, req: usize, rem: usize) -> isize;
    fn sys_yield(&self) -> isize;
    fn sys_getpid(&self) -> isize;
    fn sys_getppid(&self) -> isize;
    fn sys_gettid(&self) -> isize;
    fn sys_getuid(&self) -> isize;
    fn sys_getgid(&self) -> isize;
    fn sys_getcwd(&self, buf: usize, len: usize) -> isize;
    fn sys_mmap(&self, addr: usize, len: usize, prot: usize, flags: usize, fd: usize, offset: usize) -> isize;
    fn sys_munmap(&self, addr: usize, len: usize) -> isize;
    fn sys_fork(&self) -> isize;
    fn sys_pread(&self, fd: usize, buf: usize, len: usize, offset: usize) -> isize;
    fn sys_pwrite(&self, fd: usize, buf: usize, len: usize, offset: usize) -> isize;
    fn sys_ioctl(&self, fd: usize, request: usize, arg: usize) -> isize;
    fn sys_set_fs_base(&self, addr: usize) -> isize;
    fn sys_panic(&self, msg: usize) -> isize;
    fn sys_log(&self, buf: usize, len: usize) -> isize;
    fn sys_kill(&self, pid: usize, signo: usize) -> isize;
    fn sys_signal(&self, signo: usize, handler: usize) -> isize;
    fn sys_sigaction(&self, signo: usize, act: usize, oldact: usize) -> isize;
    fn sys_clock_gettime(&self, clock_id: usize, tp: usize) -> isize;
    fn sys_clock_getres(&self, clock_id: usize, res: usize) -> isize;
}

/// Routes a raw syscall to the matching [`SyscallHandler`] method.
///
/// Unknown numbers return `-ENOSYS`.
#[allow(clippy::too_many_arguments, reason = "mirrors the register file")]
pub fn dispatch(
    h: &impl SyscallHandler,
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    use crate::nr::*;
    match nr {
        SYS_EXIT => h.sys_exit(a0),
        SYS_EXEC => h.sys_exec(a0, a1, a2),
        SYS_OPEN => h.sys_open(a0, a1, a2),
        SYS_CLOSE => h.sys_close(a0),
        SYS_READ => h.sys_read(a0, a1, a2),
        SYS_WRITE => h.sys_write(a0, a1, a2),
        SYS_POLL => h.sys_poll(a0, a1, a2),
        SYS_LSEEK => h.sys_lseek(a0, a1, a2),
        SYS_FCNTL => h.sys_fcntl(a0, a1, a2),
        SYS_CREATE => h.sys_create(a0, a1),
        SYS_MKNOD => h.sys_mknod(a0, a1, a2),
        SYS_MKDIR => h.sys_mkdir(a0, a1),
        SYS_LINK => h.sys_link(a0, a1),
        SYS_UNLINK => h.sys_unlink(a0),
        SYS_SYMLINK => h.sys_symlink(a0, a1),
        SYS_RENAME => h.sys_rename(a0, a1),
        SYS_READLINK => h.sys_readlink(a0, a1, a2),
        SYS_READDIR => h.sys_readdir(a0, a1, a2),
        SYS_TELLDIR => h.sys_telldir(a0),
        SYS_SEEKDIR => h.sys_seekdir(a0, a1),
        SYS_REWINDDIR => h.sys_rewinddir(a0),
        SYS_RMDIR => h.sys_rmdir(a0),
        SYS_CHDIR => h.sys_chdir(a0),
        SYS_CHMOD => h.sys_chmod(a0, a1),
        SYS_STAT => h.sys_stat(a0, a1),
        SYS_FSTAT => h.sys_fstat(a0, a1),
        SYS_SLEEP => h.sys_sleep(a0),
        SYS_NANOSLEEP => h.sys_nanosleep(a0, a1),
        SYS_YIELD => h.sys_yield(),
        SYS_GETPID => h.sys_getpid(),
        SYS_GETPPID => h.sys_getppid(),
        SYS_GETTID => h.sys_gettid(),
        SYS_GETUID => h.sys_getuid(),
        SYS_GETGID => h.sys_getgid(),
        SYS_GETCWD => h.sys_getcwd(a0, a1),
        SYS_MMAP => h.sys_mmap(a0, a1, a2, a3, a4, a5),
        SYS_MUNMAP => h.sys_munmap(a0, a1),
        SYS_FORK => h.sys_fork(),
        SYS_PREAD => h.sys_pread(a0, a1, a2, a3),
        SYS_PWRITE => h.sys_pwrite(a0, a1, a2, a3),
        SYS_IOCTL => h.sys_ioctl(a0, a1, a2),
        SYS_SET_FS_BASE => h.sys_set_fs_base(a0),
        SYS_PANIC => h.sys_panic(a0),
        SYS_LOG => h.sys_log(a0, a1),
        SYS_KILL => h.sys_kill(a0, a1),
        SYS_SIGNAL => h.sys_signal(a0, a1),
        SYS_SIGACTION => h.sys_sigaction(a0, a1, a2),
        SYS_CLOCK_GETTIME => h.sys_clock_gettime(a0, a1),
        SYS_CLOCK_GETRES => h.sys_clock_getres(a0, a1),
        _ => crate::Errno::ENOSYS.as_neg(),
    }
}
