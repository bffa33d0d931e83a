//! Syscall dispatch.
//!
//! Implements the [`SyscallHandler`] trait from `orion-syscall` and
//! routes each call to its area module. Pointer arguments arrive as raw
//! `usize` values and go through [`userptr`] before any use. Internal
//! errors become negative errnos unchanged; pending signals are
//! delivered by the arch layer on the way back to user mode.

mod memory;
mod process;
mod time;
pub mod userptr;
mod vfs;

extern crate alloc;

use alloc::sync::Arc;

use orion_syscall::flags::OpenFlags;
use orion_syscall::{Errno, SyscallHandler, dispatch};

use crate::fs::{Resolved, VrFlags, Ventry};

/// Converts a `Result` into the RAX return convention.
fn ret(result: Result<isize, Errno>) -> isize {
    match result {
        Ok(v) => v,
        Err(e) => e.as_neg(),
    }
}

/// Resolution base: the process working directory, or the root.
fn resolve_base() -> Result<Arc<Ventry>, Errno> {
    if let Some(proc) = crate::sched::current_process()
        && let Some(cwd) = proc.cwd.lock().clone()
    {
        return Ok(cwd);
    }
    crate::fs::vfs::root_ventry().ok_or(Errno::ENOENT)
}

/// Resolves a user path with the given flags.
fn resolve_user_path(path_addr: usize, flags: VrFlags) -> Result<Resolved, Errno> {
    let path = userptr::read_cstring(path_addr)?;
    let base = resolve_base()?;
    crate::fs::vresolve(&base, &path, flags)
}

/// Resolves a user path that must exist.
fn resolve_existing(path_addr: usize, flags: VrFlags) -> Result<Arc<Ventry>, Errno> {
    match resolve_user_path(path_addr, flags)? {
        Resolved::Found(ve) => Ok(ve),
        Resolved::Parent { .. } => Err(Errno::ENOENT),
    }
}

/// The kernel's syscall handler.
struct OrionDispatch;

impl SyscallHandler for OrionDispatch {
    fn sys_exit(&self, status: usize) -> isize {
        process::sys_exit(status)
    }

    fn sys_exec(&self, path: usize, argv: usize, envp: usize) -> isize {
        ret(process::sys_exec(path, argv, envp))
    }

    fn sys_open(&self, path: usize, flags: usize, mode: usize) -> isize {
        ret(vfs::sys_open(path, flags, mode))
    }

    fn sys_close(&self, fd: usize) -> isize {
        ret(vfs::sys_close(fd))
    }

    fn sys_read(&self, fd: usize, buf: usize, len: usize) -> isize {
        ret(vfs::sys_read(fd, buf, len))
    }

    fn sys_write(&self, fd: usize, buf: usize, len: usize) -> isize {
        ret(vfs::sys_write(fd, buf, len))
    }

    fn sys_poll(&self, fds: usize, nfds: usize, timeout_ms: usize) -> isize {
        ret(vfs::sys_poll(fds, nfds, timeout_ms))
    }

    fn sys_lseek(&self, fd: usize, offset: usize, whence: usize) -> isize {
        ret(vfs::sys_lseek(fd, offset, whence))
    }

    fn sys_fcntl(&self, fd: usize, cmd: usize, arg: usize) -> isize {
        ret(vfs::sys_fcntl(fd, cmd, arg))
    }

    fn sys_create(&self, path: usize, mode: usize) -> isize {
        ret(vfs::sys_create(path, mode))
    }

    fn sys_mknod(&self, path: usize, mode: usize, dev: usize) -> isize {
        ret(vfs::sys_mknod(path, mode, dev))
    }

    fn sys_mkdir(&self, path: usize, mode: usize) -> isize {
        ret(vfs::sys_mkdir(path, mode))
    }

    fn sys_link(&self, oldpath: usize, newpath: usize) -> isize {
        ret(vfs::sys_link(oldpath, newpath))
    }

    fn sys_unlink(&self, path: usize) -> isize {
        ret(vfs::sys_unlink(path))
    }

    fn sys_symlink(&self, target: usize, linkpath: usize) -> isize {
        ret(vfs::sys_symlink(target, linkpath))
    }

    fn sys_rename(&self, oldpath: usize, newpath: usize) -> isize {
        ret(vfs::sys_rename(oldpath, newpath))
    }

    fn sys_readlink(&self, path: usize, buf: usize, len: usize) -> isize {
        ret(vfs::sys_readlink(path, buf, len))
    }

    fn sys_readdir(&self, fd: usize, buf: usize, len: usize) -> isize {
        ret(vfs::sys_readdir(fd, buf, len))
    }

    fn sys_telldir(&self, fd: usize) -> isize {
        ret(vfs::sys_telldir(fd))
    }

    fn sys_seekdir(&self, fd: usize, cookie: usize) -> isize {
        ret(vfs::sys_seekdir(fd, cookie))
    }

    fn sys_rewinddir(&self, fd: usize) -> isize {
        ret(vfs::sys_rewinddir(fd))
    }

    fn sys_rmdir(&self, path: usize) -> isize {
        ret(vfs::sys_rmdir(path))
    }

    fn sys_chdir(&self, path: usize) -> isize {
        ret(vfs::sys_chdir(path))
    }

    fn sys_chmod(&self, path: usize, mode: usize) -> isize {
        ret(vfs::sys_chmod(path, mode))
    }

    fn sys_stat(&self, path: usize, statbuf: usize) -> isize {
        ret(vfs::sys_stat(path, statbuf))
    }

    fn sys_fstat(&self, fd: usize, statbuf: usize) -> isize {
        ret(vfs::sys_fstat(fd, statbuf))
    }

    fn sys_sleep(&self, seconds: usize) -> isize {
        ret(time::sys_sleep(seconds))
    }

    fn sys_nanosleep(&self, req: usize, rem: usize) -> isize {
        ret(time::sys_nanosleep(req, rem))
    }

    fn sys_yield(&self) -> isize {
        crate::sched::yield_now();
        0
    }

    fn sys_getpid(&self) -> isize {
        ret(process::sys_getpid())
    }

    fn sys_getppid(&self) -> isize {
        ret(process::sys_getppid())
    }

    fn sys_gettid(&self) -> isize {
        ret(process::sys_gettid())
    }

    fn sys_getuid(&self) -> isize {
        ret(process::sys_getuid())
    }

    fn sys_getgid(&self) -> isize {
        ret(process::sys_getgid())
    }

    fn sys_getcwd(&self, buf: usize, len: usize) -> isize {
        ret(process::sys_getcwd(buf, len))
    }

    fn sys_mmap(
        &self,
        addr: usize,
        len: usize,
        prot: usize,
        flags: usize,
        fd: usize,
        offset: usize,
    ) -> isize {
        ret(memory::sys_mmap(addr, len, prot, flags, fd, offset))
    }

    fn sys_munmap(&self, addr: usize, len: usize) -> isize {
        ret(memory::sys_munmap(addr, len))
    }

    fn sys_fork(&self) -> isize {
        ret(process::sys_fork())
    }

    fn sys_pread(&self, fd: usize, buf: usize, len: usize, offset: usize) -> isize {
        ret(vfs::sys_pread(fd, buf, len, offset))
    }

    fn sys_pwrite(&self, fd: usize, buf: usize, len: usize, offset: usize) -> isize {
        ret(vfs::sys_pwrite(fd, buf, len, offset))
    }

    fn sys_ioctl(&self, fd: usize, request: usize, arg: usize) -> isize {
        ret(vfs::sys_ioctl(fd, request, arg))
    }

    fn sys_set_fs_base(&self, addr: usize) -> isize {
        ret(process::sys_set_fs_base(addr))
    }

    fn sys_panic(&self, msg: usize) -> isize {
        let text = userptr::read_cstring(msg).unwrap_or_default();
        panic!("user panic: {text}");
    }

    fn sys_log(&self, buf: usize, len: usize) -> isize {
        ret(sys_log(buf, len))
    }

    fn sys_kill(&self, pid: usize, signo: usize) -> isize {
        ret(process::sys_kill(pid, signo))
    }

    fn sys_signal(&self, signo: usize, handler: usize) -> isize {
        ret(process::sys_signal(signo, handler))
    }

    fn sys_sigaction(&self, signo: usize, act: usize, oldact: usize) -> isize {
        ret(process::sys_sigaction(signo, act, oldact))
    }

    fn sys_clock_gettime(&self, clock_id: usize, tp: usize) -> isize {
        ret(time::sys_clock_gettime(clock_id, tp))
    }

    fn sys_clock_getres(&self, clock_id: usize, res: usize) -> isize {
        ret(time::sys_clock_getres(clock_id, res))
    }
}

/// Writes a user message to the kernel log.
fn sys_log(buf: usize, len: usize) -> Result<isize, Errno> {
    if len > 4096 {
        return Err(Errno::EMSGSIZE);
    }
    let bytes = userptr::copy_in(buf, len)?;
    let text = core::str::from_utf8(&bytes).map_err(|_| Errno::EILSEQ)?;
    crate::kinfo!("[user] {}", text.trim_end());
    Ok(len as isize)
}

static DISPATCH: OrionDispatch = OrionDispatch;

/// Syscall entry, called from the arch `syscall` stub with the raw
/// register values.
#[unsafe(no_mangle)]
pub extern "C" fn syscall_dispatch(
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    dispatch(&DISPATCH, nr, a0, a1, a2, a3, a4, a5)
}

/// Opens a file object onto the current process's fd table.
fn install_file(file: Arc<crate::fs::File>) -> Result<isize, Errno> {
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let fd = proc.ftable.add_file(file)?;
    Ok(fd as isize)
}

/// Looks up an fd in the current process.
fn current_file(fd: usize) -> Result<Arc<crate::fs::File>, Errno> {
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    proc.ftable.get(fd as i32)
}

/// Builds `VrFlags` for an `open`-style call.
fn vr_flags_for_open(flags: OpenFlags) -> VrFlags {
    let mut vr = VrFlags::empty();
    if flags.contains(OpenFlags::O_NOFOLLOW) {
        vr |= VrFlags::NOFOLLOW;
    }
    if flags.contains(OpenFlags::O_DIRECTORY) {
        vr |= VrFlags::DIR;
    }
    vr
}
