//! Process syscalls.

extern crate alloc;

use alloc::vec::Vec;

use orion_syscall::Errno;
use orion_syscall::signal::{NSIG, SIG_ERR, SigAction};

use super::userptr;

pub fn sys_exit(status: usize) -> isize {
    #[cfg(target_os = "none")]
    {
        crate::proc::exit(status as i32);
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = status;
        Errno::ENOSYS.as_neg()
    }
}

pub fn sys_exec(path: usize, argv: usize, envp: usize) -> Result<isize, Errno> {
    let path = userptr::read_cstring(path)?;
    let argv = userptr::read_cstring_array(argv, 256)?;
    let envp = userptr::read_cstring_array(envp, 256)?;
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();

    let image = crate::proc::exec::exec_current(&path, &argv_refs, &envp_refs)?;

    #[cfg(target_os = "none")]
    {
        // Never returns: the thread resumes in the new image.
        crate::arch::x86_64::userspace::enter_image(&image);
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = image;
        Ok(0)
    }
}

pub fn sys_fork() -> Result<isize, Errno> {
    use crate::proc::ForkFlags;
    let child = crate::proc::fork(ForkFlags::COPY_FDS | ForkFlags::COPY_SIGACTS)?;
    // The parent sees the child pid; the child's thread was set up to
    // resume with rax = 0.
    Ok(child.pid as isize)
}

pub fn sys_getpid() -> Result<isize, Errno> {
    Ok(crate::sched::current_process().map_or(0, |p| p.pid) as isize)
}

pub fn sys_getppid() -> Result<isize, Errno> {
    Ok(crate::sched::current_process().map_or(0, |p| p.ppid()) as isize)
}

pub fn sys_gettid() -> Result<isize, Errno> {
    Ok(crate::sched::current_thread().map_or(0, |t| t.tid()) as isize)
}

pub fn sys_getuid() -> Result<isize, Errno> {
    Ok(crate::sched::current_process().map_or(0, |p| p.creds().uid) as isize)
}

pub fn sys_getgid() -> Result<isize, Errno> {
    Ok(crate::sched::current_process().map_or(0, |p| p.creds().gid) as isize)
}

pub fn sys_getcwd(buf: usize, len: usize) -> Result<isize, Errno> {
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let path = match proc.cwd.lock().clone() {
        Some(cwd) => cwd.abs_path(),
        None => alloc::string::String::from("/"),
    };
    let bytes = path.as_bytes();
    if bytes.len() + 1 > len {
        return Err(Errno::ERANGE);
    }
    userptr::copy_out(buf, bytes)?;
    userptr::copy_out(buf + bytes.len(), &[0u8])?;
    Ok(bytes.len() as isize)
}

pub fn sys_set_fs_base(addr: usize) -> Result<isize, Errno> {
    if !crate::addr::VirtAddr::new_truncate(addr as u64).is_user() {
        return Err(Errno::EINVAL);
    }
    #[cfg(target_os = "none")]
    {
        // SAFETY: FS base only affects user-mode segment addressing.
        unsafe {
            crate::arch::x86_64::msr::IA32_FS_BASE.write(addr as u64);
        }
    }
    Ok(0)
}

pub fn sys_kill(pid: usize, signo: usize) -> Result<isize, Errno> {
    if signo == 0 || signo >= NSIG {
        return Err(Errno::EINVAL);
    }
    crate::proc::signal::kill(pid as u32, signo as i32)?;
    Ok(0)
}

pub fn sys_signal(signo: usize, handler: usize) -> Result<isize, Errno> {
    if signo == 0 || signo >= NSIG {
        return Ok(SIG_ERR as isize);
    }
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let old = proc.signals.set_action(signo as i32, SigAction {
        sa_handler: handler,
        sa_flags: 0,
        sa_restorer: 0,
        sa_mask: 0,
    });
    Ok(old.sa_handler as isize)
}

pub fn sys_sigaction(signo: usize, act: usize, oldact: usize) -> Result<isize, Errno> {
    if signo == 0 || signo >= NSIG {
        return Err(Errno::EINVAL);
    }
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;

    let old = if act != 0 {
        let action: SigAction = userptr::copy_in_val(act)?;
        proc.signals.set_action(signo as i32, action)
    } else {
        proc.signals.action(signo as i32)
    };

    if oldact != 0 {
        userptr::copy_out_val(oldact, &old)?;
    }
    Ok(0)
}

use alloc::string::String;
