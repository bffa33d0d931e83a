//! Filesystem syscalls.

extern crate alloc;

use alloc::sync::Arc;

use orion_syscall::flags::{
    F_DUPFD, F_GETFL, IOCTL_KQUEUE_CREATE, IOCTL_KQUEUE_CTL, OpenFlags, POLLHUP,
};
use orion_syscall::kevent::{EV_ADD, EV_DELETE, Kevent, KeventIoc};
use orion_syscall::{DirEntHeader, Errno, TimeSpec};

use crate::fs::{File, Resolved, VnodeType, VrFlags};

use super::userptr;
use super::{current_file, install_file, resolve_existing, resolve_user_path, vr_flags_for_open};

pub fn sys_open(path: usize, flags: usize, _mode: usize) -> Result<isize, Errno> {
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    let vr = vr_flags_for_open(flags);

    let ve = if flags.contains(OpenFlags::O_CREAT) {
        let vr = vr
            | VrFlags::PARENT
            | if flags.contains(OpenFlags::O_EXCL) { VrFlags::EXCLUSV } else { VrFlags::empty() };
        match resolve_user_path(path, vr)? {
            Resolved::Found(ve) => ve,
            Resolved::Parent { dir, name } => {
                let dvn = dir.vnode()?;
                let vn = dvn.create(&name, 0o644)?;
                let ve = crate::fs::Ventry::alloc_linked(&name, &vn);
                dir.add_child(&ve);
                ve
            }
        }
    } else {
        resolve_existing(path, vr)?
    };

    install_file(File::open(&ve, flags)?)
}

pub fn sys_close(fd: usize) -> Result<isize, Errno> {
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    proc.ftable.close(fd as i32)?;
    Ok(0)
}

pub fn sys_read(fd: usize, buf: usize, len: usize) -> Result<isize, Errno> {
    let file = current_file(fd)?;
    let mut kbuf = alloc::vec![0u8; len.min(1 << 20)];
    let n = file.read(&mut kbuf)?;
    userptr::copy_out(buf, &kbuf[..n])?;
    Ok(n as isize)
}

pub fn sys_write(fd: usize, buf: usize, len: usize) -> Result<isize, Errno> {
    let file = current_file(fd)?;
    let kbuf = userptr::copy_in(buf, len.min(1 << 20))?;
    Ok(file.write(&kbuf)? as isize)
}

pub fn sys_pread(fd: usize, buf: usize, len: usize, offset: usize) -> Result<isize, Errno> {
    let file = current_file(fd)?;
    let mut kbuf = alloc::vec![0u8; len.min(1 << 20)];
    let n = file.pread(&mut kbuf, offset as u64)?;
    userptr::copy_out(buf, &kbuf[..n])?;
    Ok(n as isize)
}

pub fn sys_pwrite(fd: usize, buf: usize, len: usize, offset: usize) -> Result<isize, Errno> {
    let file = current_file(fd)?;
    let kbuf = userptr::copy_in(buf, len.min(1 << 20))?;
    Ok(file.pwrite(&kbuf, offset as u64)? as isize)
}

pub fn sys_lseek(fd: usize, offset: usize, whence: usize) -> Result<isize, Errno> {
    let file = current_file(fd)?;
    Ok(file.seek(offset as i64, whence as u32)? as isize)
}

pub fn sys_fcntl(fd: usize, cmd: usize, arg: usize) -> Result<isize, Errno> {
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    match cmd as u32 {
        F_DUPFD => Ok(proc.ftable.dup_from(fd as i32, arg as i32)? as isize),
        F_GETFL => Ok(proc.ftable.get(fd as i32)?.flags().bits() as isize),
        _ => Err(Errno::EINVAL),
    }
}

pub fn sys_create(path: usize, _mode: usize) -> Result<isize, Errno> {
    match resolve_user_path(path, VrFlags::PARENT | VrFlags::EXCLUSV)? {
        Resolved::Parent { dir, name } => {
            dir.vnode()?.create(&name, _mode as u32)?;
            Ok(0)
        }
        Resolved::Found(_) => Err(Errno::EEXIST),
    }
}

pub fn sys_mknod(path: usize, mode: usize, dev: usize) -> Result<isize, Errno> {
    use orion_syscall::flags::{S_IFBLK, S_IFCHR, S_IFIFO, S_IFMT};
    let vtype = match mode as u32 & S_IFMT {
        S_IFBLK => VnodeType::Blk,
        S_IFCHR => VnodeType::Chr,
        S_IFIFO => VnodeType::Fifo,
        _ => return Err(Errno::EINVAL),
    };
    match resolve_user_path(path, VrFlags::PARENT | VrFlags::EXCLUSV)? {
        Resolved::Parent { dir, name } => {
            dir.vnode()?.mknod(&name, vtype, dev as u64)?;
            Ok(0)
        }
        Resolved::Found(_) => Err(Errno::EEXIST),
    }
}

pub fn sys_mkdir(path: usize, mode: usize) -> Result<isize, Errno> {
    match resolve_user_path(path, VrFlags::PARENT | VrFlags::EXCLUSV)? {
        Resolved::Parent { dir, name } => {
            dir.vnode()?.mkdir(&name, mode as u32)?;
            Ok(0)
        }
        Resolved::Found(_) => Err(Errno::EEXIST),
    }
}

pub fn sys_link(oldpath: usize, newpath: usize) -> Result<isize, Errno> {
    let target = resolve_existing(oldpath, VrFlags::empty())?;
    let target_vn = target.vnode()?;
    if target_vn.vtype == VnodeType::Dir {
        return Err(Errno::EISDIR);
    }
    match resolve_user_path(newpath, VrFlags::PARENT | VrFlags::EXCLUSV)? {
        Resolved::Parent { dir, name } => {
            dir.vnode()?.link(&name, &target_vn)?;
            Ok(0)
        }
        Resolved::Found(_) => Err(Errno::EEXIST),
    }
}

pub fn sys_unlink(path: usize) -> Result<isize, Errno> {
    let ve = resolve_existing(path, VrFlags::NOFOLLOW | VrFlags::LNK)
        .or_else(|_| resolve_existing(path, VrFlags::NOFOLLOW))?;
    let parent = ve.parent().ok_or(Errno::EBUSY)?;
    let vn = ve.vnode()?;
    if vn.vtype == VnodeType::Dir {
        return Err(Errno::EISDIR);
    }
    parent.vnode()?.unlink(&ve.name())?;
    vn.adjust_nlink(-1);
    vn.knotes.activate(orion_syscall::kevent::NOTE_DELETE);
    // Drop the name from the caches.
    crate::fs::vcache::invalidate(&ve.abs_path());
    parent.remove_child(&ve.name());
    ve.unlink_vnode();
    Ok(0)
}

pub fn sys_symlink(target: usize, linkpath: usize) -> Result<isize, Errno> {
    let target = userptr::read_cstring(target)?;
    match resolve_user_path(linkpath, VrFlags::PARENT | VrFlags::EXCLUSV)? {
        Resolved::Parent { dir, name } => {
            dir.vnode()?.symlink(&name, &target)?;
            Ok(0)
        }
        Resolved::Found(_) => Err(Errno::EEXIST),
    }
}

pub fn sys_rename(oldpath: usize, newpath: usize) -> Result<isize, Errno> {
    let old = resolve_existing(oldpath, VrFlags::NOFOLLOW)?;
    let old_parent = old.parent().ok_or(Errno::EBUSY)?;
    match resolve_user_path(newpath, VrFlags::PARENT)? {
        Resolved::Parent { dir, name } => {
            old_parent.vnode()?.rename(&old.name(), &*dir.vnode()?, &name)?;
            crate::fs::vcache::invalidate_prefix(&old.abs_path());
            old_parent.remove_child(&old.name());
            old.set_name(&name);
            dir.add_child(&old);
            Ok(0)
        }
        Resolved::Found(existing) => {
            // Replace an existing non-directory target.
            let dir = existing.parent().ok_or(Errno::EBUSY)?;
            let name = existing.name();
            sys_unlink_ventry(&existing)?;
            old_parent.vnode()?.rename(&old.name(), &*dir.vnode()?, &name)?;
            crate::fs::vcache::invalidate_prefix(&old.abs_path());
            old_parent.remove_child(&old.name());
            old.set_name(&name);
            dir.add_child(&old);
            Ok(0)
        }
    }
}

fn sys_unlink_ventry(ve: &Arc<crate::fs::Ventry>) -> Result<(), Errno> {
    let parent = ve.parent().ok_or(Errno::EBUSY)?;
    let vn = ve.vnode()?;
    if vn.vtype == VnodeType::Dir {
        return Err(Errno::EISDIR);
    }
    parent.vnode()?.unlink(&ve.name())?;
    vn.adjust_nlink(-1);
    crate::fs::vcache::invalidate(&ve.abs_path());
    parent.remove_child(&ve.name());
    ve.unlink_vnode();
    Ok(())
}

pub fn sys_readlink(path: usize, buf: usize, len: usize) -> Result<isize, Errno> {
    let ve = resolve_existing(path, VrFlags::NOFOLLOW | VrFlags::LNK)?;
    let target = ve.vnode()?.readlink()?;
    let bytes = target.as_bytes();
    let n = bytes.len().min(len);
    userptr::copy_out(buf, &bytes[..n])?;
    Ok(n as isize)
}

pub fn sys_readdir(fd: usize, buf: usize, len: usize) -> Result<isize, Errno> {
    let file = current_file(fd)?;
    let mut written = 0usize;

    loop {
        let Some(entry) = file.readdir()? else {
            break;
        };
        let reclen = DirEntHeader::record_len(entry.name.len());
        if written + reclen > len {
            // Roll the stream back so the entry is not lost.
            file.seekdir(file.telldir().saturating_sub(1));
            break;
        }
        let header = DirEntHeader {
            ino: entry.id,
            off: u64::from(file.telldir()),
            reclen: reclen as u16,
            dtype: entry.vtype.dtype(),
            __pad: [0; 5],
        };
        userptr::copy_out_val(buf + written, &header)?;
        let name_at = buf + written + size_of::<DirEntHeader>();
        userptr::copy_out(name_at, entry.name.as_bytes())?;
        userptr::copy_out(name_at + entry.name.len(), &[0u8])?;
        written += reclen;
    }
    Ok(written as isize)
}

pub fn sys_telldir(fd: usize) -> Result<isize, Errno> {
    Ok(current_file(fd)?.telldir() as isize)
}

pub fn sys_seekdir(fd: usize, cookie: usize) -> Result<isize, Errno> {
    let cookie = u16::try_from(cookie).map_err(|_| Errno::EINVAL)?;
    current_file(fd)?.seekdir(cookie);
    Ok(0)
}

pub fn sys_rewinddir(fd: usize) -> Result<isize, Errno> {
    current_file(fd)?.rewinddir();
    Ok(0)
}

pub fn sys_rmdir(path: usize) -> Result<isize, Errno> {
    let ve = resolve_existing(path, VrFlags::DIR | VrFlags::NOFOLLOW)?;
    let parent = ve.parent().ok_or(Errno::EBUSY)?;
    if ve.is_mountpoint() {
        return Err(Errno::EBUSY);
    }
    parent.vnode()?.rmdir(&ve.name())?;
    crate::fs::vcache::invalidate_prefix(&ve.abs_path());
    parent.remove_child(&ve.name());
    ve.unlink_vnode();
    Ok(0)
}

pub fn sys_chdir(path: usize) -> Result<isize, Errno> {
    let ve = resolve_existing(path, VrFlags::DIR)?;
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    *proc.cwd.lock() = Some(ve);
    Ok(0)
}

pub fn sys_chmod(path: usize, _mode: usize) -> Result<isize, Errno> {
    // Mode bits are not persisted yet; validate the path and dirty the
    // vnode so a later save sees it.
    let ve = resolve_existing(path, VrFlags::empty())?;
    let vn = ve.vnode()?;
    vn.set_flags(crate::fs::VnodeFlags::DIRTY);
    vn.knotes.activate(orion_syscall::kevent::NOTE_ATTRIB);
    Ok(0)
}

pub fn sys_stat(path: usize, statbuf: usize) -> Result<isize, Errno> {
    let ve = resolve_existing(path, VrFlags::empty())?;
    let stat = crate::fs::file::stat_vnode(&ve.vnode()?)?;
    userptr::copy_out_val(statbuf, &stat)?;
    Ok(0)
}

pub fn sys_fstat(fd: usize, statbuf: usize) -> Result<isize, Errno> {
    let stat = current_file(fd)?.stat()?;
    userptr::copy_out_val(statbuf, &stat)?;
    Ok(0)
}

pub fn sys_ioctl(fd: usize, request: usize, arg: usize) -> Result<isize, Errno> {
    match request as u32 {
        IOCTL_KQUEUE_CREATE => sys_kqueue_create(),
        IOCTL_KQUEUE_CTL => sys_kqueue_ctl(fd, arg),
        _ => Ok(current_file(fd)?.ioctl(request as u32, arg)? as isize),
    }
}

// ── Kqueue (ioctl-based) ────────────────────────────────────────────

/// A vnode standing in for a kqueue descriptor.
struct KqueueVnodeOps {
    kq: Arc<crate::ipc::kqueue::KQueue>,
}

impl crate::fs::VnodeOps for KqueueVnodeOps {
    fn lookup(
        &self,
        _dir: &crate::fs::Vnode,
        _name: &str,
    ) -> Result<Arc<crate::fs::Vnode>, Errno> {
        Err(Errno::ENOTDIR)
    }
}

/// vnode-address → kqueue side table (torn down with the vnode).
static KQUEUES: crate::sync::SpinMutex<
    alloc::collections::BTreeMap<usize, Arc<crate::ipc::kqueue::KQueue>>,
> = crate::sync::SpinMutex::named("KQUEUES", alloc::collections::BTreeMap::new());

fn sys_kqueue_create() -> Result<isize, Errno> {
    let kq = crate::ipc::kqueue::KQueue::new();
    let vn = crate::fs::Vnode::new(
        0,
        VnodeType::Fifo,
        alloc::boxed::Box::new(KqueueVnodeOps { kq: kq.clone() }),
    );
    KQUEUES.lock().insert(Arc::as_ptr(&vn) as usize, kq);
    install_file(File::from_vnode(vn, OpenFlags::O_RDWR))
}

fn kqueue_of(fd: usize) -> Result<Arc<crate::ipc::kqueue::KQueue>, Errno> {
    let file = current_file(fd)?;
    let key = Arc::as_ptr(file.vnode()) as usize;
    KQUEUES.lock().get(&key).cloned().ok_or(Errno::EBADF)
}

fn sys_kqueue_ctl(fd: usize, arg: usize) -> Result<isize, Errno> {
    let ioc: KeventIoc = userptr::copy_in_val(arg)?;
    let kq = kqueue_of(fd)?;
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;

    // Apply the changelist.
    for i in 0..ioc.nchanges {
        let change: Kevent =
            userptr::copy_in_val(ioc.changelist + i * size_of::<Kevent>())?;
        if change.flags & EV_DELETE != 0 {
            if let Some(note) = kq.find(change.ident, change.filter) {
                kq.remove(&note);
            }
            continue;
        }
        if change.flags & EV_ADD != 0 {
            match change.filter {
                orion_syscall::kevent::EVFILT_READ | orion_syscall::kevent::EVFILT_WRITE
                | orion_syscall::kevent::EVFILT_VNODE => {
                    let file = proc.ftable.get(change.ident as i32)?;
                    kq.add(&change, &file.vnode().knotes);
                }
                orion_syscall::kevent::EVFILT_PROC => {
                    let target = crate::proc::lookup_process(change.ident as u32)
                        .ok_or(Errno::ESRCH)?;
                    kq.add(&change, &target.knotes);
                }
                _ => return Err(Errno::EINVAL),
            };
        } else if let Some(note) = kq.find(change.ident, change.filter) {
            kq.set_enabled(&note, change.flags);
        }
    }

    // Collect events.
    if ioc.nevents == 0 {
        return Ok(0);
    }
    let mut out = alloc::vec![Kevent::new(0, 0, 0, 0, 0, 0); ioc.nevents.min(64)];
    let timeout = if ioc.timeout != 0 {
        let ts: TimeSpec = userptr::copy_in_val(ioc.timeout)?;
        ts.to_nanos()
    } else {
        None
    };
    let n = kq.wait(&mut out, timeout);
    for (i, event) in out.iter().take(n).enumerate() {
        userptr::copy_out_val(ioc.eventlist + i * size_of::<Kevent>(), event)?;
    }
    Ok(n as isize)
}

pub fn sys_poll(fds: usize, nfds: usize, timeout_ms: usize) -> Result<isize, Errno> {
    /// Mirror of the userspace `struct pollfd`.
    #[derive(Clone, Copy)]
    #[repr(C)]
    struct PollFd {
        fd: i32,
        events: u16,
        revents: u16,
    }

    if nfds > 64 {
        return Err(Errno::EINVAL);
    }
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let deadline = (timeout_ms as i64 >= 0)
        .then(|| crate::time::clock::try_uptime_nanos().unwrap_or(0) + timeout_ms as u64 * 1_000_000);

    loop {
        let mut ready = 0isize;
        for i in 0..nfds {
            let slot = fds + i * size_of::<PollFd>();
            let mut pfd: PollFd = userptr::copy_in_val(slot)?;
            pfd.revents = 0;
            match proc.ftable.get(pfd.fd) {
                Ok(file) => {
                    let ready = file.vnode().poll();
                    pfd.revents = ready & (pfd.events | POLLHUP);
                }
                Err(_) => pfd.revents |= POLLHUP,
            }
            if pfd.revents != 0 {
                ready += 1;
            }
            userptr::copy_out_val(slot, &pfd)?;
        }
        if ready > 0 {
            return Ok(ready);
        }
        if let Some(deadline) = deadline
            && crate::time::clock::try_uptime_nanos().unwrap_or(0) >= deadline
        {
            return Ok(0);
        }
        match crate::sched::sleep_ns(1_000_000) {
            crate::sync::WaitResult::Interrupted => return Err(Errno::EINTR),
            _ => {}
        }
        #[cfg(not(target_os = "none"))]
        return Ok(0);
    }
}
