//! Vnodes: filesystem-owned file objects.
//!
//! A vnode is created by its filesystem, registered in the owning vfs's
//! id table while alive, and carries two locks: a metadata mutex (`lock`)
//! and a data rwlock (`data_lock`). Data operations (`read`/`write`) take
//! the rwlock; name-space operations (`lookup`/`create`/`rename`) take
//! the metadata mutex. File-backed pages live in the per-vnode page
//! cache, filled on demand through the filesystem's missing-page hook.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use orion_syscall::Errno;

use crate::ipc::kqueue::KnList;
use crate::mm::frames::Page;
use crate::mm::pgcache::PageCache;
use crate::sync::{Mutex, RwLock, SpinMutex};

use super::vfs::Vfs;

/// Filesystem-wide vnode identifier (inode number).
pub type VnodeId = u64;

/// Vnode object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// Regular file.
    Reg,
    /// Directory.
    Dir,
    /// Symbolic link.
    Lnk,
    /// Block device.
    Blk,
    /// Character device.
    Chr,
    /// Named pipe.
    Fifo,
    /// Socket.
    Sock,
}

impl VnodeType {
    /// The `st_mode` type bits for this vnode type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        use orion_syscall::flags::*;
        match self {
            Self::Reg => S_IFREG,
            Self::Dir => S_IFDIR,
            Self::Lnk => S_IFLNK,
            Self::Blk => S_IFBLK,
            Self::Chr => S_IFCHR,
            Self::Fifo => S_IFIFO,
            Self::Sock => S_IFSOCK,
        }
    }

    /// The `DT_*` directory entry type.
    #[must_use]
    pub fn dtype(self) -> u8 {
        use orion_syscall::flags::*;
        match self {
            Self::Reg => DT_REG,
            Self::Dir => DT_DIR,
            Self::Lnk => DT_LNK,
            Self::Blk => DT_BLK,
            Self::Chr => DT_CHR,
            Self::Fifo => DT_FIFO,
            Self::Sock => DT_SOCK,
        }
    }
}

/// Vnode lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeState {
    /// Allocated, metadata not loaded.
    Empty,
    /// Live and reachable through the vfs id table.
    Alive,
    /// Disconnected; release on last reference.
    Dead,
}

bitflags! {
    /// Vnode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// Root vnode of its filesystem.
        const ROOT = 1 << 0;
        /// Metadata has been loaded from the backing store.
        const LOADED = 1 << 1;
        /// Metadata changed since the last save.
        const DIRTY = 1 << 2;
        /// This vnode is a mount point's replacement root.
        const MOUNT = 1 << 3;
    }
}

/// One directory entry produced by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// The entry's vnode id.
    pub id: VnodeId,
    /// The entry name.
    pub name: String,
    /// The entry's type.
    pub vtype: VnodeType,
}

/// The driver half of a vnode.
///
/// `lookup` is the single primitive every filesystem must implement;
/// everything else defaults to the appropriate errno so read-only or
/// synthetic filesystems stay small.
pub trait VnodeOps: Send + Sync {
    /// Looks `name` up in directory `dir`.
    fn lookup(&self, dir: &Vnode, name: &str) -> Result<Arc<Vnode>, Errno>;

    /// Reads at `off` into `buf`, returning the bytes read.
    fn read(&self, _vn: &Vnode, _off: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Writes `buf` at `off`, returning the bytes written.
    fn write(&self, _vn: &Vnode, _off: u64, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::EROFS)
    }

    /// Produces the directory entry at `cookie` (0 = first) plus the
    /// cookie of the next entry. Cookies are stable, opaque, and 16-bit.
    fn readdir(&self, _dir: &Vnode, _cookie: u16) -> Result<Option<(DirEntry, u16)>, Errno> {
        Err(Errno::ENOTDIR)
    }

    /// Creates a regular file.
    fn create(&self, _dir: &Vnode, _name: &str, _mode: u32) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::EROFS)
    }

    /// Creates a device node.
    fn mknod(
        &self,
        _dir: &Vnode,
        _name: &str,
        _vtype: VnodeType,
        _rdev: u64,
    ) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::EROFS)
    }

    /// Creates a directory.
    fn mkdir(&self, _dir: &Vnode, _name: &str, _mode: u32) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::EROFS)
    }

    /// Removes an empty directory.
    fn rmdir(&self, _dir: &Vnode, _name: &str) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    /// Adds a hard link to `vn` under `name`.
    fn link(&self, _dir: &Vnode, _name: &str, _vn: &Arc<Vnode>) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    /// Removes a directory entry.
    fn unlink(&self, _dir: &Vnode, _name: &str) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    /// Creates a symlink to `target`.
    fn symlink(&self, _dir: &Vnode, _name: &str, _target: &str) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::EROFS)
    }

    /// Reads a symlink's target.
    fn readlink(&self, _vn: &Vnode) -> Result<String, Errno> {
        Err(Errno::EINVAL)
    }

    /// Renames `old_name` in `dir` to `new_name` in `new_dir`.
    fn rename(
        &self,
        _dir: &Vnode,
        _old_name: &str,
        _new_dir: &Vnode,
        _new_name: &str,
    ) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    /// Loads metadata from the backing store.
    fn load(&self, _vn: &Vnode) -> Result<(), Errno> {
        Ok(())
    }

    /// Writes metadata back to the backing store.
    fn save(&self, _vn: &Vnode) -> Result<(), Errno> {
        Ok(())
    }

    /// Produces the page backing byte offset `off` on a cache miss,
    /// either by reading from the device or allocating an anonymous page.
    fn getpage(&self, _vn: &Vnode, _off: u64) -> Result<Arc<Page>, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Device control for BLK/CHR vnodes.
    fn ioctl(&self, _vn: &Vnode, _request: u32, _arg: usize) -> Result<usize, Errno> {
        Err(Errno::ENOTTY)
    }

    /// Poll readiness (`POLLIN`/`POLLOUT` bits). Plain files are always
    /// ready; stream objects override this.
    fn poll(&self, _vn: &Vnode) -> u16 {
        orion_syscall::flags::POLLIN | orion_syscall::flags::POLLOUT
    }
}

/// A filesystem object: file, directory, device node, link, fifo, socket.
pub struct Vnode {
    /// Filesystem-assigned id.
    pub id: VnodeId,
    /// The object type.
    pub vtype: VnodeType,
    state: SpinMutex<VnodeState>,
    flags: SpinMutex<VnodeFlags>,
    /// The owning mounted filesystem.
    pub vfs: SpinMutex<Weak<Vfs>>,
    size: AtomicU64,
    nlink: AtomicU32,
    /// Id of the directory this vnode was reached through.
    pub parent_id: AtomicU64,
    /// Device id for BLK/CHR nodes (`Stat::make_rdev` encoding).
    pub rdev: AtomicU64,
    /// The vnode hidden beneath this one while it serves as a mount root.
    shadow: SpinMutex<Option<Arc<Vnode>>>,
    cache: SpinMutex<Option<Arc<PageCache>>>,
    ops: Box<dyn VnodeOps>,
    /// Metadata lock (lookup/create/rename take this).
    pub lock: Mutex<()>,
    /// Data lock (read/write take this; writes exclusively).
    pub data_lock: RwLock<()>,
    /// Knotes watching this vnode (`EVFILT_VNODE`, `EVFILT_READ`…).
    /// Shared between both end vnodes of a pipe.
    pub knotes: Arc<KnList>,
}

impl Vnode {
    /// Creates a vnode owned by a filesystem.
    #[must_use]
    pub fn new(id: VnodeId, vtype: VnodeType, ops: Box<dyn VnodeOps>) -> Arc<Self> {
        Self::new_with_knotes(id, vtype, ops, Arc::new(KnList::new()))
    }

    /// Creates a vnode sharing an existing knote list (pipe ends).
    #[must_use]
    pub fn new_with_knotes(
        id: VnodeId,
        vtype: VnodeType,
        ops: Box<dyn VnodeOps>,
        knotes: Arc<KnList>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            vtype,
            state: SpinMutex::new(VnodeState::Empty),
            flags: SpinMutex::new(VnodeFlags::empty()),
            vfs: SpinMutex::new(Weak::new()),
            size: AtomicU64::new(0),
            nlink: AtomicU32::new(1),
            parent_id: AtomicU64::new(0),
            rdev: AtomicU64::new(0),
            shadow: SpinMutex::new(None),
            cache: SpinMutex::new(None),
            ops,
            lock: Mutex::named("vnode", ()),
            data_lock: RwLock::named("vnode_data", ()),
            knotes,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> VnodeState {
        *self.state.lock()
    }

    /// Sets the lifecycle state.
    pub fn set_state(&self, state: VnodeState) {
        *self.state.lock() = state;
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> VnodeFlags {
        *self.flags.lock()
    }

    /// Sets flag bits.
    pub fn set_flags(&self, flags: VnodeFlags) {
        *self.flags.lock() |= flags;
    }

    /// Clears flag bits.
    pub fn clear_flags(&self, flags: VnodeFlags) {
        *self.flags.lock() &= !flags;
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Updates the file size.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Hard link count.
    #[must_use]
    pub fn nlink(&self) -> u32 {
        self.nlink.load(Ordering::Acquire)
    }

    /// Adjusts the link count by `delta`, returning the new value.
    pub fn adjust_nlink(&self, delta: i32) -> u32 {
        if delta >= 0 {
            self.nlink.fetch_add(delta as u32, Ordering::AcqRel) + delta as u32
        } else {
            self.nlink.fetch_sub((-delta) as u32, Ordering::AcqRel) - (-delta) as u32
        }
    }

    /// The owning vfs, if still mounted.
    #[must_use]
    pub fn vfs(&self) -> Option<Arc<Vfs>> {
        self.vfs.lock().upgrade()
    }

    /// The hidden vnode when this one roots a mount.
    #[must_use]
    pub fn shadow(&self) -> Option<Arc<Vnode>> {
        self.shadow.lock().clone()
    }

    /// Installs the shadow (mount) / removes it (unmount).
    pub fn set_shadow(&self, shadow: Option<Arc<Vnode>>) -> Option<Arc<Vnode>> {
        core::mem::replace(&mut *self.shadow.lock(), shadow)
    }

    /// The page cache, creating it on first use.
    #[must_use]
    pub fn page_cache(&self) -> Arc<PageCache> {
        let mut cache = self.cache.lock();
        cache.get_or_insert_with(|| Arc::new(PageCache::new())).clone()
    }

    // ── Driver-delegating operations ────────────────────────────────

    /// Reads file data (shared data lock).
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let _data = self.data_lock.read();
        self.ops.read(self, off, buf)
    }

    /// Writes file data (exclusive data lock), then activates write
    /// knotes.
    pub fn write_at(&self, off: u64, buf: &[u8]) -> Result<usize, Errno> {
        let (n, grew) = {
            let _data = self.data_lock.write();
            let n = self.ops.write(self, off, buf)?;
            let end = off + n as u64;
            let grew = end > self.size();
            if grew {
                self.set_size(end);
            }
            self.set_flags(VnodeFlags::DIRTY);
            (n, grew)
        };
        if n > 0 {
            let mut fflags = orion_syscall::kevent::NOTE_WRITE;
            if grew {
                fflags |= orion_syscall::kevent::NOTE_EXTEND;
            }
            self.knotes.activate(fflags);
        }
        Ok(n)
    }

    /// Looks up a child (metadata lock).
    pub fn lookup(&self, name: &str) -> Result<Arc<Vnode>, Errno> {
        if self.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        let _meta = self.lock.lock();
        self.ops.lookup(self, name)
    }

    /// Reads one directory entry at `cookie`.
    pub fn readdir(&self, cookie: u16) -> Result<Option<(DirEntry, u16)>, Errno> {
        if self.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        let _data = self.data_lock.read();
        self.ops.readdir(self, cookie)
    }

    /// Creates a regular file in this directory.
    pub fn create(&self, name: &str, mode: u32) -> Result<Arc<Vnode>, Errno> {
        self.dir_write_op(|ops, dir| ops.create(dir, name, mode))
    }

    /// Creates a device node in this directory.
    pub fn mknod(&self, name: &str, vtype: VnodeType, rdev: u64) -> Result<Arc<Vnode>, Errno> {
        self.dir_write_op(|ops, dir| ops.mknod(dir, name, vtype, rdev))
    }

    /// Creates a subdirectory.
    pub fn mkdir(&self, name: &str, mode: u32) -> Result<Arc<Vnode>, Errno> {
        self.dir_write_op(|ops, dir| ops.mkdir(dir, name, mode))
    }

    /// Removes an empty subdirectory.
    pub fn rmdir(&self, name: &str) -> Result<(), Errno> {
        self.dir_write_op(|ops, dir| ops.rmdir(dir, name))
    }

    /// Links `vn` under `name` in this directory.
    pub fn link(&self, name: &str, vn: &Arc<Vnode>) -> Result<(), Errno> {
        self.dir_write_op(|ops, dir| ops.link(dir, name, vn))?;
        vn.adjust_nlink(1);
        vn.knotes.activate(orion_syscall::kevent::NOTE_LINK);
        Ok(())
    }

    /// Removes `name` from this directory.
    pub fn unlink(&self, name: &str) -> Result<(), Errno> {
        self.dir_write_op(|ops, dir| ops.unlink(dir, name))
    }

    /// Creates a symlink in this directory.
    pub fn symlink(&self, name: &str, target: &str) -> Result<Arc<Vnode>, Errno> {
        self.dir_write_op(|ops, dir| ops.symlink(dir, name, target))
    }

    /// Reads this symlink's target.
    pub fn readlink(&self) -> Result<alloc::string::String, Errno> {
        if self.vtype != VnodeType::Lnk {
            return Err(Errno::EINVAL);
        }
        let _data = self.data_lock.read();
        self.ops.readlink(self)
    }

    /// Renames within/between directories (metadata + data locks).
    pub fn rename(&self, old_name: &str, new_dir: &Vnode, new_name: &str) -> Result<(), Errno> {
        if self.vtype != VnodeType::Dir || new_dir.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        let _meta = self.lock.lock();
        let _data = self.data_lock.write();
        self.ops.rename(self, old_name, new_dir, new_name)?;
        self.knotes.activate(orion_syscall::kevent::NOTE_RENAME);
        Ok(())
    }

    /// Loads metadata if not yet loaded.
    pub fn load(&self) -> Result<(), Errno> {
        if self.flags().contains(VnodeFlags::LOADED) {
            return Ok(());
        }
        let _meta = self.lock.lock();
        self.ops.load(self)?;
        self.set_flags(VnodeFlags::LOADED);
        Ok(())
    }

    /// Saves metadata if dirty.
    pub fn save(&self) -> Result<(), Errno> {
        if !self.flags().contains(VnodeFlags::DIRTY) {
            return Ok(());
        }
        let _meta = self.lock.lock();
        self.ops.save(self)?;
        self.clear_flags(VnodeFlags::DIRTY);
        Ok(())
    }

    /// Returns the page backing `off`, consulting the page cache first
    /// and falling back to the filesystem's missing-page hook.
    pub fn get_page(&self, off: u64) -> Result<Arc<Page>, Errno> {
        let cache = self.page_cache();
        if let Some(page) = cache.lookup(off) {
            return Ok(page);
        }
        let page = self.ops.getpage(self, off)?;
        cache.insert(off, page.clone());
        Ok(page)
    }

    /// Device control.
    pub fn ioctl(&self, request: u32, arg: usize) -> Result<usize, Errno> {
        self.ops.ioctl(self, request, arg)
    }

    /// Poll readiness.
    #[must_use]
    pub fn poll(&self) -> u16 {
        self.ops.poll(self)
    }

    /// Shared helper: directory-mutating ops take the metadata lock and
    /// the data lock exclusively.
    fn dir_write_op<T>(
        &self,
        f: impl FnOnce(&dyn VnodeOps, &Vnode) -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        if self.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        let _meta = self.lock.lock();
        let _data = self.data_lock.write();
        let result = f(&*self.ops, self)?;
        self.set_flags(VnodeFlags::DIRTY);
        self.knotes.activate(orion_syscall::kevent::NOTE_WRITE);
        Ok(result)
    }
}
