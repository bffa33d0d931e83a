//! Mounted filesystem instances and the mount graph.
//!
//! A [`Vfs`] owns its id→vnode table and its submounts. Mounting
//! validates that the target is an empty, unmounted directory, asks the
//! filesystem type for a root vnode, and swaps it onto the mount-point
//! ventry; unmounting drains writers, recursively unmounts submounts,
//! saves dirty vnodes, and restores the shadowed vnode.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use orion_syscall::Errno;

use crate::sync::{Mutex, SpinMutex};

use super::ventry::Ventry;
use super::vnode::{Vnode, VnodeFlags, VnodeId, VnodeState};
use super::{FsType, VfsOps};

/// Lifecycle states of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsState {
    /// Mounted and serving operations.
    Mounted,
    /// Being torn down; new operations fail.
    Dead,
}

static NEXT_VFS_ID: AtomicU64 = AtomicU64::new(1);

/// A mounted filesystem instance.
pub struct Vfs {
    /// Mount instance id.
    pub id: u64,
    /// The filesystem type name.
    pub fstype: &'static str,
    state: SpinMutex<VfsState>,
    /// Mount flags (reserved bits; read-only etc. live here).
    pub mount_flags: AtomicU32,
    ops: SpinMutex<Option<Box<dyn VfsOps>>>,
    root_ve: SpinMutex<Option<Arc<Ventry>>>,
    vnodes: SpinMutex<BTreeMap<VnodeId, Arc<Vnode>>>,
    submounts: SpinMutex<Vec<Arc<Vfs>>>,
    parent: SpinMutex<Weak<Vfs>>,
    /// In-flight write operations; unmount waits for zero.
    write_ops: AtomicU32,
    /// Per-vfs lock serializing mount-graph changes.
    pub lock: Mutex<()>,
}

impl Vfs {
    /// Creates an unmounted instance of a filesystem type.
    #[must_use]
    pub fn new(fstype: &FsType) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_VFS_ID.fetch_add(1, Ordering::Relaxed),
            fstype: fstype.name,
            state: SpinMutex::new(VfsState::Mounted),
            mount_flags: AtomicU32::new(0),
            ops: SpinMutex::new(Some((fstype.make_ops)())),
            root_ve: SpinMutex::new(None),
            vnodes: SpinMutex::new(BTreeMap::new()),
            submounts: SpinMutex::new(Vec::new()),
            parent: SpinMutex::new(Weak::new()),
            write_ops: AtomicU32::new(0),
            lock: Mutex::named("vfs", ()),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> VfsState {
        *self.state.lock()
    }

    /// The root ventry once mounted.
    #[must_use]
    pub fn root_ventry(&self) -> Option<Arc<Ventry>> {
        self.root_ve.lock().clone()
    }

    /// Inserts a vnode into the id table and marks it alive.
    pub fn adopt_vnode(self: &Arc<Self>, vnode: &Arc<Vnode>) {
        *vnode.vfs.lock() = Arc::downgrade(self);
        vnode.set_state(VnodeState::Alive);
        self.vnodes.lock().insert(vnode.id, vnode.clone());
    }

    /// Looks a vnode up by id.
    #[must_use]
    pub fn vnode_by_id(&self, id: VnodeId) -> Option<Arc<Vnode>> {
        self.vnodes.lock().get(&id).cloned()
    }

    /// Number of live vnodes.
    #[must_use]
    pub fn vnode_count(&self) -> usize {
        self.vnodes.lock().len()
    }

    /// Begins a write operation; fails once the vfs is dying.
    pub fn begin_write(&self) -> Result<WriteOp<'_>, Errno> {
        self.write_ops.fetch_add(1, Ordering::AcqRel);
        if self.state() == VfsState::Dead {
            self.write_ops.fetch_sub(1, Ordering::AcqRel);
            return Err(Errno::ESTALE);
        }
        Ok(WriteOp { vfs: self })
    }

    /// Live submounts.
    #[must_use]
    pub fn submounts(&self) -> Vec<Arc<Vfs>> {
        self.submounts.lock().clone()
    }
}

/// RAII write-operation token keeping unmount at bay.
pub struct WriteOp<'a> {
    vfs: &'a Vfs,
}

impl Drop for WriteOp<'_> {
    fn drop(&mut self) {
        self.vfs.write_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// The mount graph
// ---------------------------------------------------------------------------

/// The root of the whole namespace.
static ROOT_VENTRY: SpinMutex<Option<Arc<Ventry>>> = SpinMutex::named("ROOT_VE", None);
/// The root filesystem instance.
static ROOT_VFS: SpinMutex<Option<Arc<Vfs>>> = SpinMutex::named("ROOT_VFS", None);

/// Returns the namespace root, once a root filesystem is mounted.
#[must_use]
pub fn root_ventry() -> Option<Arc<Ventry>> {
    ROOT_VENTRY.lock().clone()
}

/// Mounts the root filesystem.
///
/// # Panics
///
/// Panics if a root is already mounted.
pub fn mount_root(fstype: &FsType) -> Result<Arc<Vfs>, Errno> {
    let vfs = Vfs::new(fstype);
    let root_vn = {
        let ops = vfs.ops.lock();
        ops.as_ref().expect("ops present").mount(&vfs)?
    };
    root_vn.set_flags(VnodeFlags::ROOT);
    vfs.adopt_vnode(&root_vn);

    let root_ve = Ventry::alloc_linked("/", &root_vn);
    *vfs.root_ve.lock() = Some(root_ve.clone());

    {
        let mut slot = ROOT_VENTRY.lock();
        assert!(slot.is_none(), "root filesystem already mounted");
        *slot = Some(root_ve);
    }
    *ROOT_VFS.lock() = Some(vfs.clone());
    crate::kinfo!("vfs: mounted {} as root", fstype.name);
    Ok(vfs)
}

/// Mounts a filesystem of `fstype` on the directory at `mountpoint`.
///
/// The mount point must be an empty directory that is not already a
/// mount point.
pub fn mount_at(mountpoint: &Arc<Ventry>, fstype: &FsType) -> Result<Arc<Vfs>, Errno> {
    let _guard = mountpoint.lock.lock();
    if !mountpoint.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if mountpoint.is_mountpoint() {
        return Err(Errno::EBUSY);
    }
    let mp_vnode = mountpoint.vnode()?;
    // An empty directory has no entries at the first cookie.
    if mp_vnode.readdir(0)?.is_some() {
        return Err(Errno::ENOTEMPTY);
    }

    let parent_vfs = mp_vnode.vfs();

    let vfs = Vfs::new(fstype);
    let root_vn = {
        let ops = vfs.ops.lock();
        ops.as_ref().expect("ops present").mount(&vfs)?
    };
    root_vn.set_flags(VnodeFlags::ROOT);
    vfs.adopt_vnode(&root_vn);

    mountpoint.shadow_mount(&root_vn)?;
    *vfs.root_ve.lock() = Some(mountpoint.clone());

    if let Some(parent) = parent_vfs {
        *vfs.parent.lock() = Arc::downgrade(&parent);
        parent.submounts.lock().push(vfs.clone());
    }

    crate::kinfo!("vfs: mounted {} at {}", fstype.name, mountpoint.abs_path());
    Ok(vfs)
}

/// Unmounts the filesystem whose root sits on `mountpoint`.
///
/// Waits for in-flight writers, marks the vfs dead, recursively unmounts
/// submounts, saves every dirty vnode, calls the driver's unmount, and
/// restores the shadowed vnode.
pub fn unmount_at(mountpoint: &Arc<Ventry>) -> Result<(), Errno> {
    let _guard = mountpoint.lock.lock();
    if !mountpoint.is_mountpoint() {
        return Err(Errno::ENOTMNT);
    }
    let root_vn = mountpoint.vnode()?;
    let vfs = root_vn.vfs().ok_or(Errno::ENOTMNT)?;

    unmount_vfs(&vfs)?;

    let _root = mountpoint.unshadow_mount()?;
    super::vcache::invalidate_prefix(&mountpoint.abs_path());
    crate::kinfo!("vfs: unmounted {} from {}", vfs.fstype, mountpoint.abs_path());
    Ok(())
}

fn unmount_vfs(vfs: &Arc<Vfs>) -> Result<(), Errno> {
    {
        let mut state = vfs.state.lock();
        if *state == VfsState::Dead {
            return Err(Errno::ENOTMNT);
        }
        *state = VfsState::Dead;
    }

    // Drain in-flight writers.
    while vfs.write_ops.load(Ordering::Acquire) > 0 {
        crate::sched::yield_now();
    }

    // Submounts go first.
    for sub in vfs.submounts() {
        if let Some(ve) = sub.root_ventry() {
            let _ = ve.unshadow_mount();
        }
        unmount_vfs(&sub)?;
    }

    // Save dirty vnodes, then drop the table.
    let vnodes: Vec<Arc<Vnode>> = vfs.vnodes.lock().values().cloned().collect();
    for vn in &vnodes {
        if vn.flags().contains(VnodeFlags::DIRTY) {
            vn.save()?;
        }
        vn.set_state(VnodeState::Dead);
    }
    vfs.vnodes.lock().clear();

    let ops = vfs.ops.lock().take();
    if let Some(ops) = ops {
        ops.unmount(vfs)?;
    }
    Ok(())
}
