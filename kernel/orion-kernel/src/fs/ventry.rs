//! Ventries: the kernel-side name cache.
//!
//! A ventry binds a parent directory + name to a vnode and is the unit
//! of path traversal. Children hold strong references to their parent,
//! keeping the chain to the root alive while any descendant is in use;
//! parents hold strong references to cached children (dropped on
//! unlink). Hardlinks make the vnode binding 1:n — several ventries may
//! link one vnode.
//!
//! A mount swaps the mount-point ventry's vnode for the mounted
//! filesystem's root vnode; the displaced vnode is saved in the new
//! root's shadow slot and restored on unmount.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use orion_syscall::Errno;

use crate::sync::{Mutex, SpinMutex};

use super::vnode::{Vnode, VnodeFlags, VnodeType};

bitflags! {
    /// Ventry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VentryFlags: u32 {
        /// Bound to a vnode.
        const LINKED = 1 << 0;
        /// Serves as a mount point.
        const MOUNT = 1 << 1;
    }
}

/// A cached name→vnode binding.
pub struct Ventry {
    name: SpinMutex<String>,
    /// Mirrors the linked vnode's id.
    pub id: AtomicU64,
    vtype: SpinMutex<VnodeType>,
    flags: SpinMutex<VentryFlags>,
    parent: SpinMutex<Option<Arc<Ventry>>>,
    children: SpinMutex<Vec<Arc<Ventry>>>,
    vnode: SpinMutex<Option<Arc<Vnode>>>,
    /// Id of the vfs the linked vnode belongs to.
    pub vfs_id: AtomicU64,
    /// Traversal lock: parent before child; child first during unlink.
    pub lock: Mutex<()>,
}

impl Ventry {
    /// Allocates a ventry already linked to a vnode.
    #[must_use]
    pub fn alloc_linked(name: &str, vnode: &Arc<Vnode>) -> Arc<Self> {
        let ve = Arc::new(Self {
            name: SpinMutex::new(String::from(name)),
            id: AtomicU64::new(0),
            vtype: SpinMutex::new(vnode.vtype),
            flags: SpinMutex::new(VentryFlags::empty()),
            parent: SpinMutex::new(None),
            children: SpinMutex::new(Vec::new()),
            vnode: SpinMutex::new(None),
            vfs_id: AtomicU64::new(0),
            lock: Mutex::named("ventry", ()),
        });
        ve.link_vnode(vnode);
        ve
    }

    /// The entry name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the entry (rename support).
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    /// The cached type.
    #[must_use]
    pub fn vtype(&self) -> VnodeType {
        *self.vtype.lock()
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> VentryFlags {
        *self.flags.lock()
    }

    /// The parent ventry (none at the root).
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Ventry>> {
        self.parent.lock().clone()
    }

    /// The linked vnode.
    pub fn vnode(&self) -> Result<Arc<Vnode>, Errno> {
        self.vnode.lock().clone().ok_or(Errno::ENOENT)
    }

    /// Binds a vnode to this ventry (1:n across hardlinks).
    pub fn link_vnode(&self, vnode: &Arc<Vnode>) {
        let mut slot = self.vnode.lock();
        *slot = Some(vnode.clone());
        self.id.store(vnode.id, Ordering::Release);
        self.vfs_id
            .store(vnode.vfs().map_or(0, |v| v.id), Ordering::Release);
        *self.vtype.lock() = vnode.vtype;
        *self.flags.lock() |= VentryFlags::LINKED;
    }

    /// Unbinds the vnode, returning it.
    pub fn unlink_vnode(&self) -> Option<Arc<Vnode>> {
        let vnode = self.vnode.lock().take();
        *self.flags.lock() &= !VentryFlags::LINKED;
        vnode
    }

    /// Adds a child to this directory entry's cache.
    pub fn add_child(self: &Arc<Self>, child: &Arc<Ventry>) {
        *child.parent.lock() = Some(self.clone());
        self.children.lock().push(child.clone());
    }

    /// Removes a child by name (child-first lock order during unlink).
    pub fn remove_child(&self, name: &str) -> Option<Arc<Ventry>> {
        let mut children = self.children.lock();
        let pos = children.iter().position(|c| c.name.lock().as_str() == name)?;
        let child = children.remove(pos);
        *child.parent.lock() = None;
        Some(child)
    }

    /// Finds a cached child by name.
    #[must_use]
    pub fn find_child(&self, name: &str) -> Option<Arc<Ventry>> {
        self.children
            .lock()
            .iter()
            .find(|c| c.name.lock().as_str() == name)
            .cloned()
    }

    /// Snapshot of the cached children.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Ventry>> {
        self.children.lock().clone()
    }

    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.vtype() == VnodeType::Dir
    }

    /// Whether a mount sits on this entry.
    #[must_use]
    pub fn is_mountpoint(&self) -> bool {
        self.flags().contains(VentryFlags::MOUNT)
    }

    // ── Mount shadow swap ───────────────────────────────────────────

    /// Replaces this entry's vnode with `root` (a mounted filesystem's
    /// root), hiding the previous vnode in the root's shadow slot.
    pub fn shadow_mount(&self, root: &Arc<Vnode>) -> Result<(), Errno> {
        let mut slot = self.vnode.lock();
        let old = slot.take().ok_or(Errno::ENOENT)?;
        root.set_shadow(Some(old));
        root.set_flags(VnodeFlags::MOUNT);
        *slot = Some(root.clone());
        drop(slot);
        self.id.store(root.id, Ordering::Release);
        self.vfs_id.store(root.vfs().map_or(0, |v| v.id), Ordering::Release);
        *self.flags.lock() |= VentryFlags::MOUNT;
        Ok(())
    }

    /// Restores the vnode hidden by [`Ventry::shadow_mount`].
    pub fn unshadow_mount(&self) -> Result<Arc<Vnode>, Errno> {
        let mut slot = self.vnode.lock();
        let root = slot.take().ok_or(Errno::ENOTMNT)?;
        let old = root.set_shadow(None).ok_or(Errno::ENOTMNT)?;
        root.clear_flags(VnodeFlags::MOUNT);
        self.id.store(old.id, Ordering::Release);
        self.vfs_id.store(old.vfs().map_or(0, |v| v.id), Ordering::Release);
        *slot = Some(old);
        drop(slot);
        *self.flags.lock() &= !VentryFlags::MOUNT;
        // Cached children belong to the unmounted filesystem.
        self.children.lock().clear();
        Ok(root)
    }

    /// Builds this entry's absolute path by walking parents.
    #[must_use]
    pub fn abs_path(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(self.name());
        let mut cursor = self.parent();
        while let Some(ve) = cursor {
            parts.push(ve.name());
            cursor = ve.parent();
        }
        // The root's name is "/"; everything else joins with '/'.
        let mut out = String::new();
        for part in parts.iter().rev() {
            if part == "/" {
                continue;
            }
            out.push('/');
            out.push_str(part);
        }
        if out.is_empty() { String::from("/") } else { out }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vnode::VnodeOps;
    use alloc::boxed::Box;

    struct NullOps;
    impl VnodeOps for NullOps {
        fn lookup(&self, _dir: &Vnode, _name: &str) -> Result<Arc<Vnode>, Errno> {
            Err(Errno::ENOENT)
        }
    }

    fn vn(id: u64, vtype: VnodeType) -> Arc<Vnode> {
        Vnode::new(id, vtype, Box::new(NullOps))
    }

    #[test]
    fn alloc_linked_mirrors_vnode() {
        let vnode = vn(7, VnodeType::Reg);
        let ve = Ventry::alloc_linked("file", &vnode);
        assert_eq!(ve.id.load(Ordering::Relaxed), 7);
        assert_eq!(ve.vtype(), VnodeType::Reg);
        assert!(ve.flags().contains(VentryFlags::LINKED));
        assert!(Arc::ptr_eq(&ve.vnode().unwrap(), &vnode));
    }

    #[test]
    fn parent_child_consistency() {
        let root = Ventry::alloc_linked("/", &vn(1, VnodeType::Dir));
        let child = Ventry::alloc_linked("etc", &vn(2, VnodeType::Dir));
        root.add_child(&child);

        // Invariant: a child with a parent appears in that parent's list.
        let parent = child.parent().expect("parent set");
        assert!(Arc::ptr_eq(&parent, &root));
        assert!(root.children().iter().any(|c| Arc::ptr_eq(c, &child)));

        let removed = root.remove_child("etc").expect("removed");
        assert!(Arc::ptr_eq(&removed, &child));
        assert!(child.parent().is_none());
        assert!(root.find_child("etc").is_none());
    }

    #[test]
    fn hardlink_rebinding() {
        let a = vn(1, VnodeType::Reg);
        let b = vn(2, VnodeType::Reg);
        let ve = Ventry::alloc_linked("name", &a);
        let unlinked = ve.unlink_vnode().expect("unlinked");
        assert!(Arc::ptr_eq(&unlinked, &a));
        assert!(!ve.flags().contains(VentryFlags::LINKED));
        ve.link_vnode(&b);
        assert_eq!(ve.id.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn shadow_swap_roundtrip() {
        let dir_vn = vn(10, VnodeType::Dir);
        let ve = Ventry::alloc_linked("mnt", &dir_vn);
        let fs_root = vn(1, VnodeType::Dir);

        ve.shadow_mount(&fs_root).expect("mount");
        assert!(ve.is_mountpoint());
        assert!(Arc::ptr_eq(&ve.vnode().unwrap(), &fs_root));
        // Invariant: a vnode has a shadow iff it roots a mount.
        assert!(Arc::ptr_eq(&fs_root.shadow().unwrap(), &dir_vn));
        assert_eq!(ve.id.load(Ordering::Relaxed), 1);

        let unmounted_root = ve.unshadow_mount().expect("unmount");
        assert!(Arc::ptr_eq(&unmounted_root, &fs_root));
        assert!(!ve.is_mountpoint());
        assert!(fs_root.shadow().is_none());
        assert!(Arc::ptr_eq(&ve.vnode().unwrap(), &dir_vn));
        assert_eq!(ve.id.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn abs_path_walks_parents() {
        let root = Ventry::alloc_linked("/", &vn(1, VnodeType::Dir));
        let etc = Ventry::alloc_linked("etc", &vn(2, VnodeType::Dir));
        let passwd = Ventry::alloc_linked("passwd", &vn(3, VnodeType::Reg));
        root.add_child(&etc);
        etc.add_child(&passwd);

        assert_eq!(root.abs_path(), "/");
        assert_eq!(etc.abs_path(), "/etc");
        assert_eq!(passwd.abs_path(), "/etc/passwd");
    }
}
