//! An in-memory filesystem exercising the VFS contract in host tests.
//!
//! Implements the full [`VnodeOps`]/[`VfsOps`] surface over plain maps
//! and byte vectors: directories, regular files, symlinks, device nodes,
//! hardlinks, and rename. Every mount gets its own private tree.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use orion_syscall::Errno;

use crate::sync::SpinMutex;

use super::vfs::Vfs;
use super::vnode::{DirEntry, Vnode, VnodeId, VnodeOps, VnodeType};
use super::{FsType, VfsOps};

struct Node {
    vtype: VnodeType,
    data: Vec<u8>,
    entries: Vec<(String, VnodeId)>,
    target: String,
    rdev: u64,
    nlink: u32,
}

impl Node {
    fn new(vtype: VnodeType) -> Self {
        Self { vtype, data: Vec::new(), entries: Vec::new(), target: String::new(), rdev: 0, nlink: 1 }
    }
}

struct Inner {
    nodes: SpinMutex<BTreeMap<VnodeId, Node>>,
    vnodes: SpinMutex<BTreeMap<VnodeId, Arc<Vnode>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn alloc_node(&self, node: Node) -> VnodeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.nodes.lock().insert(id, node);
        id
    }

    fn vnode_for(self: &Arc<Self>, id: VnodeId) -> Result<Arc<Vnode>, Errno> {
        if let Some(vn) = self.vnodes.lock().get(&id) {
            return Ok(vn.clone());
        }
        let (vtype, size, rdev) = {
            let nodes = self.nodes.lock();
            let node = nodes.get(&id).ok_or(Errno::ENOENT)?;
            (node.vtype, node.data.len() as u64, node.rdev)
        };
        let vn = Vnode::new(id, vtype, Box::new(TestOps { inner: self.clone() }));
        vn.set_size(size);
        vn.rdev.store(rdev, Ordering::Relaxed);
        self.vnodes.lock().insert(id, vn.clone());
        Ok(vn)
    }

    fn with_dir<R>(
        &self,
        dir: VnodeId,
        f: impl FnOnce(&mut Node) -> Result<R, Errno>,
    ) -> Result<R, Errno> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&dir).ok_or(Errno::ENOENT)?;
        if node.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        f(node)
    }
}

struct TestOps {
    inner: Arc<Inner>,
}

impl VnodeOps for TestOps {
    fn lookup(&self, dir: &Vnode, name: &str) -> Result<Arc<Vnode>, Errno> {
        let id = self.inner.with_dir(dir.id, |node| {
            node.entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .ok_or(Errno::ENOENT)
        })?;
        self.inner.vnode_for(id)
    }

    fn read(&self, vn: &Vnode, off: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&vn.id).ok_or(Errno::ENOENT)?;
        let off = off as usize;
        if off >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - off);
        buf[..n].copy_from_slice(&node.data[off..off + n]);
        Ok(n)
    }

    fn write(&self, vn: &Vnode, off: u64, buf: &[u8]) -> Result<usize, Errno> {
        let mut nodes = self.inner.nodes.lock();
        let node = nodes.get_mut(&vn.id).ok_or(Errno::ENOENT)?;
        let off = off as usize;
        if node.data.len() < off + buf.len() {
            node.data.resize(off + buf.len(), 0);
        }
        node.data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn readdir(&self, dir: &Vnode, cookie: u16) -> Result<Option<(DirEntry, u16)>, Errno> {
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&dir.id).ok_or(Errno::ENOENT)?;
        if node.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        let index = cookie as usize;
        let Some((name, id)) = node.entries.get(index) else {
            return Ok(None);
        };
        let vtype = nodes.get(id).map_or(VnodeType::Reg, |n| n.vtype);
        Ok(Some((
            DirEntry { id: *id, name: name.clone(), vtype },
            cookie + 1,
        )))
    }

    fn create(&self, dir: &Vnode, name: &str, _mode: u32) -> Result<Arc<Vnode>, Errno> {
        self.make_child(dir, name, Node::new(VnodeType::Reg))
    }

    fn mknod(
        &self,
        dir: &Vnode,
        name: &str,
        vtype: VnodeType,
        rdev: u64,
    ) -> Result<Arc<Vnode>, Errno> {
        let mut node = Node::new(vtype);
        node.rdev = rdev;
        self.make_child(dir, name, node)
    }

    fn mkdir(&self, dir: &Vnode, name: &str, _mode: u32) -> Result<Arc<Vnode>, Errno> {
        self.make_child(dir, name, Node::new(VnodeType::Dir))
    }

    fn rmdir(&self, dir: &Vnode, name: &str) -> Result<(), Errno> {
        let victim = self.inner.with_dir(dir.id, |node| {
            node.entries
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .ok_or(Errno::ENOENT)
        })?;
        {
            let nodes = self.inner.nodes.lock();
            let target = nodes.get(&victim).ok_or(Errno::ENOENT)?;
            if target.vtype != VnodeType::Dir {
                return Err(Errno::ENOTDIR);
            }
            if !target.entries.is_empty() {
                return Err(Errno::ENOTEMPTY);
            }
        }
        self.inner.with_dir(dir.id, |node| {
            node.entries.retain(|(n, _)| n != name);
            Ok(())
        })?;
        self.inner.nodes.lock().remove(&victim);
        self.inner.vnodes.lock().remove(&victim);
        Ok(())
    }

    fn link(&self, dir: &Vnode, name: &str, vn: &Arc<Vnode>) -> Result<(), Errno> {
        self.inner.with_dir(dir.id, |node| {
            if node.entries.iter().any(|(n, _)| n == name) {
                return Err(Errno::EEXIST);
            }
            node.entries.push((name.to_string(), vn.id));
            Ok(())
        })?;
        if let Some(target) = self.inner.nodes.lock().get_mut(&vn.id) {
            target.nlink += 1;
        }
        Ok(())
    }

    fn unlink(&self, dir: &Vnode, name: &str) -> Result<(), Errno> {
        let victim = self.inner.with_dir(dir.id, |node| {
            let pos = node
                .entries
                .iter()
                .position(|(n, _)| n == name)
                .ok_or(Errno::ENOENT)?;
            let (_, id) = node.entries.remove(pos);
            Ok(id)
        })?;
        let mut nodes = self.inner.nodes.lock();
        if let Some(target) = nodes.get_mut(&victim) {
            if target.vtype == VnodeType::Dir {
                return Err(Errno::EISDIR);
            }
            target.nlink -= 1;
            if target.nlink == 0 {
                nodes.remove(&victim);
                self.inner.vnodes.lock().remove(&victim);
            }
        }
        Ok(())
    }

    fn symlink(&self, dir: &Vnode, name: &str, target: &str) -> Result<Arc<Vnode>, Errno> {
        let mut node = Node::new(VnodeType::Lnk);
        node.target = target.to_string();
        node.data = target.as_bytes().to_vec();
        self.make_child(dir, name, node)
    }

    fn readlink(&self, vn: &Vnode) -> Result<String, Errno> {
        let nodes = self.inner.nodes.lock();
        let node = nodes.get(&vn.id).ok_or(Errno::ENOENT)?;
        if node.vtype != VnodeType::Lnk {
            return Err(Errno::EINVAL);
        }
        Ok(node.target.clone())
    }

    fn rename(
        &self,
        dir: &Vnode,
        old_name: &str,
        new_dir: &Vnode,
        new_name: &str,
    ) -> Result<(), Errno> {
        let id = self.inner.with_dir(dir.id, |node| {
            let pos = node
                .entries
                .iter()
                .position(|(n, _)| n == old_name)
                .ok_or(Errno::ENOENT)?;
            let (_, id) = node.entries.remove(pos);
            Ok(id)
        })?;
        self.inner.with_dir(new_dir.id, |node| {
            node.entries.retain(|(n, _)| n != new_name);
            node.entries.push((new_name.to_string(), id));
            Ok(())
        })
    }

    fn getpage(&self, vn: &Vnode, off: u64) -> Result<Arc<crate::mm::frames::Page>, Errno> {
        // Hand out stable fake frames keyed by (vnode, offset).
        crate::mm::frames::PhysAllocator::new()
            .alloc_nonowned_pages_at(
                crate::addr::PhysAddr::new(0x8000_0000 + vn.id * 0x10_0000 + off),
                1,
                crate::mm::PageSize::Size4K,
            )
            .map_err(|_| Errno::EIO)?
            .pop()
            .ok_or(Errno::EIO)
    }
}

impl TestOps {
    fn make_child(&self, dir: &Vnode, name: &str, node: Node) -> Result<Arc<Vnode>, Errno> {
        let vtype = node.vtype;
        let id = {
            let exists = self.inner.with_dir(dir.id, |d| {
                Ok(d.entries.iter().any(|(n, _)| n == name))
            })?;
            if exists {
                return Err(Errno::EEXIST);
            }
            self.inner.alloc_node(node)
        };
        self.inner.with_dir(dir.id, |d| {
            d.entries.push((name.to_string(), id));
            Ok(())
        })?;
        let vn = self.inner.vnode_for(id)?;
        debug_assert_eq!(vn.vtype, vtype);
        if let Some(vfs) = dir.vfs() {
            vfs.adopt_vnode(&vn);
        }
        vn.parent_id.store(dir.id, Ordering::Relaxed);
        Ok(vn)
    }
}

struct TestVfsOps {
    inner: Arc<Inner>,
}

impl VfsOps for TestVfsOps {
    fn mount(&self, _vfs: &Arc<Vfs>) -> Result<Arc<Vnode>, Errno> {
        let root_id = self.inner.alloc_node(Node::new(VnodeType::Dir));
        self.inner.vnode_for(root_id)
    }

    fn unmount(&self, _vfs: &Arc<Vfs>) -> Result<(), Errno> {
        Ok(())
    }
}

fn make_ops() -> Box<dyn VfsOps> {
    Box::new(TestVfsOps {
        inner: Arc::new(Inner {
            nodes: SpinMutex::new(BTreeMap::new()),
            vnodes: SpinMutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }),
    })
}

/// The registered test filesystem type (leaked once per process).
pub(crate) fn fs_type() -> &'static FsType {
    use std::sync::OnceLock;
    static TYPE: OnceLock<&'static FsType> = OnceLock::new();
    TYPE.get_or_init(|| {
        let t: &'static FsType = Box::leak(Box::new(FsType { name: "testfs", make_ops }));
        super::register_fs_type(t);
        t
    })
}
