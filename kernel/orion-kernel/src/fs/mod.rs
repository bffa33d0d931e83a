//! The virtual filesystem layer.
//!
//! Filesystem drivers implement [`VnodeOps`] and [`VfsOps`] and register a
//! [`FsType`] in the `.orion_fs_types` linker section; everything above
//! that contract — the ventry name cache, vnode lifecycle, mount graph,
//! path resolution, and the per-process file table — is shared:
//!
//! - [`vnode`] — filesystem-owned objects with metadata/data locks and a
//!   page cache.
//! - [`ventry`] — the name cache: parent/child links, hardlink binding,
//!   and the mount-point vnode shadow swap.
//! - [`vfs`] — mounted filesystem instances and the mount graph.
//! - [`vcache`] — the absolute-path resolution cache.
//! - [`vresolve`] — path walking (mounts, symlinks, `..`).
//! - [`file`] — open files and the fd table.

extern crate alloc;

pub mod file;
pub mod path;
#[cfg(test)]
pub(crate) mod testfs;
pub mod vcache;
pub mod ventry;
pub mod vfs;
pub mod vnode;
pub mod vresolve;

pub use file::{File, Ftable};
pub use ventry::{Ventry, VentryFlags};
pub use vfs::{Vfs, VfsState};
pub use vnode::{DirEntry, Vnode, VnodeFlags, VnodeId, VnodeOps, VnodeState, VnodeType};
pub use vresolve::{Resolved, VrFlags, vresolve};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use orion_syscall::Errno;
use orion_syscall::flags::OpenFlags;

/// Maximum symlink depth during resolution.
pub const MAX_LINK_DEPTH: u32 = 32;

/// The driver half of a mounted filesystem.
pub trait VfsOps: Send + Sync {
    /// Mounts the filesystem, returning its root vnode.
    fn mount(&self, vfs: &Arc<Vfs>) -> Result<Arc<Vnode>, Errno>;
    /// Unmounts; every dirty vnode was saved before this call.
    fn unmount(&self, vfs: &Arc<Vfs>) -> Result<(), Errno>;
    /// Flushes filesystem-wide state.
    fn sync(&self, _vfs: &Arc<Vfs>) -> Result<(), Errno> {
        Ok(())
    }
}

/// A registered filesystem type.
pub struct FsType {
    /// The mount-type name (`ramfs`, `devfs`, `initrd`, …).
    pub name: &'static str,
    /// Builds the ops instance for one mount.
    pub make_ops: fn() -> Box<dyn VfsOps>,
}

orion_linkset::declare_linkset! {
    /// Returns the filesystem types registered via the linker section.
    pub fn fs_type_entries() -> [FsType],
    section = "orion_fs_types"
}

/// Runtime-registered filesystem types (tests, late-bound drivers).
static EXTRA_FS_TYPES: crate::sync::SpinMutex<Vec<&'static FsType>> =
    crate::sync::SpinMutex::named("FS_TYPES", Vec::new());

/// Registers a filesystem type at runtime.
pub fn register_fs_type(fstype: &'static FsType) {
    EXTRA_FS_TYPES.lock().push(fstype);
}

/// Finds a filesystem type by name.
#[must_use]
pub fn find_fs_type(name: &str) -> Option<&'static FsType> {
    if let Some(t) = EXTRA_FS_TYPES.lock().iter().find(|t| t.name == name) {
        return Some(t);
    }
    #[cfg(target_os = "none")]
    {
        return fs_type_entries().iter().find(|t| t.name == name);
    }
    #[cfg(not(target_os = "none"))]
    None
}

// ---------------------------------------------------------------------------
// Kernel-side convenience wrappers
// ---------------------------------------------------------------------------

/// Opens a path from the kernel (no process fd involved).
pub fn kopen(path: &str, flags: OpenFlags) -> Result<Arc<File>, Errno> {
    let root = vfs::root_ventry().ok_or(Errno::ENOENT)?;
    let mut vr = VrFlags::empty();
    if flags.contains(OpenFlags::O_NOFOLLOW) {
        vr |= VrFlags::NOFOLLOW;
    }
    if flags.contains(OpenFlags::O_DIRECTORY) {
        vr |= VrFlags::DIR;
    }
    let resolved = vresolve(&root, path, vr)?;
    let Resolved::Found(ve) = resolved else {
        return Err(Errno::ENOENT);
    };
    File::open(&ve, flags)
}

/// Reads an entire file into memory.
pub fn read_whole(file: &Arc<File>) -> Result<Vec<u8>, Errno> {
    let size = file.vnode().size() as usize;
    let mut buf = alloc::vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = file.pread(&mut buf[done..], done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    buf.truncate(done);
    Ok(buf)
}

/// [`crate::proc::exec::ImageSource`] over an open file's page cache.
pub struct FileImageSource {
    file: Arc<File>,
}

impl FileImageSource {
    /// Wraps an open file.
    #[must_use]
    pub fn new(file: &Arc<File>) -> Self {
        Self { file: file.clone() }
    }
}

impl crate::proc::exec::ImageSource for FileImageSource {
    fn cached_page(&self, off: u64) -> Result<Arc<crate::mm::frames::Page>, Errno> {
        self.file.vnode().get_page(off)
    }

    fn private_page(
        &self,
        off: u64,
        file_bytes: usize,
    ) -> Result<Arc<crate::mm::frames::Page>, Errno> {
        let page = crate::mm::frames::with_pmm(|pmm| {
            pmm.alloc_pages_size(1, crate::mm::PageSize::Size4K)
        })
        .map_err(|_| Errno::ENOMEM)?
        .pop()
        .expect("one page requested");

        #[cfg(target_os = "none")]
        {
            // SAFETY: The page was just allocated and is mapped nowhere.
            let buf = unsafe {
                crate::mm::highmem::phys_slice_mut(
                    page.address(),
                    crate::addr::PAGE_SIZE as usize,
                )
            };
            buf.fill(0);
            if file_bytes > 0 {
                let _ = self.file.pread(&mut buf[..file_bytes], off)?;
            }
        }
        #[cfg(not(target_os = "none"))]
        let _ = (off, file_bytes);

        Ok(page)
    }
}
