//! Open files and the per-process descriptor table.
//!
//! A [`File`] is the open-file object several descriptors may share
//! (`dup`, forked tables): open flags, the current offset (guarded by
//! the per-file lock; the vnode's own locks guard data), and the linked
//! vnode. The [`Ftable`] maps descriptor numbers to files through a
//! find-first-zero bitmap bounded by `MAX_FILES`.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use orion_syscall::flags::{OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET};
use orion_syscall::{Errno, MAX_FILES, Stat};

use crate::sync::{Mutex, SpinMutex};

use super::ventry::Ventry;
use super::vnode::{DirEntry, Vnode, VnodeType};

/// An open file.
pub struct File {
    flags: OpenFlags,
    vnode: Arc<Vnode>,
    /// The ventry the file was opened through (path-derived ops).
    ventry: SpinMutex<Option<Arc<Ventry>>>,
    /// Byte offset for sequential I/O; the per-file lock guards it.
    offset: Mutex<u64>,
    /// Directory-stream cookie for `readdir`/`telldir`/`seekdir`.
    dirpos: SpinMutex<u16>,
}

impl File {
    /// Opens a resolved ventry.
    pub fn open(ventry: &Arc<Ventry>, flags: OpenFlags) -> Result<Arc<Self>, Errno> {
        let vnode = ventry.vnode()?;
        if flags.contains(OpenFlags::O_DIRECTORY) && vnode.vtype != VnodeType::Dir {
            return Err(Errno::ENOTDIR);
        }
        if vnode.vtype == VnodeType::Dir && flags.writable() {
            return Err(Errno::EISDIR);
        }
        vnode.load()?;
        let file = Arc::new(Self {
            flags,
            vnode,
            ventry: SpinMutex::new(Some(ventry.clone())),
            offset: Mutex::named("file", 0),
            dirpos: SpinMutex::new(0),
        });
        if flags.contains(OpenFlags::O_TRUNC) && file.vnode.vtype == VnodeType::Reg {
            file.vnode.set_size(0);
        }
        if flags.contains(OpenFlags::O_APPEND) {
            *file.offset.lock() = file.vnode.size();
        }
        Ok(file)
    }

    /// Wraps a bare vnode (pipes, devices without a path).
    #[must_use]
    pub fn from_vnode(vnode: Arc<Vnode>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            flags,
            vnode,
            ventry: SpinMutex::new(None),
            offset: Mutex::named("file", 0),
            dirpos: SpinMutex::new(0),
        })
    }

    /// The open flags.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The underlying vnode.
    #[must_use]
    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    /// The ventry the file was opened through, if any.
    #[must_use]
    pub fn ventry(&self) -> Option<Arc<Ventry>> {
        self.ventry.lock().clone()
    }

    /// The current offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    /// Sequential read: advances the offset by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if !self.flags.readable() {
            return Err(Errno::EBADF);
        }
        let mut offset = self.offset.lock();
        let n = self.vnode.read_at(*offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    /// Sequential write: advances the offset by the bytes written.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if !self.flags.writable() {
            return Err(Errno::EBADF);
        }
        let mut offset = self.offset.lock();
        if self.flags.contains(OpenFlags::O_APPEND) {
            *offset = self.vnode.size();
        }
        let n = self.vnode.write_at(*offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    /// Positioned read: the file offset is untouched.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        if !self.flags.readable() {
            return Err(Errno::EBADF);
        }
        self.vnode.read_at(offset, buf)
    }

    /// Positioned write: the file offset is untouched.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize, Errno> {
        if !self.flags.writable() {
            return Err(Errno::EBADF);
        }
        self.vnode.write_at(offset, buf)
    }

    /// Repositions the offset. Returns the new offset.
    pub fn seek(&self, offset: i64, whence: u32) -> Result<u64, Errno> {
        if matches!(self.vnode.vtype, VnodeType::Fifo | VnodeType::Sock) {
            return Err(Errno::ESPIPE);
        }
        let mut cur = self.offset.lock();
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *cur as i64,
            SEEK_END => self.vnode.size() as i64,
            _ => return Err(Errno::EINVAL),
        };
        let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        *cur = target as u64;
        Ok(*cur)
    }

    /// Fills a [`Stat`] from the vnode.
    pub fn stat(&self) -> Result<Stat, Errno> {
        stat_vnode(&self.vnode)
    }

    /// Reads the next directory entry, advancing the stream.
    pub fn readdir(&self) -> Result<Option<DirEntry>, Errno> {
        let mut pos = self.dirpos.lock();
        match self.vnode.readdir(*pos)? {
            Some((entry, next)) => {
                *pos = next;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// The current directory-stream cookie.
    #[must_use]
    pub fn telldir(&self) -> u16 {
        *self.dirpos.lock()
    }

    /// Repositions the directory stream to a cookie from [`File::telldir`].
    pub fn seekdir(&self, cookie: u16) {
        *self.dirpos.lock() = cookie;
    }

    /// Rewinds the directory stream.
    pub fn rewinddir(&self) {
        *self.dirpos.lock() = 0;
    }

    /// Device control, forwarded through the vnode.
    pub fn ioctl(&self, request: u32, arg: usize) -> Result<usize, Errno> {
        self.vnode.ioctl(request, arg)
    }
}

/// Fills a [`Stat`] for a vnode.
pub fn stat_vnode(vnode: &Arc<Vnode>) -> Result<Stat, Errno> {
    vnode.load()?;
    let size = vnode.size();
    Ok(Stat {
        st_dev: vnode.vfs().map_or(0, |v| v.id),
        st_ino: vnode.id,
        st_mode: vnode.vtype.mode_bits() | 0o644,
        st_nlink: vnode.nlink(),
        st_rdev: vnode.rdev.load(core::sync::atomic::Ordering::Relaxed),
        st_size: size,
        st_blksize: crate::addr::PAGE_SIZE as u32,
        st_blocks: size.div_ceil(512),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// The descriptor table
// ---------------------------------------------------------------------------

/// Words in the fd bitmap.
const BITMAP_WORDS: usize = MAX_FILES / 64;

struct FtableInner {
    /// Bit n set = fd n in use.
    bitmap: [u64; BITMAP_WORDS],
    map: BTreeMap<i32, Arc<File>>,
}

/// A per-process file descriptor table.
pub struct Ftable {
    inner: SpinMutex<FtableInner>,
}

impl Ftable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinMutex::named(
                "ftable",
                FtableInner { bitmap: [0; BITMAP_WORDS], map: BTreeMap::new() },
            ),
        }
    }

    /// Allocates the lowest free descriptor at or above `min` and binds
    /// `file` to it.
    pub fn add_file_from(&self, file: Arc<File>, min: i32) -> Result<i32, Errno> {
        let mut inner = self.inner.lock();
        let start = min.max(0) as usize;
        for fd in start..MAX_FILES {
            let (word, bit) = (fd / 64, fd % 64);
            if inner.bitmap[word] & (1 << bit) == 0 {
                inner.bitmap[word] |= 1 << bit;
                inner.map.insert(fd as i32, file);
                return Ok(fd as i32);
            }
        }
        Err(Errno::EMFILE)
    }

    /// Allocates the lowest free descriptor and binds `file` to it.
    pub fn add_file(&self, file: Arc<File>) -> Result<i32, Errno> {
        self.add_file_from(file, 0)
    }

    /// Binds `file` to a specific descriptor, closing any previous one.
    pub fn install_at(&self, fd: i32, file: Arc<File>) -> Result<(), Errno> {
        if fd < 0 || fd as usize >= MAX_FILES {
            return Err(Errno::EBADF);
        }
        let mut inner = self.inner.lock();
        let (word, bit) = (fd as usize / 64, fd as usize % 64);
        inner.bitmap[word] |= 1 << bit;
        inner.map.insert(fd, file);
        Ok(())
    }

    /// Looks a descriptor up.
    pub fn get(&self, fd: i32) -> Result<Arc<File>, Errno> {
        if fd < 0 {
            return Err(Errno::EBADF);
        }
        self.inner.lock().map.get(&fd).cloned().ok_or(Errno::EBADF)
    }

    /// Closes a descriptor, dropping its file reference.
    pub fn close(&self, fd: i32) -> Result<(), Errno> {
        if fd < 0 || fd as usize >= MAX_FILES {
            return Err(Errno::EBADF);
        }
        let mut inner = self.inner.lock();
        let (word, bit) = (fd as usize / 64, fd as usize % 64);
        if inner.bitmap[word] & (1 << bit) == 0 {
            return Err(Errno::EBADF);
        }
        inner.bitmap[word] &= !(1 << bit);
        inner.map.remove(&fd);
        Ok(())
    }

    /// Duplicates `fd` onto the lowest free slot at or above `min`.
    pub fn dup_from(&self, fd: i32, min: i32) -> Result<i32, Errno> {
        let file = self.get(fd)?;
        self.add_file_from(file, min)
    }

    /// Closes every descriptor (process exit).
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.bitmap = [0; BITMAP_WORDS];
        inner.map.clear();
    }

    /// Clones the table for a `COPY_FDS` fork: same open files, new
    /// bindings.
    #[must_use]
    pub fn duplicate(&self) -> Ftable {
        let inner = self.inner.lock();
        let copy = Ftable::new();
        {
            let mut dst = copy.inner.lock();
            dst.bitmap = inner.bitmap;
            dst.map = inner.map.clone();
        }
        drop(inner);
        copy
    }

    /// Number of open descriptors.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Checks the bitmap/map agreement invariant (diagnostics, tests).
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        for fd in 0..MAX_FILES {
            let (word, bit) = (fd / 64, fd % 64);
            let bit_set = inner.bitmap[word] & (1 << bit) != 0;
            if bit_set != inner.map.contains_key(&(fd as i32)) {
                return false;
            }
        }
        true
    }

    /// Snapshot of the open descriptors.
    #[must_use]
    pub fn fds(&self) -> Vec<i32> {
        self.inner.lock().map.keys().copied().collect()
    }
}

impl Default for Ftable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::tests::fresh_test_root;

    fn open_file() -> Arc<File> {
        let (_vfs, root) = fresh_test_root();
        let root_vn = root.vnode().unwrap();
        root_vn.create("data", 0o644).unwrap();
        let ve = root.find_child("data").unwrap_or_else(|| {
            let vn = root_vn.lookup("data").unwrap();
            let ve = Ventry::alloc_linked("data", &vn);
            root.add_child(&ve);
            ve
        });
        File::open(&ve, OpenFlags::O_RDWR).unwrap()
    }

    #[test]
    fn sequential_read_write_advances_offset() {
        let file = open_file();
        assert_eq!(file.write(b"hello world").unwrap(), 11);
        assert_eq!(file.offset(), 11);
        file.seek(0, SEEK_SET).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.offset(), 5);
    }

    #[test]
    fn positioned_io_leaves_offset() {
        let file = open_file();
        file.write(b"abcdef").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(file.pread(&mut buf, 2).unwrap(), 2);
        assert_eq!(&buf, b"cd");
        assert_eq!(file.offset(), 6);
        file.pwrite(b"XY", 0).unwrap();
        assert_eq!(file.offset(), 6);
    }

    #[test]
    fn seek_whence_rules() {
        let file = open_file();
        file.write(b"0123456789").unwrap();
        assert_eq!(file.seek(4, SEEK_SET).unwrap(), 4);
        assert_eq!(file.seek(2, SEEK_CUR).unwrap(), 6);
        assert_eq!(file.seek(-1, SEEK_END).unwrap(), 9);
        assert_eq!(file.seek(-100, SEEK_CUR).err(), Some(Errno::EINVAL));
        assert_eq!(file.seek(0, 99).err(), Some(Errno::EINVAL));
    }

    #[test]
    fn readonly_rejects_writes() {
        let (_vfs, root) = fresh_test_root();
        let root_vn = root.vnode().unwrap();
        let vn = root_vn.create("ro", 0o644).unwrap();
        let ve = Ventry::alloc_linked("ro", &vn);
        root.add_child(&ve);
        let file = File::open(&ve, OpenFlags::O_RDONLY).unwrap();
        assert_eq!(file.write(b"x").err(), Some(Errno::EBADF));
    }

    #[test]
    fn directory_stream_cookies() {
        let (_vfs, root) = fresh_test_root();
        let root_vn = root.vnode().unwrap();
        for name in ["a", "b", "c"] {
            root_vn.create(name, 0o644).unwrap();
        }
        let file = File::open(&root, OpenFlags::O_RDONLY | OpenFlags::O_DIRECTORY).unwrap();

        assert_eq!(file.readdir().unwrap().unwrap().name, "a");
        let cookie = file.telldir();
        assert_eq!(file.readdir().unwrap().unwrap().name, "b");
        assert_eq!(file.readdir().unwrap().unwrap().name, "c");
        assert!(file.readdir().unwrap().is_none());

        // seekdir returns to the recorded position.
        file.seekdir(cookie);
        assert_eq!(file.readdir().unwrap().unwrap().name, "b");
        file.rewinddir();
        assert_eq!(file.readdir().unwrap().unwrap().name, "a");
    }

    #[test]
    fn ftable_bitmap_invariant() {
        let table = Ftable::new();
        let file = open_file();
        let fd0 = table.add_file(file.clone()).unwrap();
        let fd1 = table.add_file(file.clone()).unwrap();
        assert_eq!((fd0, fd1), (0, 1));
        assert!(table.is_consistent());

        table.close(fd0).unwrap();
        assert!(table.is_consistent());
        // The freed slot is reused first.
        let fd2 = table.add_file(file.clone()).unwrap();
        assert_eq!(fd2, 0);

        assert_eq!(table.close(99).err(), Some(Errno::EBADF));
        assert!(table.is_consistent());
    }

    #[test]
    fn dup_shares_the_open_file() {
        let table = Ftable::new();
        let file = open_file();
        let fd = table.add_file(file).unwrap();
        let dup = table.dup_from(fd, 3).unwrap();
        assert!(dup >= 3);
        // Shared offset: writes through one fd move the other's position.
        table.get(fd).unwrap().write(b"xyz").unwrap();
        assert_eq!(table.get(dup).unwrap().offset(), 3);
    }

    #[test]
    fn duplicate_is_independent_table() {
        let table = Ftable::new();
        let file = open_file();
        let fd = table.add_file(file).unwrap();
        let copy = table.duplicate();
        copy.close(fd).unwrap();
        assert!(table.get(fd).is_ok());
        assert_eq!(copy.open_count(), 0);
        assert_eq!(table.open_count(), 1);
    }
}
