//! Memory syscalls.

extern crate alloc;

use alloc::sync::Arc;

use orion_syscall::Errno;
use orion_syscall::flags::{MapFlags, Prot};

use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::mm::frames::Page;
use crate::mm::vmm::{AnonBacking, VmError, VmFlags};
use crate::mm::PageSize;

/// Demand-zero backing for anonymous mappings.
struct ZeroBacking;

impl AnonBacking for ZeroBacking {
    fn get_page(&self, _off: u64) -> Result<Arc<Page>, VmError> {
        let page = crate::mm::frames::with_pmm(|pmm| pmm.alloc_pages_size(1, PageSize::Size4K))
            .map_err(|_| VmError::OutOfMemory)?
            .pop()
            .expect("one page requested");
        #[cfg(target_os = "none")]
        {
            // SAFETY: The page is fresh and unmapped.
            let buf = unsafe {
                crate::mm::highmem::phys_slice_mut(page.address(), PAGE_SIZE as usize)
            };
            buf.fill(0);
        }
        Ok(page)
    }
}

fn vm_flags(prot: Prot, flags: MapFlags) -> VmFlags {
    let mut vm = VmFlags::USER;
    if prot.contains(Prot::READ) {
        vm |= VmFlags::READ;
    }
    if prot.contains(Prot::WRITE) {
        vm |= VmFlags::WRITE;
    }
    if prot.contains(Prot::EXEC) {
        vm |= VmFlags::EXEC;
    }
    if flags.contains(MapFlags::FIXED) {
        vm |= VmFlags::FIXED | VmFlags::REPLACE;
    }
    if flags.contains(MapFlags::SHARED) {
        vm |= VmFlags::SHARED;
    }
    if flags.contains(MapFlags::STACK) {
        vm |= VmFlags::STACK;
    }
    vm
}

pub fn sys_mmap(
    addr: usize,
    len: usize,
    prot: usize,
    flags: usize,
    fd: usize,
    offset: usize,
) -> Result<isize, Errno> {
    let prot = Prot::from_bits_truncate(prot as u32);
    let map_flags = MapFlags::from_bits_truncate(flags as u32);
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let len = (len as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let space = proc.space().ok_or(Errno::ESRCH)?;
    let hint = if addr == 0 {
        VirtAddr::new_truncate(0x0000_4000_0000_0000)
    } else {
        VirtAddr::new_truncate(addr as u64)
    };

    let base = if map_flags.contains(MapFlags::ANON) {
        space
            .vmap_anon(hint, len, len, Arc::new(ZeroBacking), vm_flags(prot, map_flags), "mmap")
            .map_err(VmError::to_errno)?
    } else {
        // File mapping: pull the pages through the file's page cache.
        let file = proc.ftable.get(fd as i32)?;
        let vnode = file.vnode().clone();
        let base_off = offset as u64;
        let mut pages = alloc::vec::Vec::new();
        for i in 0..len / PAGE_SIZE {
            let page = vnode.get_page(base_off + i * PAGE_SIZE)?;
            pages.push(page);
        }
        let pages = if map_flags.contains(MapFlags::PRIVATE) {
            crate::mm::frames::alloc_cow_pages(&pages)
        } else {
            pages
        };
        space
            .vmap_pages(hint, pages, vm_flags(prot, map_flags), "mmap_file")
            .map_err(VmError::to_errno)?
    };
    Ok(base.as_u64() as isize)
}

pub fn sys_munmap(addr: usize, len: usize) -> Result<isize, Errno> {
    if addr as u64 % PAGE_SIZE != 0 || len == 0 {
        return Err(Errno::EINVAL);
    }
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let space = proc.space().ok_or(Errno::ESRCH)?;
    space
        .unmap(VirtAddr::new_truncate(addr as u64))
        .map_err(VmError::to_errno)?;
    Ok(0)
}
