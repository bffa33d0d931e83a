//! The live page-table mapper.
//!
//! Implements the VMM's [`PageTableOps`] over real 4-level x86-64 page
//! tables, reached through the direct physical window. Intermediate
//! table frames come from the frame allocator and stay pinned on the
//! mapper so they return to their zone when the address space dies.

extern crate alloc;

use crate::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::mm::frames::PageList;
use crate::mm::vmm::{PageTableOps, VmError, VmFlags};
use crate::mm::PageSize;

/// PTE flag bits.
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_WRITETHRU: u64 = 1 << 3;
const PTE_NOCACHE: u64 = 1 << 4;
const PTE_LARGE: u64 = 1 << 7;
const PTE_GLOBAL: u64 = 1 << 8;
const PTE_NX: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Translates mapping flags into leaf PTE bits.
fn pte_flags(flags: VmFlags) -> u64 {
    let mut pte = PTE_PRESENT;
    if flags.contains(VmFlags::WRITE) {
        pte |= PTE_WRITE;
    }
    if flags.contains(VmFlags::USER) {
        pte |= PTE_USER;
    }
    if flags.contains(VmFlags::NOCACHE) {
        pte |= PTE_NOCACHE | PTE_WRITETHRU;
    }
    if !flags.contains(VmFlags::USER) {
        pte |= PTE_GLOBAL;
    }
    if !flags.contains(VmFlags::EXEC) {
        pte |= PTE_NX;
    }
    pte
}

fn table_mut(phys: PhysAddr) -> &'static mut [u64; 512] {
    // SAFETY: Table frames are RAM covered by the direct window; the
    // address-space lock serializes edits.
    unsafe { &mut *crate::mm::highmem::phys_to_virt(phys).as_mut_ptr::<[u64; 512]>() }
}

/// The live mapper bound to one root table.
pub struct PageTableMapper {
    root: PhysAddr,
    /// Intermediate table frames owned by this address space.
    table_pages: PageList,
}

impl PageTableMapper {
    /// Wraps an existing root table (the kernel's, from boot).
    #[must_use]
    pub fn new(root: PhysAddr) -> Self {
        Self { root, table_pages: PageList::new() }
    }

    /// Allocates a fresh, zeroed root table for a user address space,
    /// sharing the kernel half of the given kernel root.
    pub fn new_user(kernel_root: PhysAddr) -> Result<(PhysAddr, Self), VmError> {
        let mut pages = crate::mm::frames::with_pmm(|pmm| {
            pmm.alloc_pages_size(1, PageSize::Size4K)
        })
        .map_err(|_| VmError::OutOfMemory)?;
        let page = pages.pop().expect("one page requested");
        let root = page.address();

        let new_table = table_mut(root);
        new_table.fill(0);
        // Share the kernel half (PML4 entries 256..512).
        let kernel_table = table_mut(kernel_root);
        new_table[256..].copy_from_slice(&kernel_table[256..]);

        let mut mapper = Self { root, table_pages: PageList::new() };
        mapper.table_pages.push(page);
        Ok((root, mapper))
    }

    /// Walks to the table at `level` (3 = PDPT … 1 = PT), creating
    /// missing intermediate tables.
    fn walk_create(&mut self, va: VirtAddr, target_level: u8) -> Result<PhysAddr, VmError> {
        let mut table = self.root;
        let indices = [va.pml4_index(), va.pdpt_index(), va.pd_index()];
        let mut level = 4u8;
        for &index in &indices {
            if level == target_level {
                break;
            }
            let entries = table_mut(table);
            let entry = entries[index];
            if entry & PTE_PRESENT == 0 {
                let mut pages = crate::mm::frames::with_pmm(|pmm| {
                    pmm.alloc_pages_size(1, PageSize::Size4K)
                })
                .map_err(|_| VmError::OutOfMemory)?;
                let page = pages.pop().expect("one page requested");
                table_mut(page.address()).fill(0);
                // Intermediate entries stay permissive; leaves restrict.
                entries[index] =
                    page.address().as_u64() | PTE_PRESENT | PTE_WRITE | PTE_USER;
                self.table_pages.push(page);
            }
            table = PhysAddr::new(entries[index] & ADDR_MASK);
            level -= 1;
        }
        Ok(table)
    }

    fn leaf_slot(&mut self, va: VirtAddr, size: PageSize) -> Result<(PhysAddr, usize, u64), VmError> {
        match size {
            PageSize::Size4K => Ok((self.walk_create(va, 1)?, va.pt_index(), 0)),
            PageSize::Size2M => Ok((self.walk_create(va, 2)?, va.pd_index(), PTE_LARGE)),
            PageSize::Size1G => Ok((self.walk_create(va, 3)?, va.pdpt_index(), PTE_LARGE)),
        }
    }
}

impl PageTableOps for PageTableMapper {
    fn map(&mut self, va: VirtAddr, pa: PhysAddr, size: PageSize, flags: VmFlags) -> Result<(), VmError> {
        let (table, index, large) = self.leaf_slot(va, size)?;
        table_mut(table)[index] = (pa.as_u64() & ADDR_MASK) | pte_flags(flags) | large;
        Ok(())
    }

    fn unmap(&mut self, va: VirtAddr, len: u64) {
        let mut cursor = va.as_u64();
        let end = cursor + len;
        while cursor < end {
            let va = VirtAddr::new_truncate(cursor);
            if let Ok(table) = self.walk_create(va, 1) {
                table_mut(table)[va.pt_index()] = 0;
            }
            super::tlb::invalidate_page(va);
            cursor += PAGE_SIZE;
        }
    }

    fn protect(&mut self, va: VirtAddr, len: u64, flags: VmFlags) {
        let pte = pte_flags(flags);
        let mut cursor = va.as_u64();
        let end = cursor + len;
        while cursor < end {
            let va = VirtAddr::new_truncate(cursor);
            if let Ok(table) = self.walk_create(va, 1) {
                let entries = table_mut(table);
                let entry = entries[va.pt_index()];
                if entry & PTE_PRESENT != 0 {
                    entries[va.pt_index()] = (entry & ADDR_MASK) | pte;
                }
            }
            super::tlb::invalidate_page(va);
            cursor += PAGE_SIZE;
        }
    }

    fn query(&self, va: VirtAddr) -> Option<PhysAddr> {
        let mut table = self.root;
        for (level, index) in [
            (4u8, va.pml4_index()),
            (3, va.pdpt_index()),
            (2, va.pd_index()),
            (1, va.pt_index()),
        ] {
            let entry = table_mut(table)[index];
            if entry & PTE_PRESENT == 0 {
                return None;
            }
            if level != 1 && entry & PTE_LARGE != 0 {
                let base = entry & ADDR_MASK;
                let offset_bits = if level == 3 { 30 } else { 21 };
                let offset = va.as_u64() & ((1 << offset_bits) - 1);
                return Some(PhysAddr::new(base + offset));
            }
            if level == 1 {
                return Some(PhysAddr::new((entry & ADDR_MASK) + va.page_offset()));
            }
            table = PhysAddr::new(entry & ADDR_MASK);
        }
        None
    }

    fn copy_page(&mut self, dst: PhysAddr, src: PhysAddr) {
        // SAFETY: Both frames are RAM in the direct window; dst was just
        // allocated and src is read-only during CoW resolution.
        unsafe {
            let src = crate::mm::highmem::phys_to_virt(src).as_ptr::<u8>();
            let dst = crate::mm::highmem::phys_to_virt(dst).as_mut_ptr::<u8>();
            core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE as usize);
        }
    }
}
