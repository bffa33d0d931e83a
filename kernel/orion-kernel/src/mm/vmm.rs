//! Virtual memory manager.
//!
//! Each [`AddressSpace`] holds an interval tree of [`VmMapping`]s over its
//! half of the canonical address space plus the page-table editing hooks
//! behind one spin mutex. Mappings carry homogeneous protection; updating
//! a sub-range splits the mapping into adjacent linked siblings. Faults
//! resolve demand (ANON) pages and copy-on-write, or report the signal the
//! offender should receive.
//!
//! Page-table edits go through the [`PageTableOps`] trait so the core
//! logic is independent of the live MMU (the arch layer supplies the real
//! implementation; tests use a shadow mapper).

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::mm::frames::{self, Page, PageFlags, PageList};
use crate::mm::intvl::IntervalMap;
use crate::mm::PageSize;
use crate::sync::SpinMutex;

bitflags! {
    /// Mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
        /// Lives in the user half.
        const USER = 1 << 3;
        /// The hint is the required address.
        const FIXED = 1 << 4;
        /// Grows down; reserve a guard page below the data.
        const STACK = 1 << 5;
        /// Install 2 MiB leaf entries.
        const HUGE_2MB = 1 << 6;
        /// Install 1 GiB leaf entries.
        const HUGE_1GB = 1 << 7;
        /// Cache-disabled.
        const NOCACHE = 1 << 8;
        /// With FIXED: unmap any overlapping non-reserved mappings.
        const REPLACE = 1 << 9;
        /// Changes are shared across forks.
        const SHARED = 1 << 10;
        // Internal state bits.
        /// Leaf entries are currently installed.
        const MAPPED = 1 << 16;
        /// This mapping was split and continues into its successor.
        const LINKED = 1 << 17;
        /// This mapping is a latter piece of a split.
        const SPLIT = 1 << 18;
    }
}

impl VmFlags {
    /// The protection bits.
    pub const PROT_MASK: VmFlags =
        VmFlags::READ.union(VmFlags::WRITE).union(VmFlags::EXEC);
}

/// Mapping kinds, by backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Reserves address space; no backing, never faults in.
    Rsvd,
    /// Direct physical mapping (MMIO, framebuffers).
    Phys,
    /// Backed by an explicit page list.
    Page,
    /// Demand-paged through an [`AnonBacking`] callback.
    Anon,
}

/// Errors from address-space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No hole of the requested size exists.
    NoVirtualSpace,
    /// Out of physical memory.
    OutOfMemory,
    /// The requested range is bad (unaligned, outside the space).
    BadRange,
    /// A FIXED request overlaps an existing mapping.
    Exists,
    /// No mapping covers the address.
    NotMapped,
}

impl VmError {
    /// Maps into the errno namespace.
    #[must_use]
    pub fn to_errno(self) -> orion_syscall::Errno {
        use orion_syscall::Errno;
        match self {
            Self::NoVirtualSpace | Self::OutOfMemory => Errno::ENOMEM,
            Self::BadRange | Self::NotMapped => Errno::EINVAL,
            Self::Exists => Errno::EEXIST,
        }
    }
}

/// Demand-page provider for ANON mappings.
pub trait AnonBacking: Send + Sync {
    /// Produces the page backing byte offset `off` (page-aligned).
    fn get_page(&self, off: u64) -> Result<Arc<Page>, VmError>;
}

/// The backing of a mapping.
pub enum VmBacking {
    /// Nothing; reserved address space.
    None,
    /// Physical base address (direct map).
    Phys(PhysAddr),
    /// Explicit page list; `skip` pages of the list precede this mapping
    /// (non-zero for the latter pieces of a split).
    Pages {
        /// The pages, in virtual order.
        list: PageList,
        /// Pages of `list` belonging to earlier split siblings.
        skip: u64,
    },
    /// Demand-paged object plus the slots populated so far.
    Anon {
        /// The page provider.
        backing: Arc<dyn AnonBacking>,
        /// Populated slots keyed by page-aligned mapping offset.
        pages: BTreeMap<u64, Arc<Page>>,
    },
}

/// A contiguous virtual mapping with homogeneous protection.
pub struct VmMapping {
    /// The mapping kind.
    pub vm_type: VmType,
    /// Flags (protection + behavior + internal state).
    pub flags: VmFlags,
    /// Diagnostic name.
    pub name: String,
    /// Bytes currently in use (≤ `virt_size`).
    pub size: u64,
    /// Bytes of address space reserved.
    pub virt_size: u64,
    /// The backing store.
    pub backing: VmBacking,
}

impl VmMapping {
    /// Returns the page size leaf entries use.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        if self.flags.contains(VmFlags::HUGE_1GB) {
            PageSize::Size1G
        } else if self.flags.contains(VmFlags::HUGE_2MB) {
            PageSize::Size2M
        } else {
            PageSize::Size4K
        }
    }

    /// Returns the page backing `off` bytes into this mapping, if present.
    #[must_use]
    pub fn page_at(&self, off: u64) -> Option<&Arc<Page>> {
        match &self.backing {
            VmBacking::Pages { list, skip } => {
                let index = skip + off / self.page_size().bytes();
                list.get(index as usize)
            }
            VmBacking::Anon { pages, .. } => pages.get(&(off & !(PAGE_SIZE - 1))),
            _ => None,
        }
    }
}

/// How a page fault accessed the faulting address.
#[derive(Debug, Clone, Copy)]
pub struct FaultAccess {
    /// The access was a write.
    pub write: bool,
    /// The access was an instruction fetch.
    pub exec: bool,
    /// The access came from user mode.
    pub user: bool,
    /// The PTE was present (protection fault rather than miss).
    pub present: bool,
}

/// The outcome of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Resolved; retry the access.
    Resolved,
    /// Deliver `SIGSEGV` with the given `si_code`.
    Segv(i32),
    /// Kernel-mode fault with no recovery.
    Fatal,
}

// ---------------------------------------------------------------------------
// Page-table editing hooks
// ---------------------------------------------------------------------------

/// The page-table side of an address space.
///
/// Implementations walk/create the PML4→PDPT→PD→PT hierarchy, consuming
/// frames for intermediate tables from the frame allocator.
pub trait PageTableOps: Send {
    /// Installs a leaf entry of the given size.
    fn map(&mut self, va: VirtAddr, pa: PhysAddr, size: PageSize, flags: VmFlags)
    -> Result<(), VmError>;
    /// Removes leaf entries covering `[va, va+len)`.
    fn unmap(&mut self, va: VirtAddr, len: u64);
    /// Rewrites the protection bits of leaf entries in `[va, va+len)`.
    fn protect(&mut self, va: VirtAddr, len: u64, flags: VmFlags);
    /// Returns the physical translation of `va`, if mapped.
    fn query(&self, va: VirtAddr) -> Option<PhysAddr>;
    /// Copies one base page of memory between physical frames.
    fn copy_page(&mut self, dst: PhysAddr, src: PhysAddr);
}

struct AsInner {
    tree: IntervalMap<VmMapping>,
    mapper: Box<dyn PageTableOps>,
    min: u64,
    max: u64,
}

/// A virtual address space: mapping tree + page tables.
pub struct AddressSpace {
    /// Physical address of the root table (loaded into CR3).
    root: PhysAddr,
    user: bool,
    inner: SpinMutex<AsInner>,
}

/// Arguments to [`AddressSpace::vmap`].
pub struct VmapRequest {
    /// The mapping kind (determined by `backing` for the wrappers).
    pub vm_type: VmType,
    /// Placement hint, or the required address with [`VmFlags::FIXED`].
    pub hint: VirtAddr,
    /// Bytes to install now.
    pub size: u64,
    /// Bytes of address space to reserve (≥ `size`).
    pub virt_size: u64,
    /// Flags.
    pub flags: VmFlags,
    /// Diagnostic name.
    pub name: String,
    /// The backing store.
    pub backing: VmBacking,
}

impl AddressSpace {
    /// Creates the shared kernel address space.
    pub fn new_kernel(root: PhysAddr, mapper: Box<dyn PageTableOps>) -> Self {
        Self {
            root,
            user: false,
            inner: SpinMutex::named(
                "addrspace",
                AsInner {
                    tree: IntervalMap::new(),
                    mapper,
                    min: crate::addr::KERNEL_SPACE_START,
                    max: u64::MAX,
                },
            ),
        }
    }

    /// Creates a user address space.
    pub fn new_user(root: PhysAddr, mapper: Box<dyn PageTableOps>) -> Self {
        Self {
            root,
            user: true,
            inner: SpinMutex::named(
                "addrspace",
                AsInner {
                    tree: IntervalMap::new(),
                    mapper,
                    min: PAGE_SIZE, // never map the zero page
                    max: crate::addr::USER_SPACE_END + 1,
                },
            ),
        }
    }

    /// Physical address of the root page table.
    #[must_use]
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// Whether this is a user address space.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.user
    }

    /// Number of mappings (diagnostic).
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.inner.lock().tree.len()
    }

    // ── Mapping establishment ───────────────────────────────────────

    /// Establishes a mapping, returning its base address.
    ///
    /// With [`VmFlags::FIXED`] the hint is required exactly; otherwise a
    /// first-fit hole search runs downward from the hint in kernel space
    /// and upward in user space. [`VmFlags::STACK`] reserves one extra
    /// guard page below the returned base.
    pub fn vmap(&self, req: VmapRequest) -> Result<VirtAddr, VmError> {
        let VmapRequest { vm_type, hint, size, virt_size, mut flags, name, backing } = req;
        if size == 0 || size % PAGE_SIZE != 0 || virt_size < size || virt_size % PAGE_SIZE != 0 {
            return Err(VmError::BadRange);
        }
        if self.user {
            flags |= VmFlags::USER;
        }

        let guard = if flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 };
        let reserve = virt_size + guard;

        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        let base = if flags.contains(VmFlags::FIXED) {
            let base = hint.as_u64().checked_sub(guard).ok_or(VmError::BadRange)?;
            if base < inner.min || base + reserve > inner.max {
                return Err(VmError::BadRange);
            }
            if inner.tree.overlaps(base, base + reserve) {
                if flags.contains(VmFlags::REPLACE) {
                    Self::unmap_overlapping(&mut *inner, base, base + reserve)?;
                } else {
                    return Err(VmError::Exists);
                }
            }
            base
        } else if self.user {
            inner
                .tree
                .find_free_asc(hint.as_u64(), reserve, inner.min, inner.max)
                .ok_or(VmError::NoVirtualSpace)?
        } else {
            inner
                .tree
                .find_free_desc(hint.as_u64(), reserve, inner.min, inner.max)
                .ok_or(VmError::NoVirtualSpace)?
        };

        let data_base = VirtAddr::new_truncate(base + guard);
        let mut mapping = VmMapping {
            vm_type,
            flags,
            name,
            size,
            virt_size: reserve,
            backing,
        };

        // Install leaf entries for the populated part of the mapping.
        Self::install(&mut *inner, data_base, &mut mapping)?;

        inner
            .tree
            .insert(base, base + reserve, mapping)
            .map_err(|_| VmError::Exists)?;
        Ok(data_base)
    }

    /// Maps a physical range (MMIO and the like).
    pub fn vmap_phys(
        &self,
        hint: VirtAddr,
        phys: PhysAddr,
        size: u64,
        flags: VmFlags,
        name: &str,
    ) -> Result<VirtAddr, VmError> {
        self.vmap(VmapRequest {
            vm_type: VmType::Phys,
            hint,
            size,
            virt_size: size,
            flags,
            name: String::from(name),
            backing: VmBacking::Phys(phys),
        })
    }

    /// Maps an explicit page list.
    pub fn vmap_pages(
        &self,
        hint: VirtAddr,
        pages: PageList,
        flags: VmFlags,
        name: &str,
    ) -> Result<VirtAddr, VmError> {
        let size = frames::list_base_pages(&pages) * PAGE_SIZE;
        self.vmap(VmapRequest {
            vm_type: VmType::Page,
            hint,
            size,
            virt_size: size,
            flags,
            name: String::from(name),
            backing: VmBacking::Pages { list: pages, skip: 0 },
        })
    }

    /// Maps a demand-paged anonymous object.
    pub fn vmap_anon(
        &self,
        hint: VirtAddr,
        size: u64,
        virt_size: u64,
        backing: Arc<dyn AnonBacking>,
        flags: VmFlags,
        name: &str,
    ) -> Result<VirtAddr, VmError> {
        self.vmap(VmapRequest {
            vm_type: VmType::Anon,
            hint,
            size,
            virt_size,
            flags,
            name: String::from(name),
            backing: VmBacking::Anon { backing, pages: BTreeMap::new() },
        })
    }

    /// Reserves address space without backing.
    pub fn vmap_rsvd(
        &self,
        hint: VirtAddr,
        size: u64,
        flags: VmFlags,
        name: &str,
    ) -> Result<VirtAddr, VmError> {
        self.vmap(VmapRequest {
            vm_type: VmType::Rsvd,
            hint,
            size,
            virt_size: size,
            flags,
            name: String::from(name),
            backing: VmBacking::None,
        })
    }

    fn install(
        inner: &mut AsInner,
        base: VirtAddr,
        mapping: &mut VmMapping,
    ) -> Result<(), VmError> {
        match &mapping.backing {
            VmBacking::None | VmBacking::Anon { .. } => {}
            VmBacking::Phys(phys) => {
                let page_size = mapping.page_size();
                let step = page_size.bytes();
                let mut off = 0;
                while off < mapping.size {
                    inner.mapper.map(
                        VirtAddr::new_truncate(base.as_u64() + off),
                        PhysAddr::new(phys.as_u64() + off),
                        page_size,
                        mapping.flags,
                    )?;
                    off += step;
                }
            }
            VmBacking::Pages { list, skip } => {
                let mut va = base.as_u64();
                for page in list.iter().skip(*skip as usize) {
                    if va >= base.as_u64() + mapping.size {
                        break;
                    }
                    inner.mapper.map(
                        VirtAddr::new_truncate(va),
                        page.address(),
                        page.size(),
                        mapping.flags,
                    )?;
                    page.set_flags(PageFlags::PRESENT);
                    va += page.byte_len();
                }
            }
        }
        if mapping.size > 0 && !matches!(mapping.backing, VmBacking::None) {
            mapping.flags |= VmFlags::MAPPED;
        }
        Ok(())
    }

    fn unmap_overlapping(inner: &mut AsInner, start: u64, end: u64) -> Result<(), VmError> {
        // Collect overlapping starts first; RSVD mappings refuse REPLACE.
        let mut victims = Vec::new();
        let mut cursor = start;
        while let Some((mstart, mend, m)) = inner.tree.lookup(cursor).or_else(|| {
            inner.tree.next_from(cursor).filter(|(s, _, _)| *s < end)
        }) {
            if m.vm_type == VmType::Rsvd {
                return Err(VmError::Exists);
            }
            victims.push((mstart, mend));
            cursor = mend;
            if cursor >= end {
                break;
            }
        }
        for (mstart, mend) in victims {
            if let Some((_, m)) = inner.tree.remove(mstart) {
                if m.flags.contains(VmFlags::MAPPED) {
                    inner.mapper.unmap(VirtAddr::new_truncate(mstart), mend - mstart);
                }
            }
        }
        Ok(())
    }

    // ── Unmap / resize ──────────────────────────────────────────────

    /// Removes the mapping that starts at `addr`, dropping its pages.
    pub fn unmap(&self, addr: VirtAddr) -> Result<(), VmError> {
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        // STACK mappings are keyed one guard page below their data base.
        let key = match inner.tree.lookup(addr.as_u64()) {
            Some((start, _, _)) => start,
            None => return Err(VmError::NotMapped),
        };
        let (end, mapping) = inner.tree.remove(key).ok_or(VmError::NotMapped)?;
        if mapping.flags.contains(VmFlags::MAPPED) {
            inner.mapper.unmap(VirtAddr::new_truncate(key), end - key);
        }
        drop(locked);
        crate::sched::tlb_shootdown(self.root, VirtAddr::new_truncate(key), end - key);
        Ok(())
    }

    /// Grows or shrinks the populated part of the mapping at `addr`.
    ///
    /// The new size must fit inside the mapping's reserved `virt_size`.
    /// Growth is demand-paged for ANON mappings and immediate (new frames
    /// from the frame allocator) for PAGE mappings.
    pub fn resize(&self, addr: VirtAddr, new_size: u64) -> Result<(), VmError> {
        if new_size == 0 || new_size % PAGE_SIZE != 0 {
            return Err(VmError::BadRange);
        }
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        let (start, end, _) = inner.tree.lookup(addr.as_u64()).ok_or(VmError::NotMapped)?;
        let guard = {
            let (_, _, m) = inner.tree.lookup(addr.as_u64()).unwrap();
            if m.flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 }
        };
        let data_base = start + guard;
        if new_size > end - data_base {
            return Err(VmError::BadRange);
        }

        // Work on the mapping in place.
        let (_, _, mapping) = inner.tree.lookup_mut(addr.as_u64()).unwrap();
        let old_size = mapping.size;
        if new_size == old_size {
            return Ok(());
        }

        if new_size < old_size {
            // Shrink: drop trailing backing and leaf entries.
            match &mut mapping.backing {
                VmBacking::Pages { list, skip } => {
                    let keep = (*skip + new_size / PAGE_SIZE) as usize;
                    list.truncate(keep);
                }
                VmBacking::Anon { pages, .. } => {
                    pages.retain(|off, _| *off < new_size);
                }
                _ => {}
            }
            mapping.size = new_size;
            inner
                .mapper
                .unmap(VirtAddr::new_truncate(data_base + new_size), old_size - new_size);
            drop(locked);
            crate::sched::tlb_shootdown(
                self.root,
                VirtAddr::new_truncate(data_base + new_size),
                old_size - new_size,
            );
            return Ok(());
        }

        // Grow.
        match mapping.vm_type {
            VmType::Anon | VmType::Rsvd => {
                mapping.size = new_size;
            }
            VmType::Page => {
                let extra = (new_size - old_size) / PAGE_SIZE;
                let new_pages = frames::with_pmm(|pmm| {
                    pmm.alloc_pages_size(extra, PageSize::Size4K)
                })
                .map_err(|_| VmError::OutOfMemory)?;
                let flags = mapping.flags;
                let mut va = data_base + old_size;
                for page in &new_pages {
                    inner.mapper.map(
                        VirtAddr::new_truncate(va),
                        page.address(),
                        PageSize::Size4K,
                        flags,
                    )?;
                    va += PAGE_SIZE;
                }
                let (_, _, mapping) = inner.tree.lookup_mut(addr.as_u64()).unwrap();
                if let VmBacking::Pages { list, .. } = &mut mapping.backing {
                    list.extend(new_pages);
                }
                mapping.size = new_size;
            }
            VmType::Phys => return Err(VmError::BadRange),
        }
        Ok(())
    }

    // ── Protection updates ──────────────────────────────────────────

    /// Updates the protection of `[addr, addr+len)`.
    ///
    /// Splits the containing mapping at the sub-range boundaries (linking
    /// the siblings), rewrites the affected leaf entries, and issues a TLB
    /// shootdown to every CPU that has this space loaded.
    pub fn update_prot(&self, addr: VirtAddr, len: u64, prot: VmFlags) -> Result<(), VmError> {
        if len == 0 || addr.as_u64() % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(VmError::BadRange);
        }
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        let (mstart, mend, _) = inner.tree.lookup(addr.as_u64()).ok_or(VmError::NotMapped)?;
        let ustart = addr.as_u64();
        let uend = ustart + len;
        if uend > mend {
            return Err(VmError::BadRange);
        }

        let (_, old) = inner.tree.remove(mstart).unwrap();
        let pieces = split_mapping(old, mstart, ustart, uend, prot);
        for (pstart, pend, piece) in pieces {
            inner
                .tree
                .insert(pstart, pend, piece)
                .map_err(|_| VmError::Exists)?;
        }
        inner.mapper.protect(addr, len, prot | (VmFlags::USER & flags_if(self.user)));
        drop(locked);
        crate::sched::tlb_shootdown(self.root, addr, len);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Returns `(name, start, size, virt_size, flags)` of the mapping
    /// covering `addr`.
    #[must_use]
    pub fn get_mapping(&self, addr: VirtAddr) -> Option<(String, VirtAddr, u64, u64, VmFlags)> {
        let inner = self.inner.lock();
        let (start, _, m) = inner.tree.lookup(addr.as_u64())?;
        Some((m.name.clone(), VirtAddr::new_truncate(start), m.size, m.virt_size, m.flags))
    }

    /// Translates a virtual address through the backing (not the TLB).
    #[must_use]
    pub fn virt_to_phys(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let inner = self.inner.lock();
        let (start, _, m) = inner.tree.lookup(addr.as_u64())?;
        let guard = if m.flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 };
        let off = addr.as_u64().checked_sub(start + guard)?;
        match &m.backing {
            VmBacking::Phys(phys) => Some(PhysAddr::new(phys.as_u64() + off)),
            VmBacking::Pages { .. } | VmBacking::Anon { .. } => {
                let page = m.page_at(off & !(m.page_size().bytes() - 1))?;
                Some(PhysAddr::new(page.address().as_u64() + off % page.byte_len()))
            }
            VmBacking::None => None,
        }
    }

    /// Returns the page backing `addr`, if one is resident.
    #[must_use]
    pub fn get_page(&self, addr: VirtAddr) -> Option<Arc<Page>> {
        let inner = self.inner.lock();
        let (start, _, m) = inner.tree.lookup(addr.as_u64())?;
        let guard = if m.flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 };
        let off = addr.as_u64().checked_sub(start + guard)?;
        m.page_at(off & !(m.page_size().bytes() - 1)).cloned()
    }

    /// Validates that `[addr, addr+len)` is covered by mappings permitting
    /// the access. Used by the syscall layer on user pointers.
    #[must_use]
    pub fn validate_range(&self, addr: VirtAddr, len: u64, write: bool) -> bool {
        let inner = self.inner.lock();
        let mut cursor = addr.as_u64();
        let end = match cursor.checked_add(len) {
            Some(e) => e,
            None => return false,
        };
        while cursor < end {
            let Some((start, mend, m)) = inner.tree.lookup(cursor) else {
                return false;
            };
            let guard = if m.flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 };
            if cursor < start + guard {
                return false; // inside the guard page
            }
            if m.vm_type == VmType::Rsvd || !m.flags.contains(VmFlags::READ) {
                return false;
            }
            if write && !m.flags.contains(VmFlags::WRITE) {
                return false;
            }
            cursor = mend;
        }
        true
    }

    // ── Fault handling ──────────────────────────────────────────────

    /// Resolves a page fault at `addr`.
    pub fn handle_fault(&self, addr: VirtAddr, access: FaultAccess) -> FaultOutcome {
        use orion_syscall::signal::{SEGV_ACCERR, SEGV_MAPERR};

        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        let Some((start, _, _)) = inner.tree.lookup(addr.as_u64()) else {
            return if access.user { FaultOutcome::Segv(SEGV_MAPERR) } else { FaultOutcome::Fatal };
        };

        let (_, _, mapping) = inner.tree.lookup_mut(addr.as_u64()).unwrap();
        let guard = if mapping.flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 };
        let data_base = start + guard;
        if addr.as_u64() < data_base {
            // Guard-page hit.
            return if access.user { FaultOutcome::Segv(SEGV_MAPERR) } else { FaultOutcome::Fatal };
        }

        // Protection checks against the mapping flags.
        let prot_bad = (access.write && !mapping.flags.contains(VmFlags::WRITE))
            || (access.exec && !mapping.flags.contains(VmFlags::EXEC))
            || (access.user && !mapping.flags.contains(VmFlags::USER));
        if prot_bad {
            return if access.user { FaultOutcome::Segv(SEGV_ACCERR) } else { FaultOutcome::Fatal };
        }

        let page_bytes = mapping.page_size().bytes();
        let off = (addr.as_u64() - data_base) & !(page_bytes - 1);
        if off >= mapping.size {
            return if access.user { FaultOutcome::Segv(SEGV_MAPERR) } else { FaultOutcome::Fatal };
        }

        // Demand-populate ANON slots.
        if mapping.vm_type == VmType::Anon && mapping.page_at(off).is_none() {
            let flags = mapping.flags;
            let VmBacking::Anon { backing, pages } = &mut mapping.backing else {
                unreachable!("ANON mapping with non-anon backing");
            };
            let page = match backing.get_page(off) {
                Ok(p) => p,
                Err(_) => return FaultOutcome::Segv(SEGV_MAPERR),
            };
            let pa = page.address();
            let psize = page.size();
            pages.insert(off, page);
            let va = VirtAddr::new_truncate(data_base + off);
            if inner.mapper.map(va, pa, psize, flags).is_err() {
                return FaultOutcome::Fatal;
            }
            return FaultOutcome::Resolved;
        }

        // Copy-on-write resolution.
        if access.write && access.present {
            let flags = mapping.flags;
            let Some(page_ref) = mapping.page_at(off) else {
                return if access.user {
                    FaultOutcome::Segv(SEGV_MAPERR)
                } else {
                    FaultOutcome::Fatal
                };
            };
            // Count the sharers before taking a reference of our own:
            // the mapping's entry always accounts for one, so any count
            // above that means another view still holds the frame.
            let shared = Arc::strong_count(page_ref) > 1;
            let page = page_ref.clone();
            if !page.is_cow() {
                // Spurious: another CPU already resolved it.
                return FaultOutcome::Resolved;
            }
            let va = VirtAddr::new_truncate(data_base + off);
            if shared {
                // Shared: replace with a private copy.
                let new_page = match frames::with_pmm(|pmm| {
                    pmm.alloc_pages_size(1, PageSize::Size4K)
                }) {
                    Ok(mut list) => list.pop().expect("one page requested"),
                    Err(_) => return FaultOutcome::Fatal,
                };
                inner.mapper.copy_page(new_page.address(), page.address());
                let pa = new_page.address();
                mapping_replace_page(mapping, off, new_page);
                if inner.mapper.map(va, pa, PageSize::Size4K, flags).is_err() {
                    return FaultOutcome::Fatal;
                }
            } else {
                // Last reference: claim the frame, restore write access.
                page.clear_flags(PageFlags::COW);
                inner.mapper.protect(va, page_bytes, flags);
            }
            return FaultOutcome::Resolved;
        }

        // A miss on a PAGE mapping means the leaf entries were never
        // installed (lazy REPLACE paths); map the resident page now.
        if !access.present {
            let flags = mapping.flags;
            if let Some(page) = mapping.page_at(off).cloned() {
                let va = VirtAddr::new_truncate(data_base + off);
                if inner.mapper.map(va, page.address(), page.size(), flags).is_err() {
                    return FaultOutcome::Fatal;
                }
                return FaultOutcome::Resolved;
            }
        }

        if access.user { FaultOutcome::Segv(SEGV_MAPERR) } else { FaultOutcome::Fatal }
    }

    // ── Fork ────────────────────────────────────────────────────────

    /// Clones this address space for a forked child.
    ///
    /// Shared mappings are re-linked into the child. Private writable
    /// PAGE/ANON mappings become copy-on-write in both parent and child:
    /// leaf entries lose write access and every affected frame gains
    /// `PG_COW` with its refcount bumped by the clone.
    pub fn fork(&self, child_root: PhysAddr, child_mapper: Box<dyn PageTableOps>) -> AddressSpace {
        let child = AddressSpace::new_user(child_root, child_mapper);
        let mut locked = self.inner.lock();
        let inner = &mut *locked;
        let mut child_locked = child.inner.lock();
        let child_inner = &mut *child_locked;

        let mut ranges = Vec::new();
        for (start, end, _) in inner.tree.iter() {
            ranges.push((start, end));
        }

        for (start, end) in ranges {
            let (_, _, mapping) = inner.tree.lookup_mut(start).unwrap();
            let guard = if mapping.flags.contains(VmFlags::STACK) { PAGE_SIZE } else { 0 };
            let data_base = start + guard;
            let cow = !mapping.flags.contains(VmFlags::SHARED)
                && mapping.flags.contains(VmFlags::WRITE)
                && matches!(mapping.vm_type, VmType::Page | VmType::Anon);

            let child_backing = match &mapping.backing {
                VmBacking::None => VmBacking::None,
                VmBacking::Phys(p) => VmBacking::Phys(*p),
                VmBacking::Pages { list, skip } => {
                    let cloned = if cow {
                        frames::alloc_cow_pages(list)
                    } else {
                        frames::alloc_shared_pages(list)
                    };
                    VmBacking::Pages { list: cloned, skip: *skip }
                }
                VmBacking::Anon { backing, pages } => {
                    let mut cloned = BTreeMap::new();
                    for (off, page) in pages {
                        if cow {
                            page.set_flags(PageFlags::COW);
                        }
                        cloned.insert(*off, page.clone());
                    }
                    VmBacking::Anon { backing: backing.clone(), pages: cloned }
                }
            };

            let mut child_mapping = VmMapping {
                vm_type: mapping.vm_type,
                flags: mapping.flags & !VmFlags::MAPPED,
                name: mapping.name.clone(),
                size: mapping.size,
                virt_size: mapping.virt_size,
                backing: child_backing,
            };

            if cow {
                // Drop write access in the parent's leaf entries.
                let ro = mapping.flags & !VmFlags::WRITE;
                inner.mapper.protect(
                    VirtAddr::new_truncate(data_base),
                    mapping.size,
                    ro,
                );
                // Install the child's entries read-only as well.
                let pages: Vec<(u64, PhysAddr, PageSize)> = match &child_mapping.backing {
                    VmBacking::Pages { list, skip } => list
                        .iter()
                        .skip(*skip as usize)
                        .scan(data_base, |va, p| {
                            let entry = (*va, p.address(), p.size());
                            *va += p.byte_len();
                            Some(entry)
                        })
                        .collect(),
                    VmBacking::Anon { pages, .. } => pages
                        .iter()
                        .map(|(off, p)| (data_base + off, p.address(), p.size()))
                        .collect(),
                    _ => Vec::new(),
                };
                for (pva, pa, psize) in pages {
                    let _ = child_inner.mapper.map(VirtAddr::new_truncate(pva), pa, psize, ro);
                }
                child_mapping.flags |= VmFlags::MAPPED;
            } else if matches!(child_mapping.vm_type, VmType::Phys | VmType::Page) {
                let _ = Self::install(
                    child_inner,
                    VirtAddr::new_truncate(data_base),
                    &mut child_mapping,
                );
            }

            let _ = child_inner.tree.insert(start, end, child_mapping);
        }

        drop(child_locked);
        drop(locked);
        crate::sched::tlb_shootdown(
            self.root,
            VirtAddr::new_truncate(PAGE_SIZE),
            crate::addr::USER_SPACE_END,
        );
        child
    }

    /// Runs a closure over every mapping (diagnostics, accounting).
    pub fn for_each_mapping(&self, mut f: impl FnMut(VirtAddr, u64, &VmMapping)) {
        let inner = self.inner.lock();
        for (start, _, m) in inner.tree.iter() {
            f(VirtAddr::new_truncate(start), m.virt_size, m);
        }
    }
}

const fn flags_if(user: bool) -> VmFlags {
    if user { VmFlags::USER } else { VmFlags::empty() }
}

/// Replaces the page at `off` in a mapping's backing (CoW resolution).
fn mapping_replace_page(mapping: &mut VmMapping, off: u64, new_page: Arc<Page>) {
    match &mut mapping.backing {
        VmBacking::Pages { list, skip } => {
            let index = (*skip + off / PAGE_SIZE) as usize;
            if index < list.len() {
                list[index] = new_page;
            }
        }
        VmBacking::Anon { pages, .. } => {
            pages.insert(off, new_page);
        }
        _ => {}
    }
}

/// Splits `mapping` (covering `[mstart, mend)`) so that `[ustart, uend)`
/// carries `prot`; returns the resulting pieces with sibling links set.
fn split_mapping(
    mapping: VmMapping,
    mstart: u64,
    ustart: u64,
    uend: u64,
    prot: VmFlags,
) -> Vec<(u64, u64, VmMapping)> {
    let mend = mstart + mapping.virt_size;
    let mut pieces = Vec::new();

    let slice = |from: u64, to: u64, flags: VmFlags, split: bool| {
        let guard_off = from - mstart;
        let backing = match &mapping.backing {
            VmBacking::None => VmBacking::None,
            VmBacking::Phys(p) => VmBacking::Phys(PhysAddr::new(p.as_u64() + guard_off)),
            VmBacking::Pages { list, skip } => VmBacking::Pages {
                list: list.clone(),
                skip: skip + guard_off / PAGE_SIZE,
            },
            VmBacking::Anon { backing, pages } => {
                let sub = pages
                    .range(guard_off..guard_off + (to - from))
                    .map(|(off, p)| (*off - guard_off, p.clone()))
                    .collect();
                VmBacking::Anon { backing: backing.clone(), pages: sub }
            }
        };
        let size = mapping.size.saturating_sub(guard_off).min(to - from);
        VmMapping {
            vm_type: mapping.vm_type,
            flags: flags | if split { VmFlags::SPLIT } else { VmFlags::empty() },
            name: mapping.name.clone(),
            size,
            virt_size: to - from,
            backing,
        }
    };

    let keep_flags = mapping.flags;
    let new_flags = (mapping.flags & !VmFlags::PROT_MASK) | (prot & VmFlags::PROT_MASK);

    if ustart > mstart {
        let mut head = slice(mstart, ustart, keep_flags, false);
        head.flags |= VmFlags::LINKED;
        pieces.push((mstart, ustart, head));
    }
    {
        let mut mid = slice(ustart, uend, new_flags, ustart > mstart);
        if uend < mend {
            mid.flags |= VmFlags::LINKED;
        }
        pieces.push((ustart, uend, mid));
    }
    if uend < mend {
        pieces.push((uend, mend, slice(uend, mend, keep_flags, true)));
    }
    pieces
}

/// Shadow-mapper fixtures shared by the VMM and exec tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    /// Shadow page table: records leaf entries in a hash map.
    #[derive(Default, Clone)]
    pub(crate) struct Shadow {
        pub(crate) entries: StdArc<StdMutex<HashMap<u64, (u64, VmFlags)>>>,
        pub(crate) copies: StdArc<StdMutex<Vec<(u64, u64)>>>,
    }

    pub(crate) struct ShadowMapper(pub(crate) Shadow);

    impl PageTableOps for ShadowMapper {
        fn map(&mut self, va: VirtAddr, pa: PhysAddr, size: PageSize, flags: VmFlags)
        -> Result<(), VmError> {
            let mut entries = self.0.entries.lock().unwrap();
            for i in 0..size.base_pages() {
                entries.insert(va.as_u64() + i * PAGE_SIZE, (pa.as_u64() + i * PAGE_SIZE, flags));
            }
            Ok(())
        }

        fn unmap(&mut self, va: VirtAddr, len: u64) {
            let mut entries = self.0.entries.lock().unwrap();
            for i in 0..len / PAGE_SIZE {
                entries.remove(&(va.as_u64() + i * PAGE_SIZE));
            }
        }

        fn protect(&mut self, va: VirtAddr, len: u64, flags: VmFlags) {
            let mut entries = self.0.entries.lock().unwrap();
            for i in 0..len / PAGE_SIZE {
                if let Some(e) = entries.get_mut(&(va.as_u64() + i * PAGE_SIZE)) {
                    e.1 = flags;
                }
            }
        }

        fn query(&self, va: VirtAddr) -> Option<PhysAddr> {
            let entries = self.0.entries.lock().unwrap();
            let page = va.as_u64() & !(PAGE_SIZE - 1);
            entries.get(&page).map(|(pa, _)| PhysAddr::new(pa + va.page_offset()))
        }

        fn copy_page(&mut self, dst: PhysAddr, src: PhysAddr) {
            self.0.copies.lock().unwrap().push((dst.as_u64(), src.as_u64()));
        }
    }

    /// A kernel-half address space over a fresh shadow mapper.
    pub(crate) fn kernel_space_with_shadow() -> (AddressSpace, Shadow) {
        let shadow = Shadow::default();
        let aspace = AddressSpace::new_kernel(
            PhysAddr::new(0x1000),
            Box::new(ShadowMapper(shadow.clone())),
        );
        (aspace, shadow)
    }

    /// A user-half address space over a fresh shadow mapper.
    pub(crate) fn user_space_with_shadow() -> (AddressSpace, Shadow) {
        let shadow = Shadow::default();
        let aspace = AddressSpace::new_user(
            PhysAddr::new(0x2000),
            Box::new(ShadowMapper(shadow.clone())),
        );
        (aspace, shadow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::{Shadow, ShadowMapper, kernel_space_with_shadow, user_space_with_shadow};
    use crate::addr::KERNEL_SPACE_START;
    use orion_syscall::signal::{SEGV_ACCERR, SEGV_MAPERR};
    use std::sync::Arc as StdArc;

    fn test_page(addr: u64) -> StdArc<Page> {
        // Non-owned pages: no zone bookkeeping involved in VMM tests.
        frames::PhysAllocator::new()
            .alloc_nonowned_pages_at(PhysAddr::new(addr), 1, PageSize::Size4K)
            .unwrap()
            .pop()
            .unwrap()
    }

    fn test_pages(addr: u64, count: u64) -> PageList {
        frames::PhysAllocator::new()
            .alloc_nonowned_pages_at(PhysAddr::new(addr), count, PageSize::Size4K)
            .unwrap()
    }

    fn kernel_space() -> (AddressSpace, Shadow) {
        kernel_space_with_shadow()
    }

    fn user_space() -> (AddressSpace, Shadow) {
        user_space_with_shadow()
    }

    struct ZeroBacking;

    impl AnonBacking for ZeroBacking {
        fn get_page(&self, off: u64) -> Result<StdArc<Page>, VmError> {
            Ok(test_page(0x100_0000 + off))
        }
    }

    const RW: VmFlags = VmFlags::READ.union(VmFlags::WRITE);

    #[test]
    fn vmap_pages_installs_leaves() {
        let (aspace, shadow) = user_space();
        let base = aspace
            .vmap_pages(VirtAddr::new(0x40_0000), test_pages(0x7000, 2), RW | VmFlags::FIXED, "data")
            .expect("vmap");
        assert_eq!(base.as_u64(), 0x40_0000);
        let entries = shadow.entries.lock().unwrap();
        assert_eq!(entries[&0x40_0000].0, 0x7000);
        assert_eq!(entries[&0x40_1000].0, 0x8000);
    }

    #[test]
    fn mappings_do_not_overlap() {
        let (aspace, _) = user_space();
        aspace
            .vmap_rsvd(VirtAddr::new(0x40_0000), 0x2000, VmFlags::FIXED, "a")
            .expect("first");
        // Invariant: fixed requests into an occupied range fail.
        assert_eq!(
            aspace
                .vmap_rsvd(VirtAddr::new(0x40_1000), 0x1000, VmFlags::FIXED | VmFlags::READ, "b")
                .err(),
            Some(VmError::Exists)
        );
    }

    #[test]
    fn replace_overlays_non_reserved() {
        let (aspace, _) = user_space();
        aspace
            .vmap_pages(VirtAddr::new(0x40_0000), test_pages(0x7000, 1), RW | VmFlags::FIXED, "old")
            .expect("first");
        let base = aspace
            .vmap_pages(
                VirtAddr::new(0x40_0000),
                test_pages(0x9000, 1),
                RW | VmFlags::FIXED | VmFlags::REPLACE,
                "new",
            )
            .expect("replace");
        assert_eq!(base.as_u64(), 0x40_0000);
        let (name, _, _, _, _) = aspace.get_mapping(base).unwrap();
        assert_eq!(name, "new");
    }

    #[test]
    fn replace_refuses_reserved() {
        let (aspace, _) = user_space();
        aspace
            .vmap_rsvd(VirtAddr::new(0x40_0000), 0x1000, VmFlags::FIXED, "rsvd")
            .expect("reserve");
        assert!(
            aspace
                .vmap_pages(
                    VirtAddr::new(0x40_0000),
                    test_pages(0x9000, 1),
                    RW | VmFlags::FIXED | VmFlags::REPLACE,
                    "new",
                )
                .is_err()
        );
    }

    #[test]
    fn user_search_grows_upward_kernel_downward() {
        let (user, _) = user_space();
        let a = user.vmap_rsvd(VirtAddr::new(0x40_0000), 0x1000, VmFlags::READ, "a").unwrap();
        let b = user.vmap_rsvd(VirtAddr::new(0x40_0000), 0x1000, VmFlags::READ, "b").unwrap();
        assert!(b.as_u64() > a.as_u64());

        let (kernel, _) = kernel_space();
        let hint = VirtAddr::new(KERNEL_SPACE_START + 0x100_0000);
        let a = kernel.vmap_rsvd(hint, 0x1000, VmFlags::READ, "a").unwrap();
        let b = kernel.vmap_rsvd(hint, 0x1000, VmFlags::READ, "b").unwrap();
        assert!(b.as_u64() < a.as_u64());
    }

    #[test]
    fn stack_guard_page_faults() {
        let (aspace, _) = user_space();
        let base = aspace
            .vmap_pages(
                VirtAddr::new(0x7F00_0000),
                test_pages(0x1_0000, 4),
                RW | VmFlags::FIXED | VmFlags::STACK,
                "stack",
            )
            .expect("stack");
        assert_eq!(base.as_u64(), 0x7F00_0000);

        // Touching the guard page below the stack is a mapping error.
        let guard_addr = VirtAddr::new(base.as_u64() - 8);
        let access = FaultAccess { write: true, exec: false, user: true, present: false };
        assert_eq!(aspace.handle_fault(guard_addr, access), FaultOutcome::Segv(SEGV_MAPERR));
        // And the guard is not a valid user range either.
        assert!(!aspace.validate_range(guard_addr, 8, false));
        assert!(aspace.validate_range(base, 0x4000, true));
    }

    #[test]
    fn anon_fault_populates_slot() {
        let (aspace, shadow) = user_space();
        let base = aspace
            .vmap_anon(
                VirtAddr::new(0x50_0000),
                0x3000,
                0x3000,
                StdArc::new(ZeroBacking),
                RW | VmFlags::FIXED,
                "anon",
            )
            .expect("anon");

        // No leaves yet.
        assert!(shadow.entries.lock().unwrap().is_empty());

        let addr = VirtAddr::new(base.as_u64() + 0x1000);
        let access = FaultAccess { write: false, exec: false, user: true, present: false };
        assert_eq!(aspace.handle_fault(addr, access), FaultOutcome::Resolved);

        let entries = shadow.entries.lock().unwrap();
        assert_eq!(entries[&addr.as_u64()].0, 0x100_1000);
        drop(entries);
        assert!(aspace.get_page(addr).is_some());
    }

    #[test]
    fn fault_outside_mapping_is_segv_for_user() {
        let (aspace, _) = user_space();
        let access = FaultAccess { write: false, exec: false, user: true, present: false };
        assert_eq!(
            aspace.handle_fault(VirtAddr::new(0x6000_0000), access),
            FaultOutcome::Segv(SEGV_MAPERR)
        );
        let access = FaultAccess { write: false, exec: false, user: false, present: false };
        assert_eq!(aspace.handle_fault(VirtAddr::new(0x6000_0000), access), FaultOutcome::Fatal);
    }

    #[test]
    fn write_to_readonly_is_accerr() {
        let (aspace, _) = user_space();
        let base = aspace
            .vmap_pages(
                VirtAddr::new(0x40_0000),
                test_pages(0x7000, 1),
                VmFlags::READ | VmFlags::FIXED,
                "ro",
            )
            .expect("ro map");
        let access = FaultAccess { write: true, exec: false, user: true, present: true };
        assert_eq!(aspace.handle_fault(base, access), FaultOutcome::Segv(SEGV_ACCERR));
    }

    #[test]
    fn cow_fault_replaces_shared_page() {
        let (aspace, shadow) = user_space();
        let pages = test_pages(0x7000, 1);
        let shared_view = frames::alloc_cow_pages(&pages); // refcount 2, COW set
        let base = aspace
            .vmap_pages(VirtAddr::new(0x40_0000), pages, RW | VmFlags::FIXED, "cow")
            .expect("map");

        // PMM needed for the private copy.
        frames::init_test_pmm();

        let access = FaultAccess { write: true, exec: false, user: true, present: true };
        assert_eq!(aspace.handle_fault(base, access), FaultOutcome::Resolved);

        // A copy happened and the mapping now points at a private frame.
        assert_eq!(shadow.copies.lock().unwrap().len(), 1);
        let new_page = aspace.get_page(base).unwrap();
        assert_ne!(new_page.address().as_u64(), 0x7000);
        assert!(!new_page.is_cow());
        // The old frame is still held by the other view.
        assert_eq!(shared_view[0].address().as_u64(), 0x7000);
    }

    #[test]
    fn cow_fault_last_reference_claims_frame() {
        let (aspace, shadow) = user_space();
        let pages = test_pages(0x7000, 1);
        pages[0].set_flags(PageFlags::COW);
        let base = aspace
            .vmap_pages(VirtAddr::new(0x40_0000), pages, RW | VmFlags::FIXED, "cow")
            .expect("map");

        let access = FaultAccess { write: true, exec: false, user: true, present: true };
        assert_eq!(aspace.handle_fault(base, access), FaultOutcome::Resolved);
        // No copy: the frame was claimed in place.
        assert!(shadow.copies.lock().unwrap().is_empty());
        assert!(!aspace.get_page(base).unwrap().is_cow());
    }

    #[test]
    fn update_prot_splits_into_linked_siblings() {
        let (aspace, shadow) = user_space();
        let base = aspace
            .vmap_pages(VirtAddr::new(0x40_0000), test_pages(0x10_0000, 4), RW | VmFlags::FIXED, "seg")
            .expect("map");

        // Protect the middle two pages read-only.
        let mid = VirtAddr::new(base.as_u64() + 0x1000);
        aspace.update_prot(mid, 0x2000, VmFlags::READ).expect("update");

        assert_eq!(aspace.mapping_count(), 3);
        let (_, _, _, _, head_flags) = aspace.get_mapping(base).unwrap();
        assert!(head_flags.contains(VmFlags::LINKED));
        let (_, _, _, _, mid_flags) = aspace.get_mapping(mid).unwrap();
        assert!(mid_flags.contains(VmFlags::SPLIT));
        assert!(mid_flags.contains(VmFlags::LINKED));
        assert!(!mid_flags.contains(VmFlags::WRITE));
        let (_, _, _, _, tail_flags) =
            aspace.get_mapping(VirtAddr::new(base.as_u64() + 0x3000)).unwrap();
        assert!(tail_flags.contains(VmFlags::SPLIT));
        assert!(tail_flags.contains(VmFlags::WRITE));

        // Physical translation is unchanged across the split.
        assert_eq!(aspace.virt_to_phys(mid).unwrap().as_u64(), 0x10_1000);
        // Leaf entries lost the write bit.
        let entries = shadow.entries.lock().unwrap();
        assert!(!entries[&mid.as_u64()].1.contains(VmFlags::WRITE));
        assert!(entries[&base.as_u64()].1.contains(VmFlags::WRITE));
    }

    #[test]
    fn unmap_removes_leaves() {
        let (aspace, shadow) = user_space();
        let base = aspace
            .vmap_pages(VirtAddr::new(0x40_0000), test_pages(0x7000, 2), RW | VmFlags::FIXED, "tmp")
            .expect("map");
        aspace.unmap(base).expect("unmap");
        assert!(shadow.entries.lock().unwrap().is_empty());
        assert_eq!(aspace.mapping_count(), 0);
        assert!(aspace.unmap(base).is_err());
    }

    #[test]
    fn resize_shrink_and_grow_anon() {
        let (aspace, _) = user_space();
        let base = aspace
            .vmap_anon(
                VirtAddr::new(0x50_0000),
                0x4000,
                0x8000,
                StdArc::new(ZeroBacking),
                RW | VmFlags::FIXED,
                "heap",
            )
            .expect("anon");

        aspace.resize(base, 0x2000).expect("shrink");
        let (_, _, size, _, _) = aspace.get_mapping(base).unwrap();
        assert_eq!(size, 0x2000);

        aspace.resize(base, 0x6000).expect("grow");
        let (_, _, size, _, _) = aspace.get_mapping(base).unwrap();
        assert_eq!(size, 0x6000);

        // Beyond virt_size is refused.
        assert!(aspace.resize(base, 0x9000).is_err());
    }

    #[test]
    fn fork_makes_private_mappings_cow() {
        let (parent, parent_shadow) = user_space();
        let pages = test_pages(0x7000, 2);
        let base = parent
            .vmap_pages(VirtAddr::new(0x40_0000), pages, RW | VmFlags::FIXED, "data")
            .expect("map");

        let child_shadow = Shadow::default();
        let child = parent.fork(PhysAddr::new(0x3000), Box::new(ShadowMapper(child_shadow.clone())));

        // Both sides see the same frames, marked CoW.
        let ppage = parent.get_page(base).unwrap();
        let cpage = child.get_page(base).unwrap();
        assert!(StdArc::ptr_eq(&ppage, &cpage));
        assert!(ppage.is_cow());

        // Both leaf sets lost write access.
        assert!(!parent_shadow.entries.lock().unwrap()[&base.as_u64()].1.contains(VmFlags::WRITE));
        assert!(!child_shadow.entries.lock().unwrap()[&base.as_u64()].1.contains(VmFlags::WRITE));
    }

    #[test]
    fn fork_relinks_shared_mappings() {
        let (parent, _) = user_space();
        let base = parent
            .vmap_pages(
                VirtAddr::new(0x40_0000),
                test_pages(0x7000, 1),
                RW | VmFlags::FIXED | VmFlags::SHARED,
                "shm",
            )
            .expect("map");

        let child_shadow = Shadow::default();
        let child = parent.fork(PhysAddr::new(0x3000), Box::new(ShadowMapper(child_shadow.clone())));
        let ppage = parent.get_page(base).unwrap();
        let cpage = child.get_page(base).unwrap();
        assert!(StdArc::ptr_eq(&ppage, &cpage));
        assert!(!ppage.is_cow());
        // Child leaves keep write access.
        assert!(child_shadow.entries.lock().unwrap()[&base.as_u64()].1.contains(VmFlags::WRITE));
    }

    #[test]
    fn virt_to_phys_through_backings() {
        let (aspace, _) = user_space();
        let pbase = aspace
            .vmap_phys(VirtAddr::new(0x60_0000), PhysAddr::new(0xFEC0_0000), 0x2000,
                VmFlags::READ | VmFlags::FIXED | VmFlags::NOCACHE, "mmio")
            .expect("phys map");
        assert_eq!(aspace.virt_to_phys(pbase + 0x1004).unwrap().as_u64(), 0xFEC0_1004);

        let dbase = aspace
            .vmap_pages(VirtAddr::new(0x40_0000), test_pages(0x7000, 2), RW | VmFlags::FIXED, "d")
            .expect("page map");
        assert_eq!(aspace.virt_to_phys(dbase + 0x1008).unwrap().as_u64(), 0x8008);
    }
}
