//! Physical frame allocator.
//!
//! RAM is partitioned into four zones by physical address (LOW < 1 MiB,
//! DMA < 16 MiB, NORMAL < 4 GiB, HIGH above). Each zone owns one free-run
//! allocator behind a spin mutex. Allocations hand out lists of refcounted
//! [`Page`] descriptors, one per page; a contiguous allocation is a list of
//! consecutive pages whose first entry carries `PG_HEAD` and the run
//! length. A shared frame (CoW or shared mapping) is simply an `Arc`
//! clone; a page returns to its zone only when the last reference drops,
//! and the zone's free pool re-coalesces neighboring frees.
//!
//! Non-owned pages wrap MMIO or framebuffer ranges the allocator does not
//! manage; dropping them never touches a free pool.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::addr::PhysAddr;
use crate::mm::PageSize;
use crate::sync::SpinMutex;

bitflags! {
    /// Per-run page flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Mapped by at least one present PTE.
        const PRESENT = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
        /// User-accessible.
        const USER = 1 << 3;
        /// Cache-disabled.
        const NOCACHE = 1 << 4;
        /// Write-through caching.
        const WRITETHRU = 1 << 5;
        /// Global TLB entry.
        const GLOBAL = 1 << 6;
        /// 2 MiB page.
        const BIG = 1 << 7;
        /// 1 GiB page.
        const HUGE = 1 << 8;
        /// Head of a page run.
        const HEAD = 1 << 9;
        /// Copy-on-write: shared until the first write fault.
        const COW = 1 << 10;
    }
}

/// Physical memory zones, by address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// Below 1 MiB (legacy DMA, trampolines).
    Low,
    /// Below 16 MiB (ISA DMA).
    Dma,
    /// Below 4 GiB.
    Normal,
    /// At or above 4 GiB.
    High,
}

impl ZoneKind {
    /// The physical range `[start, end)` this zone covers.
    #[must_use]
    pub const fn range(self) -> (u64, u64) {
        match self {
            Self::Low => (0, 0x10_0000),
            Self::Dma => (0x10_0000, 0x100_0000),
            Self::Normal => (0x100_0000, 0x1_0000_0000),
            Self::High => (0x1_0000_0000, u64::MAX),
        }
    }

    /// The zone containing a physical address.
    #[must_use]
    pub fn for_addr(addr: PhysAddr) -> Self {
        match addr.as_u64() {
            a if a < 0x10_0000 => Self::Low,
            a if a < 0x100_0000 => Self::Dma,
            a if a < 0x1_0000_0000 => Self::Normal,
            _ => Self::High,
        }
    }

    /// Allocation preference order for zone-less requests.
    pub const PREFERENCE: [ZoneKind; 4] = [Self::Normal, Self::High, Self::Dma, Self::Low];
}

/// Frame allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No zone can satisfy the request.
    OutOfMemory,
    /// `alloc_at` hit an already-reserved or unmanaged range.
    BadAddress,
}

// ---------------------------------------------------------------------------
// Zone allocator implementation trait
// ---------------------------------------------------------------------------

/// The per-zone allocation strategy.
///
/// All quantities are in base (4 KiB) pages; addresses are byte-granular
/// physical addresses aligned to a base page.
pub trait ZoneAllocatorImpl: Send {
    /// Donates a run of free pages to the pool.
    fn init(&mut self, start: u64, pages: u64);
    /// Allocates `pages` contiguous pages aligned to `align` bytes.
    fn alloc(&mut self, pages: u64, align: u64) -> Option<u64>;
    /// Claims the exact range `[start, start + pages<<12)`.
    fn reserve(&mut self, start: u64, pages: u64) -> Result<(), PmmError>;
    /// Returns a run to the pool.
    fn free(&mut self, start: u64, pages: u64);
    /// Number of free base pages.
    fn free_pages(&self) -> u64;
}

/// The default strategy: a coalescing map of free runs, first-fit.
pub struct FreeRunAllocator {
    /// Free runs keyed by start address; value = length in pages.
    runs: BTreeMap<u64, u64>,
    free: u64,
}

impl FreeRunAllocator {
    /// Creates an empty pool.
    #[must_use]
    pub const fn new() -> Self {
        Self { runs: BTreeMap::new(), free: 0 }
    }

    /// Carves `[start, start+pages)` out of the run that covers it.
    fn carve(&mut self, run_start: u64, run_pages: u64, start: u64, pages: u64) {
        self.runs.remove(&run_start);
        let lead = (start - run_start) >> 12;
        let tail = run_pages - lead - pages;
        if lead > 0 {
            self.runs.insert(run_start, lead);
        }
        if tail > 0 {
            self.runs.insert(start + (pages << 12), tail);
        }
        self.free -= pages;
    }
}

impl Default for FreeRunAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneAllocatorImpl for FreeRunAllocator {
    fn init(&mut self, start: u64, pages: u64) {
        self.free(start, pages);
    }

    fn alloc(&mut self, pages: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        let (run_start, run_pages, start) = self.runs.iter().find_map(|(&rs, &rp)| {
            let aligned = (rs + align - 1) & !(align - 1);
            let skip = (aligned - rs) >> 12;
            (skip + pages <= rp).then_some((rs, rp, aligned))
        })?;
        self.carve(run_start, run_pages, start, pages);
        Some(start)
    }

    fn reserve(&mut self, start: u64, pages: u64) -> Result<(), PmmError> {
        let (&run_start, &run_pages) =
            self.runs.range(..=start).next_back().ok_or(PmmError::BadAddress)?;
        let run_end = run_start + (run_pages << 12);
        if start < run_start || start + (pages << 12) > run_end {
            return Err(PmmError::BadAddress);
        }
        self.carve(run_start, run_pages, start, pages);
        Ok(())
    }

    fn free(&mut self, start: u64, pages: u64) {
        let mut start = start;
        let mut pages = pages;
        // Coalesce with the predecessor run.
        if let Some((&ps, &pp)) = self.runs.range(..start).next_back()
            && ps + (pp << 12) == start
        {
            self.runs.remove(&ps);
            start = ps;
            pages += pp;
        }
        // Coalesce with the successor run.
        let end = start + (pages << 12);
        if let Some(&np) = self.runs.get(&end) {
            self.runs.remove(&end);
            pages += np;
        }
        self.runs.insert(start, pages);
        self.free += pages;
    }

    fn free_pages(&self) -> u64 {
        self.free
    }
}

// ---------------------------------------------------------------------------
// Zones and page runs
// ---------------------------------------------------------------------------

/// One physical memory zone.
pub struct Zone {
    kind: ZoneKind,
    alloc: SpinMutex<Box<dyn ZoneAllocatorImpl>>,
}

impl Zone {
    /// Creates a zone with the default free-run strategy.
    #[must_use]
    pub fn new(kind: ZoneKind) -> Self {
        Self {
            kind,
            alloc: SpinMutex::named("zone", Box::new(FreeRunAllocator::new())),
        }
    }

    /// Returns the zone kind.
    #[must_use]
    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// Donates usable memory (clipped to the zone's range by the caller).
    pub fn add_range(&self, start: PhysAddr, pages: u64) {
        self.alloc.lock().init(start.as_u64(), pages);
    }

    /// Number of free base pages.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.alloc.lock().free_pages()
    }
}

/// A refcounted physical page.
///
/// Each `Page` describes exactly one page of its size. Contiguous
/// allocations come back as a list of consecutive pages whose first entry
/// carries `PG_HEAD` and the run length. Dropping the last reference to an
/// owned page returns it to its zone; the zone's free-run pool re-coalesces
/// neighbors.
pub struct Page {
    address: PhysAddr,
    /// Pages in the contiguous run this page heads (1 unless `HEAD`).
    run_pages: u64,
    size: PageSize,
    flags: AtomicU32,
    /// Owning zone; `None` for non-owned (MMIO) pages.
    owner: Option<Arc<Zone>>,
}

impl Page {
    /// Physical address of the page.
    #[must_use]
    pub fn address(&self) -> PhysAddr {
        self.address
    }

    /// Length of the contiguous run this page heads (1 for non-heads).
    #[must_use]
    pub fn run_pages(&self) -> u64 {
        self.run_pages
    }

    /// The page size.
    #[must_use]
    pub fn size(&self) -> PageSize {
        self.size
    }

    /// The page's length in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.size.bytes()
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets flag bits.
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears flag bits.
    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the run is marked copy-on-write.
    #[must_use]
    pub fn is_cow(&self) -> bool {
        self.flags().contains(PageFlags::COW)
    }

    /// Whether the run returns to a zone when dropped.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(zone) = &self.owner {
            zone.alloc.lock().free(self.address.as_u64(), self.size.base_pages());
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({} {:?})", self.address, self.size)
    }
}

/// An ordered list of pages backing a mapping or buffer.
pub type PageList = Vec<Arc<Page>>;

/// Total base pages covered by a page list.
#[must_use]
pub fn list_base_pages(list: &PageList) -> u64 {
    list.iter().map(|p| p.size.base_pages()).sum()
}

// ---------------------------------------------------------------------------
// The allocator proper
// ---------------------------------------------------------------------------

/// The machine's physical memory: all four zones.
pub struct PhysAllocator {
    zones: [Arc<Zone>; 4],
}

impl PhysAllocator {
    /// Creates an allocator with empty zones.
    #[must_use]
    pub fn new() -> Self {
        Self {
            zones: [
                Arc::new(Zone::new(ZoneKind::Low)),
                Arc::new(Zone::new(ZoneKind::Dma)),
                Arc::new(Zone::new(ZoneKind::Normal)),
                Arc::new(Zone::new(ZoneKind::High)),
            ],
        }
    }

    fn zone(&self, kind: ZoneKind) -> &Arc<Zone> {
        match kind {
            ZoneKind::Low => &self.zones[0],
            ZoneKind::Dma => &self.zones[1],
            ZoneKind::Normal => &self.zones[2],
            ZoneKind::High => &self.zones[3],
        }
    }

    /// Donates a usable physical range, splitting it across zone borders.
    pub fn add_usable_range(&self, start: PhysAddr, size: u64) {
        let mut cur = start.as_u64();
        let end = cur + size;
        while cur < end {
            let kind = ZoneKind::for_addr(PhysAddr::new(cur));
            let (_, zone_end) = kind.range();
            let chunk_end = end.min(zone_end);
            let pages = (chunk_end - cur) >> 12;
            if pages > 0 {
                self.zone(kind).add_range(PhysAddr::new(cur), pages);
            }
            cur = chunk_end;
        }
    }

    /// Total free base pages across all zones.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.zones.iter().map(|z| z.free_pages()).sum()
    }

    /// Allocates `count` pages of `page_size` from any zone.
    ///
    /// Pages within one returned run are contiguous; the list as a whole
    /// need not be. Either the full request is satisfied or nothing is.
    pub fn alloc_pages_size(&self, count: u64, page_size: PageSize) -> Result<PageList, PmmError> {
        for kind in ZoneKind::PREFERENCE {
            if let Ok(list) = self.alloc_pages_zone(kind, count, page_size) {
                return Ok(list);
            }
        }
        Err(PmmError::OutOfMemory)
    }

    /// Allocates `count` pages of `page_size` from a specific zone.
    pub fn alloc_pages_zone(
        &self,
        kind: ZoneKind,
        count: u64,
        page_size: PageSize,
    ) -> Result<PageList, PmmError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let zone = self.zone(kind);
        let per_page = page_size.base_pages();
        let align = page_size.bytes();

        // Try one contiguous run first.
        {
            let mut alloc = zone.alloc.lock();
            if let Some(start) = alloc.alloc(count * per_page, align) {
                return Ok(make_run(zone, start, count, page_size));
            }
        }

        // Fall back to gathering pages one at a time (each page is still
        // internally contiguous at its own size).
        let mut list = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let start = zone.alloc.lock().alloc(per_page, align);
            match start {
                Some(start) => list.extend(make_run(zone, start, 1, page_size)),
                None => {
                    // No partial allocations: the list drop returns the
                    // pages gathered so far.
                    return Err(PmmError::OutOfMemory);
                }
            }
        }
        Ok(list)
    }

    /// Allocates the exact physical range starting at `phys`.
    pub fn alloc_pages_at(
        &self,
        phys: PhysAddr,
        count: u64,
        page_size: PageSize,
    ) -> Result<PageList, PmmError> {
        if !phys.is_aligned(page_size.bytes()) {
            return Err(PmmError::BadAddress);
        }
        let zone = self.zone(ZoneKind::for_addr(phys));
        let base_pages = count * page_size.base_pages();
        zone.alloc.lock().reserve(phys.as_u64(), base_pages)?;
        Ok(make_run(zone, phys.as_u64(), count, page_size))
    }

    /// Builds page structs for a physical range the allocator does **not**
    /// own (MMIO, framebuffers). The run is never returned to a pool.
    pub fn alloc_nonowned_pages_at(
        &self,
        phys: PhysAddr,
        count: u64,
        page_size: PageSize,
    ) -> Result<PageList, PmmError> {
        if !phys.is_aligned(page_size.bytes()) {
            return Err(PmmError::BadAddress);
        }
        let mut list = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut flags = size_flags(page_size);
            if i == 0 {
                flags |= PageFlags::HEAD;
            }
            list.push(Arc::new(Page {
                address: PhysAddr::new(phys.as_u64() + i * page_size.bytes()),
                run_pages: if i == 0 { count } else { 1 },
                size: page_size,
                flags: AtomicU32::new(flags.bits()),
                owner: None,
            }));
        }
        Ok(list)
    }
}

fn size_flags(size: PageSize) -> PageFlags {
    match size {
        PageSize::Size4K => PageFlags::empty(),
        PageSize::Size2M => PageFlags::BIG,
        PageSize::Size1G => PageFlags::HUGE,
    }
}

/// Builds the per-page structs for a freshly carved contiguous run.
fn make_run(zone: &Arc<Zone>, start: u64, count: u64, size: PageSize) -> PageList {
    let mut list = Vec::with_capacity(count as usize);
    for i in 0..count {
        let mut flags = size_flags(size);
        if i == 0 {
            flags |= PageFlags::HEAD;
        }
        list.push(Arc::new(Page {
            address: PhysAddr::new(start + i * size.bytes()),
            run_pages: if i == 0 { count } else { 1 },
            size,
            flags: AtomicU32::new(flags.bits()),
            owner: Some(zone.clone()),
        }));
    }
    list
}

impl Default for PhysAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a copy-on-write view of an existing page list.
///
/// Both views share the underlying runs (refcount ≥ 2) with `PG_COW` set;
/// the write-fault path replaces a shared run with a private copy.
#[must_use]
pub fn alloc_cow_pages(src: &PageList) -> PageList {
    for page in src {
        page.set_flags(PageFlags::COW);
    }
    src.clone()
}

/// Creates a shared view of an existing page list (no CoW semantics).
#[must_use]
pub fn alloc_shared_pages(src: &PageList) -> PageList {
    src.clone()
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static PMM: SpinMutex<Option<PhysAllocator>> = SpinMutex::named("PMM", None);

/// Installs the global allocator built from the boot memory map.
///
/// # Panics
///
/// Panics if called twice.
pub fn init(allocator: PhysAllocator) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Runs a closure against the global allocator.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with_pmm<R>(f: impl FnOnce(&PhysAllocator) -> R) -> R {
    let pmm = PMM.lock();
    f(pmm.as_ref().expect("PMM not initialized"))
}

/// Like [`with_pmm`], returning `None` when the lock is held (fault paths)
/// or the PMM is not yet up.
pub fn try_with_pmm<R>(f: impl FnOnce(&PhysAllocator) -> R) -> Option<R> {
    let pmm = PMM.try_lock()?;
    Some(f(pmm.as_ref()?))
}

/// Installs a global test allocator exactly once (shared across tests).
#[cfg(test)]
pub(crate) fn init_test_pmm() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let pmm = PhysAllocator::new();
        // 16 MiB of NORMAL-zone memory well clear of the fixtures.
        pmm.add_usable_range(PhysAddr::new(0x4000_0000), 0x100_0000);
        init(pmm);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> PhysAllocator {
        let pmm = PhysAllocator::new();
        // 8 MiB in DMA range, 64 MiB in NORMAL range.
        pmm.add_usable_range(PhysAddr::new(0x80_0000), 0x80_0000);
        pmm.add_usable_range(PhysAddr::new(0x100_0000), 0x400_0000);
        pmm
    }

    #[test]
    fn range_splits_across_zones() {
        let pmm = PhysAllocator::new();
        // 2 MiB straddling the LOW/DMA border at 1 MiB.
        pmm.add_usable_range(PhysAddr::new(0x8_0000), 0x20_0000);
        assert_eq!(pmm.zone(ZoneKind::Low).free_pages(), (0x10_0000 - 0x8_0000) >> 12);
        assert_eq!(pmm.zone(ZoneKind::Dma).free_pages(), (0x28_0000u64 - 0x10_0000) >> 12);
    }

    #[test]
    fn alloc_returns_full_run() {
        let pmm = test_allocator();
        let list = pmm.alloc_pages_size(4, PageSize::Size4K).expect("alloc");
        assert_eq!(list.len(), 4);
        assert_eq!(list_base_pages(&list), 4);
        assert!(list[0].flags().contains(PageFlags::HEAD));
        assert_eq!(list[0].run_pages(), 4);
        // Pages in a run are consecutive.
        assert_eq!(list[1].address().as_u64(), list[0].address().as_u64() + 0x1000);
        // Prefers the NORMAL zone.
        assert_eq!(ZoneKind::for_addr(list[0].address()), ZoneKind::Normal);
    }

    #[test]
    fn drop_returns_pages_to_zone() {
        let pmm = test_allocator();
        let before = pmm.free_pages();
        let list = pmm.alloc_pages_size(16, PageSize::Size4K).expect("alloc");
        assert_eq!(pmm.free_pages(), before - 16);
        drop(list);
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn shared_runs_survive_one_drop() {
        let pmm = test_allocator();
        let before = pmm.free_pages();
        let list = pmm.alloc_pages_size(1, PageSize::Size4K).expect("alloc");
        let view = alloc_shared_pages(&list);
        drop(list);
        // The view still holds the run.
        assert_eq!(pmm.free_pages(), before - 1);
        drop(view);
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn cow_view_marks_both_sides() {
        let pmm = test_allocator();
        let list = pmm.alloc_pages_size(2, PageSize::Size4K).expect("alloc");
        let cow = alloc_cow_pages(&list);
        assert!(list.iter().all(|p| p.is_cow()));
        assert!(cow.iter().all(|p| p.is_cow()));
        assert!(Arc::ptr_eq(&list[0], &cow[0]));
    }

    #[test]
    fn alloc_at_exact_range() {
        let pmm = test_allocator();
        let list = pmm
            .alloc_pages_at(PhysAddr::new(0x100_0000), 4, PageSize::Size4K)
            .expect("alloc_at");
        assert_eq!(list[0].address(), PhysAddr::new(0x100_0000));

        // The same range is now taken.
        assert_eq!(
            pmm.alloc_pages_at(PhysAddr::new(0x100_0000), 1, PageSize::Size4K).err(),
            Some(PmmError::BadAddress)
        );
    }

    #[test]
    fn alloc_at_unmanaged_range_fails() {
        let pmm = test_allocator();
        assert_eq!(
            pmm.alloc_pages_at(PhysAddr::new(0x4000), 1, PageSize::Size4K).err(),
            Some(PmmError::BadAddress)
        );
    }

    #[test]
    fn nonowned_runs_never_free() {
        let pmm = test_allocator();
        let before = pmm.free_pages();
        let list = pmm
            .alloc_nonowned_pages_at(PhysAddr::new(0xFEC0_0000), 1, PageSize::Size4K)
            .expect("nonowned");
        assert!(!list[0].is_owned());
        drop(list);
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn big_pages_are_aligned() {
        let pmm = test_allocator();
        let list = pmm.alloc_pages_size(1, PageSize::Size2M).expect("big page");
        assert!(list[0].address().is_aligned(PageSize::Size2M.bytes()));
        assert!(list[0].flags().contains(PageFlags::BIG));
    }

    #[test]
    fn exhaustion_is_all_or_nothing() {
        let pmm = PhysAllocator::new();
        pmm.add_usable_range(PhysAddr::new(0x100_0000), 0x4000); // 4 pages
        let before = pmm.free_pages();
        assert_eq!(before, 4);
        // 8 pages cannot be satisfied; nothing must leak.
        assert!(pmm.alloc_pages_size(8, PageSize::Size4K).is_err());
        assert_eq!(pmm.free_pages(), before);
    }

    #[test]
    fn free_run_coalescing() {
        let mut fra = FreeRunAllocator::new();
        fra.init(0x1000, 4);
        let a = fra.alloc(2, 0x1000).unwrap();
        let b = fra.alloc(2, 0x1000).unwrap();
        assert_eq!(fra.free_pages(), 0);
        fra.free(a, 2);
        fra.free(b, 2);
        assert_eq!(fra.free_pages(), 4);
        // Coalesced back into one run: a 4-page allocation succeeds.
        assert!(fra.alloc(4, 0x1000).is_some());
    }
}
