//! Fixed-size object pools with per-CPU magazines.
//!
//! A [`Pool`] manages a set of size classes. Each class keeps slab pages
//! carved into objects, a per-CPU magazine of free objects (popped with
//! interrupts disabled via the spin mutex), and a bounded reserve of full
//! magazines. `alloc` promotes a request to the smallest covering class
//! and takes the local-magazine fast path; `free` mirrors it. Slabs come
//! from a [`SlabBacking`] so the pool works over `vmap`ed kernel memory on
//! the target and plain allocations in host tests.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::percpu::CpuLocal;
use crate::sync::SpinMutex;

/// Bytes per slab.
const SLAB_SIZE: usize = 4 * crate::addr::PAGE_SIZE as usize;

/// Default objects per per-CPU magazine.
const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Default maximum reserve magazines per class.
const DEFAULT_RESERVE_MAX: usize = 4;

/// Default object alignment.
const DEFAULT_ALIGNMENT: usize = 8;

/// Provides slab memory to a pool.
pub trait SlabBacking: Send + Sync {
    /// Allocates a slab of `len` bytes, returning its base address.
    fn grow(&self, len: usize) -> Option<usize>;
    /// Returns a slab. Pools only call this on destruction.
    fn shrink(&self, base: usize, len: usize);
}

/// A magazine: a bounded stack of free object addresses.
struct Magazine {
    objects: Vec<usize>,
}

impl Magazine {
    fn new(capacity: usize) -> Self {
        Self { objects: Vec::with_capacity(capacity) }
    }
}

/// Slab bookkeeping plus the overflow free list for one size class.
struct Depot {
    /// Slab base addresses (kept for destruction).
    slabs: Vec<usize>,
    /// Objects not currently in any magazine.
    free: Vec<usize>,
}

/// One size class of a pool.
struct SizeClass {
    size: usize,
    caches: CpuLocal<SpinMutex<Magazine>>,
    reserve: SpinMutex<Vec<Magazine>>,
    depot: SpinMutex<Depot>,
}

/// A pool allocator for fixed-size objects.
pub struct Pool {
    name: &'static str,
    classes: Vec<SizeClass>,
    alignment: usize,
    cache_capacity: usize,
    reserve_max: usize,
    backing: Arc<dyn SlabBacking>,
    // Statistics.
    allocs: AtomicU64,
    frees: AtomicU64,
    slab_creates: AtomicU64,
}

impl Pool {
    /// Creates a pool with default tuning (8-byte alignment, 64-object
    /// magazines, 4 reserve magazines).
    #[must_use]
    pub fn new(name: &'static str, sizes: &[usize], backing: Arc<dyn SlabBacking>) -> Self {
        Self::new_tuned(
            name,
            sizes,
            backing,
            DEFAULT_ALIGNMENT,
            DEFAULT_CACHE_CAPACITY,
            DEFAULT_RESERVE_MAX,
        )
    }

    /// Creates a pool with explicit tuning parameters.
    ///
    /// # Panics
    ///
    /// Panics on an empty size list, a non-power-of-two alignment, or a
    /// class size larger than a slab.
    #[must_use]
    pub fn new_tuned(
        name: &'static str,
        sizes: &[usize],
        backing: Arc<dyn SlabBacking>,
        alignment: usize,
        cache_capacity: usize,
        reserve_max: usize,
    ) -> Self {
        assert!(!sizes.is_empty(), "pool needs at least one size class");
        assert!(alignment.is_power_of_two(), "pool alignment must be a power of two");

        let mut sorted: Vec<usize> = sizes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let classes = sorted
            .into_iter()
            .map(|size| {
                let size = (size.max(alignment) + alignment - 1) & !(alignment - 1);
                assert!(size <= SLAB_SIZE, "class size exceeds slab size");
                SizeClass {
                    size,
                    caches: CpuLocal::new(core::array::from_fn(|_| {
                        SpinMutex::named("pool_cache", Magazine::new(cache_capacity))
                    })),
                    reserve: SpinMutex::named("pool_reserve", Vec::new()),
                    depot: SpinMutex::named("pool_depot", Depot { slabs: Vec::new(), free: Vec::new() }),
                }
            })
            .collect();

        Self {
            name,
            classes,
            alignment,
            cache_capacity,
            reserve_max,
            backing,
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            slab_creates: AtomicU64::new(0),
        }
    }

    /// Returns the pool name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of allocations served.
    #[must_use]
    pub fn alloc_count(&self) -> u64 {
        self.allocs.load(Ordering::Relaxed)
    }

    /// Number of frees.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Finds the smallest class covering `size`.
    fn class_for(&self, size: usize) -> Option<&SizeClass> {
        self.classes.iter().find(|c| c.size >= size)
    }

    /// Carves a new slab into the depot's free list.
    fn grow_class(&self, class: &SizeClass) -> bool {
        let Some(base) = self.backing.grow(SLAB_SIZE) else {
            return false;
        };
        self.slab_creates.fetch_add(1, Ordering::Relaxed);
        let mut depot = class.depot.lock();
        depot.slabs.push(base);
        let count = SLAB_SIZE / class.size;
        for i in 0..count {
            depot.free.push(base + i * class.size);
        }
        true
    }

    /// Allocates an object of at least `size` bytes.
    ///
    /// Returns null only when the request exceeds every class or the
    /// backing cannot grow.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let Some(class) = self.class_for(size) else {
            return core::ptr::null_mut();
        };

        // Fast path: pop the local magazine (IRQs off under the lock).
        {
            let mut cache = class.caches.get().lock();
            if let Some(obj) = cache.objects.pop() {
                self.allocs.fetch_add(1, Ordering::Relaxed);
                return obj as *mut u8;
            }
        }

        // Swap in a full magazine from the reserve.
        {
            let mut reserve = class.reserve.lock();
            if let Some(full) = reserve.pop() {
                drop(reserve);
                let mut cache = class.caches.get().lock();
                *cache = full;
                if let Some(obj) = cache.objects.pop() {
                    self.allocs.fetch_add(1, Ordering::Relaxed);
                    return obj as *mut u8;
                }
            }
        }

        // Depot path: refill from slab objects, growing when dry.
        loop {
            {
                let mut depot = class.depot.lock();
                if let Some(obj) = depot.free.pop() {
                    self.allocs.fetch_add(1, Ordering::Relaxed);
                    return obj as *mut u8;
                }
            }
            if !self.grow_class(class) {
                return core::ptr::null_mut();
            }
        }
    }

    /// Returns an object of `size` bytes to the pool.
    ///
    /// # Safety
    ///
    /// `obj` must have come from `alloc(size)` on this pool and must not
    /// be used afterwards.
    pub unsafe fn free(&self, obj: *mut u8, size: usize) {
        let Some(class) = self.class_for(size) else {
            return;
        };
        self.frees.fetch_add(1, Ordering::Relaxed);

        let mut cache = class.caches.get().lock();
        if cache.objects.len() < self.cache_capacity {
            cache.objects.push(obj as usize);
            return;
        }

        // Local magazine is full: rotate it into the reserve.
        let full = core::mem::replace(&mut *cache, Magazine::new(self.cache_capacity));
        cache.objects.push(obj as usize);
        drop(cache);

        let mut reserve = class.reserve.lock();
        if reserve.len() < self.reserve_max {
            reserve.push(full);
        } else {
            drop(reserve);
            // Reserve is full too: spill to the depot free list.
            let mut depot = class.depot.lock();
            depot.free.extend(full.objects);
        }
    }

    /// Pre-fills one reserve magazine for the class covering `size`.
    ///
    /// Returns the number of objects preloaded (0 on error or when `count`
    /// exceeds the magazine capacity).
    pub fn preload_cache(&self, size: usize, count: usize) -> usize {
        if count > self.cache_capacity {
            return 0;
        }
        let Some(class) = self.class_for(size) else {
            return 0;
        };

        let mut magazine = Magazine::new(self.cache_capacity);
        while magazine.objects.len() < count {
            let obj = {
                let mut depot = class.depot.lock();
                depot.free.pop()
            };
            match obj {
                Some(obj) => magazine.objects.push(obj),
                None => {
                    if !self.grow_class(class) {
                        break;
                    }
                }
            }
        }

        let loaded = magazine.objects.len();
        let mut reserve = class.reserve.lock();
        if reserve.len() < self.reserve_max {
            reserve.push(magazine);
            loaded
        } else {
            drop(reserve);
            let mut depot = class.depot.lock();
            depot.free.extend(magazine.objects);
            0
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for class in &self.classes {
            let depot = class.depot.lock();
            for &slab in &depot.slabs {
                self.backing.shrink(slab, SLAB_SIZE);
            }
        }
    }
}

/// Slab backing over the kernel address space (`vmap`ed pages).
#[cfg(target_os = "none")]
pub struct VmapBacking;

#[cfg(target_os = "none")]
impl SlabBacking for VmapBacking {
    fn grow(&self, len: usize) -> Option<usize> {
        use crate::mm::vmm::VmFlags;
        let pages = crate::mm::frames::with_pmm(|pmm| {
            pmm.alloc_pages_size(crate::mm::size_to_pages(len as u64), crate::mm::PageSize::Size4K)
        })
        .ok()?;
        let base = crate::boot::kernel_space()
            .vmap_pages(
                crate::addr::VirtAddr::new(crate::config::KERNEL_HEAP_VA),
                pages,
                VmFlags::READ | VmFlags::WRITE,
                "pool_slab",
            )
            .ok()?;
        Some(base.as_u64() as usize)
    }

    fn shrink(&self, base: usize, _len: usize) {
        let _ = crate::boot::kernel_space().unmap(crate::addr::VirtAddr::new(base as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc, dealloc};
    use std::sync::Mutex as StdMutex;

    /// Host backing over the std allocator.
    struct HostBacking {
        slabs: StdMutex<Vec<usize>>,
    }

    impl HostBacking {
        fn new() -> Arc<Self> {
            Arc::new(Self { slabs: StdMutex::new(Vec::new()) })
        }
    }

    impl SlabBacking for HostBacking {
        fn grow(&self, len: usize) -> Option<usize> {
            let layout = Layout::from_size_align(len, 0x1000).unwrap();
            // SAFETY: layout is valid and non-zero.
            let ptr = unsafe { alloc(layout) };
            if ptr.is_null() {
                return None;
            }
            self.slabs.lock().unwrap().push(ptr as usize);
            Some(ptr as usize)
        }

        fn shrink(&self, base: usize, len: usize) {
            let layout = Layout::from_size_align(len, 0x1000).unwrap();
            let mut slabs = self.slabs.lock().unwrap();
            if let Some(i) = slabs.iter().position(|&s| s == base) {
                slabs.swap_remove(i);
                // SAFETY: base came from alloc with the same layout.
                unsafe { dealloc(base as *mut u8, layout) };
            }
        }
    }

    #[test]
    fn alloc_promotes_to_covering_class() {
        let pool = Pool::new("test", &[32, 128, 512], HostBacking::new());
        let a = pool.alloc(20); // → 32 class
        let b = pool.alloc(100); // → 128 class
        assert!(!a.is_null());
        assert!(!b.is_null());
        // SAFETY: Objects came from this pool at these sizes.
        unsafe {
            pool.free(a, 20);
            pool.free(b, 100);
        }
        assert_eq!(pool.alloc_count(), 2);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn oversize_request_returns_null() {
        let pool = Pool::new("test", &[64], HostBacking::new());
        assert!(pool.alloc(65).is_null());
    }

    #[test]
    fn freed_object_is_recycled() {
        let pool = Pool::new("test", &[64], HostBacking::new());
        let a = pool.alloc(64);
        // SAFETY: a came from this pool.
        unsafe { pool.free(a, 64) };
        // The magazine fast path returns the same object.
        let b = pool.alloc(64);
        assert_eq!(a, b);
        unsafe { pool.free(b, 64) };
    }

    #[test]
    fn distinct_objects_while_live() {
        let pool = Pool::new("test", &[16], HostBacking::new());
        let mut live = Vec::new();
        for _ in 0..200 {
            let p = pool.alloc(16);
            assert!(!p.is_null());
            assert!(!live.contains(&p));
            live.push(p);
        }
        for p in live {
            // SAFETY: Every object came from this pool.
            unsafe { pool.free(p, 16) };
        }
    }

    #[test]
    fn magazine_rotation_into_reserve() {
        let backing = HostBacking::new();
        let pool = Pool::new_tuned("test", &[64], backing, 8, 4, 2);
        // Allocate and free more objects than one magazine holds.
        let objs: Vec<_> = (0..16).map(|_| pool.alloc(64)).collect();
        for o in &objs {
            // SAFETY: Objects came from this pool.
            unsafe { pool.free(*o, 64) };
        }
        // Everything must be allocatable again.
        let again: Vec<_> = (0..16).map(|_| pool.alloc(64)).collect();
        assert!(again.iter().all(|p| !p.is_null()));
        for o in again {
            // SAFETY: Objects came from this pool.
            unsafe { pool.free(o, 64) };
        }
    }

    #[test]
    fn preload_fills_reserve() {
        let pool = Pool::new("test", &[64], HostBacking::new());
        assert_eq!(pool.preload_cache(64, 16), 16);
        // Preloading more than the magazine capacity is refused.
        assert_eq!(pool.preload_cache(64, 1000), 0);
        // Preloaded objects serve allocations.
        let p = pool.alloc(64);
        assert!(!p.is_null());
        // SAFETY: p came from this pool.
        unsafe { pool.free(p, 64) };
    }
}
