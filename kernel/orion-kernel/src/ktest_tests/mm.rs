//! Memory-management boot tests.

use orion_ktest::kernel_test;

#[kernel_test]
fn heap_alloc_roundtrip() {
    let boxed = alloc::boxed::Box::new(0xC0FFEEu64);
    assert_eq!(*boxed, 0xC0FFEE);
    let mut v = alloc::vec::Vec::new();
    for i in 0..1024u64 {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<u64>(), 1023 * 1024 / 2);
}

#[kernel_test]
fn vmap_write_read_roundtrip() {
    use crate::mm::vmm::VmFlags;

    let pages = crate::mm::frames::with_pmm(|pmm| {
        pmm.alloc_pages_size(4, crate::mm::PageSize::Size4K)
    })
    .expect("frames");
    let space = crate::boot::kernel_space();
    let base = space
        .vmap_pages(
            crate::addr::VirtAddr::new(crate::config::KERNEL_HEAP_VA),
            pages,
            VmFlags::READ | VmFlags::WRITE,
            "ktest_vmap",
        )
        .expect("vmap");

    // Write then read every page through the new mapping.
    for page in 0..4u64 {
        let ptr = (base.as_u64() + page * crate::addr::PAGE_SIZE) as *mut u64;
        // SAFETY: The range was just mapped read-write.
        unsafe {
            ptr.write_volatile(0xAA55_0000 + page);
            assert_eq!(ptr.read_volatile(), 0xAA55_0000 + page);
        }
    }
    space.unmap(base).expect("unmap");
}

#[kernel_test]
fn pmm_exhaustion_is_clean() {
    // A absurdly large request must fail without poisoning the pools.
    let before = crate::mm::frames::with_pmm(crate::mm::frames::PhysAllocator::free_pages);
    let result = crate::mm::frames::with_pmm(|pmm| {
        pmm.alloc_pages_size(1 << 40, crate::mm::PageSize::Size4K)
    });
    assert!(result.is_err());
    let after = crate::mm::frames::with_pmm(crate::mm::frames::PhysAllocator::free_pages);
    assert_eq!(before, after);
}
