//! Direct physical memory window.
//!
//! The bootloader maps all of physical memory at a fixed offset inside the
//! kernel half; [`init`] records the offset and [`phys_to_virt`] performs
//! the translation. Host tests point the offset at an ordinary allocation
//! so code that touches frame contents can run off-target.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PhysAddr, VirtAddr};

static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the virtual offset of the physical memory window.
pub fn init(offset: u64) {
    PHYS_OFFSET.store(offset, Ordering::Release);
}

/// Returns the window offset.
#[must_use]
pub fn offset() -> u64 {
    PHYS_OFFSET.load(Ordering::Acquire)
}

/// Translates a physical address into the direct window.
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(offset() + phys.as_u64())
}

/// Returns a mutable byte slice over a physical range via the window.
///
/// # Safety
///
/// The range must be valid mapped RAM not concurrently accessed through
/// another alias.
#[must_use]
pub unsafe fn phys_slice_mut(phys: PhysAddr, len: usize) -> &'static mut [u8] {
    // SAFETY: Deferred to the caller plus the init contract that the whole
    // of physical memory is mapped at the recorded offset.
    unsafe { core::slice::from_raw_parts_mut(phys_to_virt(phys).as_mut_ptr::<u8>(), len) }
}
