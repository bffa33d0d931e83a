//! TLB maintenance.

use crate::addr::{PAGE_SIZE, VirtAddr};

/// Invalidates one page's translation.
pub fn invalidate_page(va: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Invalidates every translation in `[va, va+len)`.
///
/// Falls back to a full flush for large ranges, where per-page
/// invalidation costs more than refilling the TLB.
pub fn invalidate_range(va: VirtAddr, len: u64) {
    const FULL_FLUSH_THRESHOLD: u64 = 64 * PAGE_SIZE;
    if len >= FULL_FLUSH_THRESHOLD {
        flush_all();
        return;
    }
    let mut cursor = va.as_u64() & !(PAGE_SIZE - 1);
    let end = va.as_u64() + len;
    while cursor < end {
        invalidate_page(VirtAddr::new_truncate(cursor));
        cursor += PAGE_SIZE;
    }
}

/// Flushes the whole (non-global) TLB by reloading CR3.
pub fn flush_all() {
    let root = super::control::Cr3::read();
    // SAFETY: Reloading the same root only drops TLB entries.
    unsafe { super::control::Cr3::write(root) };
}
