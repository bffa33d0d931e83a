//! Time-stamp counter clock source.
//!
//! Calibrated against the PIT at init; only elected when the finest
//! candidate (invariant-TSC machines make it the best one by period).

use core::sync::atomic::{AtomicU64, Ordering};

/// Reads the TSC.
#[must_use]
pub fn rdtsc() -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: rdtsc is unprivileged and side-effect free.
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi,
            options(nomem, nostack, preserves_flags));
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// The TSC as a clock source.
pub struct Tsc {
    /// Femtoseconds per tick (sub-ns resolution at GHz rates).
    period_fs: AtomicU64,
}

impl Tsc {
    /// Calibrates against the PIT over a 10 ms window.
    #[must_use]
    pub fn calibrate() -> Self {
        let start = rdtsc();
        super::pit::spin_wait_ms(10);
        let ticks = (rdtsc() - start).max(1);
        // 10 ms = 1e13 fs.
        let period_fs = 10_000_000_000_000 / ticks;
        crate::kinfo!("tsc: {} fs/tick", period_fs);
        Self { period_fs: AtomicU64::new(period_fs.max(1)) }
    }
}

impl crate::time::clock::ClockSource for Tsc {
    fn name(&self) -> &'static str {
        "tsc"
    }

    fn scale_ns(&self) -> u64 {
        (self.period_fs.load(Ordering::Relaxed) / 1_000_000).max(1)
    }

    fn value_mask(&self) -> u64 {
        u64::MAX
    }

    fn read(&self) -> u64 {
        rdtsc()
    }

    fn enable(&self) {}

    fn disable(&self) {}
}
