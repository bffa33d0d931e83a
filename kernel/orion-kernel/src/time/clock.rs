//! Clock sources and monotonic time.
//!
//! Any number of [`ClockSource`]s register during bring-up; the one with
//! the lowest period (finest resolution) wins the election and backs the
//! monotonic clock from then on. Reads synchronize through a spin mutex:
//! the delta from the last raw read is accumulated into the running
//! nanosecond count. A contended reader does not retry the hardware; it
//! waits for the holder and returns the just-updated count, which keeps
//! the clock monotonic across CPUs by construction.
//!
//! Wall time anchors the monotonic count to a boot epoch read once from
//! the RTC.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::SpinMutex;

/// A free-running counter usable for timekeeping.
pub trait ClockSource: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &'static str;
    /// Nanoseconds per counter tick.
    fn scale_ns(&self) -> u64;
    /// Mask covering the counter's valid bits (handles narrow counters).
    fn value_mask(&self) -> u64;
    /// Reads the raw counter.
    fn read(&self) -> u64;
    /// Starts the counter.
    fn enable(&self);
    /// Stops the counter.
    fn disable(&self);
}

struct ClockState {
    source: Option<Arc<dyn ClockSource>>,
    last_raw: u64,
    count_ns: u64,
}

static CLOCK: SpinMutex<ClockState> = SpinMutex::named(
    "CLOCK",
    ClockState { source: None, last_raw: 0, count_ns: 0 },
);

/// Sources registered before the election.
static CANDIDATES: SpinMutex<Vec<Arc<dyn ClockSource>>> =
    SpinMutex::named("CLOCK_CANDIDATES", Vec::new());

/// Wall-clock epoch at boot, in seconds since the Unix epoch.
static BOOT_EPOCH_SECS: AtomicU64 = AtomicU64::new(0);

/// Registers a candidate clock source.
pub fn register_source(source: Arc<dyn ClockSource>) {
    CANDIDATES.lock().push(source);
}

/// Elects the best candidate (lowest period wins) and starts it.
///
/// # Panics
///
/// Panics if no sources registered or a clock is already elected.
pub fn init_clock() {
    let candidates = CANDIDATES.lock();
    let best = candidates
        .iter()
        .min_by_key(|s| s.scale_ns())
        .expect("no clock sources registered")
        .clone();
    drop(candidates);

    best.enable();
    let raw = best.read() & best.value_mask();

    let mut clock = CLOCK.lock();
    assert!(clock.source.is_none(), "clock already initialized");
    crate::kinfo!("clock: using {} ({} ns/tick)", best.name(), best.scale_ns());
    clock.source = Some(best);
    clock.last_raw = raw;
    clock.count_ns = 0;
}

/// Records the boot epoch read from the RTC.
pub fn set_boot_epoch(secs: u64) {
    BOOT_EPOCH_SECS.store(secs, Ordering::Release);
}

/// Nanoseconds since clock init.
///
/// # Panics
///
/// Panics if no clock was elected yet; use [`try_uptime_nanos`] on paths
/// that may run before that.
pub fn uptime_nanos() -> u64 {
    try_uptime_nanos().expect("clock not initialized")
}

/// Nanoseconds since clock init, or `None` before the election.
pub fn try_uptime_nanos() -> Option<u64> {
    // Uncontended path: take the lock, accumulate the delta.
    if let Some(mut clock) = CLOCK.try_lock() {
        let source = clock.source.as_ref()?.clone();
        let mask = source.value_mask();
        let raw = source.read() & mask;
        let delta = raw.wrapping_sub(clock.last_raw) & mask;
        clock.last_raw = raw;
        clock.count_ns += delta * source.scale_ns();
        return Some(clock.count_ns);
    }
    // Contended: another CPU is updating the count right now. Wait for it
    // and return the freshly updated value.
    let clock = CLOCK.lock();
    clock.source.as_ref()?;
    Some(clock.count_ns)
}

/// Wall-clock time: boot epoch plus uptime.
pub fn realtime_nanos() -> u64 {
    let epoch = BOOT_EPOCH_SECS.load(Ordering::Acquire);
    epoch * super::NANOS_PER_SEC + try_uptime_nanos().unwrap_or(0)
}

/// The elected source's resolution in nanoseconds (clock_getres).
pub fn resolution_nanos() -> u64 {
    let clock = CLOCK.lock();
    clock.source.as_ref().map_or(super::NANOS_PER_SEC, |s| s.scale_ns().max(1))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A manually advanced counter for tests.
    pub(crate) struct TestCounter {
        pub ticks: AtomicU64,
        pub scale: u64,
    }

    impl ClockSource for TestCounter {
        fn name(&self) -> &'static str {
            "test-counter"
        }
        fn scale_ns(&self) -> u64 {
            self.scale
        }
        fn value_mask(&self) -> u64 {
            u64::MAX
        }
        fn read(&self) -> u64 {
            self.ticks.load(Ordering::Relaxed)
        }
        fn enable(&self) {}
        fn disable(&self) {}
    }

    /// Installs a test clock exactly once for the whole test process and
    /// returns it.
    pub(crate) fn install_test_clock() -> Arc<TestCounter> {
        use std::sync::OnceLock;
        static SOURCE: OnceLock<Arc<TestCounter>> = OnceLock::new();
        SOURCE
            .get_or_init(|| {
                let src = Arc::new(TestCounter { ticks: AtomicU64::new(0), scale: 10 });
                register_source(src.clone());
                register_source(Arc::new(TestCounter { ticks: AtomicU64::new(0), scale: 100 }));
                init_clock();
                src
            })
            .clone()
    }

    #[test]
    fn lowest_period_wins_and_accumulates() {
        let src = install_test_clock();
        let t0 = uptime_nanos();
        src.ticks.fetch_add(5, Ordering::Relaxed);
        let t1 = uptime_nanos();
        // The elected source has scale 10, not 100.
        assert_eq!(t1 - t0, 50);
    }

    #[test]
    fn monotonic_across_reads() {
        let src = install_test_clock();
        let mut last = uptime_nanos();
        for _ in 0..100 {
            src.ticks.fetch_add(1, Ordering::Relaxed);
            let now = uptime_nanos();
            assert!(now >= last, "clock went backwards");
            last = now;
        }
    }

    #[test]
    fn realtime_is_epoch_plus_uptime() {
        let _ = install_test_clock();
        set_boot_epoch(1_000);
        let rt = realtime_nanos();
        assert!(rt >= 1_000 * crate::time::NANOS_PER_SEC);
    }
}
