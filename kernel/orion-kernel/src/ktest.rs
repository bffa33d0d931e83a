//! The staged boot-test runner.
//!
//! Walks the linker-section test descriptors at each boot stage.
//! `early_boot` and `before_sched` tests run inline on the boot CPU;
//! `with_sched` and `userspace` tests run in their own kernel thread
//! under a watchdog. Results go to COM1; the run ends by exiting QEMU.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use orion_ktest::{KernelTestDescriptor, TestStage, kernel_test_entries, serial_println};

/// Default per-test watchdog in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

static FAILURES: AtomicUsize = AtomicUsize::new(0);

/// Runs every registered test for `stage`.
pub fn run_stage(stage: TestStage) {
    let tests: alloc::vec::Vec<&KernelTestDescriptor> = kernel_test_entries()
        .iter()
        .filter(|t| t.stage == stage)
        .collect();
    if tests.is_empty() {
        return;
    }
    serial_println!("ktest: stage {} ({} tests)", stage.as_str(), tests.len());

    for test in tests {
        serial_println!("ktest: {}::{} ...", test.module_path, test.name);
        match stage {
            TestStage::EarlyBoot | TestStage::BeforeSched => {
                (test.test_fn)();
                serial_println!("ktest: {}::{} ok", test.module_path, test.name);
            }
            TestStage::WithSched | TestStage::Userspace => run_threaded(test),
        }
    }
}

/// Runs one test in its own kernel thread with a watchdog.
fn run_threaded(test: &'static KernelTestDescriptor) {
    static DONE: AtomicBool = AtomicBool::new(false);
    static CURRENT: crate::sync::SpinMutex<Option<fn()>> =
        crate::sync::SpinMutex::named("ktest_current", None);

    DONE.store(false, Ordering::Release);
    *CURRENT.lock() = Some(test.test_fn);

    fn runner(_arg: usize) {
        let f = CURRENT.lock().take().expect("test staged");
        f();
        DONE.store(true, Ordering::Release);
    }

    let td = crate::proc::Thread::new_kernel(test.name, runner, 0).expect("test thread");
    crate::sched::submit(td);

    let timeout = if test.timeout_secs == 0 { DEFAULT_TIMEOUT_SECS } else { u64::from(test.timeout_secs) };
    let deadline =
        crate::time::clock::uptime_nanos() + timeout * crate::time::NANOS_PER_SEC;
    while !DONE.load(Ordering::Acquire) {
        if crate::time::clock::uptime_nanos() > deadline {
            FAILURES.fetch_add(1, Ordering::Relaxed);
            serial_println!("ktest: {}::{} TIMED OUT", test.module_path, test.name);
            return;
        }
        crate::sched::yield_now();
    }
    serial_println!("ktest: {}::{} ok", test.module_path, test.name);
}

/// Reports the final verdict and exits QEMU.
pub fn finish() -> ! {
    let failures = FAILURES.load(Ordering::Acquire);
    if failures == 0 {
        serial_println!("ktest: all stages passed");
        orion_ktest::qemu::exit_qemu(orion_ktest::qemu::SUCCESS);
    } else {
        serial_println!("ktest: {failures} failures");
        orion_ktest::qemu::exit_qemu(orion_ktest::qemu::FAILURE);
    }
}

/// Shared fixtures for the boot tests.
pub mod fixtures {
    use super::Arc;

    /// A barrier for multi-thread boot tests.
    pub struct TestBarrier {
        count: super::AtomicUsize,
        target: usize,
    }

    impl TestBarrier {
        /// A barrier for `target` participants.
        #[must_use]
        pub fn new(target: usize) -> Arc<Self> {
            Arc::new(Self { count: super::AtomicUsize::new(0), target })
        }

        /// Arrives and spins until everyone has.
        pub fn wait(&self) {
            self.count.fetch_add(1, super::Ordering::AcqRel);
            while self.count.load(super::Ordering::Acquire) < self.target {
                crate::sched::yield_now();
            }
        }
    }
}
