//! Kernel test descriptor types stored in linker sections.

/// Boot stage at which a test runs.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestStage {
    /// After frame allocator, VMM, and heap initialization.
    EarlyBoot = 0,
    /// After IRQ, clock, VFS, device, and logging initialization.
    BeforeSched = 1,
    /// With the scheduler running; the test executes in a kernel thread.
    WithSched = 2,
    /// Full kernel with userspace process support.
    Userspace = 3,
}

impl TestStage {
    /// Returns the stage name as written in the attribute.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EarlyBoot => "early_boot",
            Self::BeforeSched => "before_sched",
            Self::WithSched => "with_sched",
            Self::Userspace => "userspace",
        }
    }
}

/// Descriptor for a single kernel test, stored in the
/// `.orion_kernel_tests` linker section by the `#[kernel_test]` macro.
#[repr(C)]
pub struct KernelTestDescriptor {
    /// Test function name.
    pub name: &'static str,
    /// Module path where the test is defined.
    pub module_path: &'static str,
    /// Boot stage at which the test runs.
    pub stage: TestStage,
    /// Per-test watchdog timeout in seconds (0 = runner default).
    pub timeout_secs: u32,
    /// The test function. `WithSched`/`Userspace` tests are run in their
    /// own kernel thread; earlier stages run inline on the boot CPU.
    pub test_fn: fn(),
}
