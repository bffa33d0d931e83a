//! Staged boot-test framework for the Orion kernel.
//!
//! Tests are plain functions marked with `#[kernel_test]`; the proc macro
//! places a [`KernelTestDescriptor`] into the `.orion_kernel_tests` linker
//! section and the kernel's test runner walks the section at the matching
//! boot stage. Results are reported over COM1 and the run finishes by
//! exiting QEMU through the `isa-debug-exit` device.
//!
//! # Stages
//!
//! | Stage | Available subsystems |
//! |-------|---------------------|
//! | `early_boot` | frame allocator, VMM, heap |
//! | `before_sched` | + IRQ, clock, VFS, devices, logging |
//! | `with_sched` | + scheduler (the test runs in its own kernel thread) |
//! | `userspace` | + user process support |

#![no_std]
#![warn(missing_docs)]

mod descriptor;
#[doc(hidden)]
pub mod serial;

pub use descriptor::{KernelTestDescriptor, TestStage};

// Re-export the proc macro.
pub use orion_ktest_macros::kernel_test;

orion_linkset::declare_linkset! {
    /// Returns all registered kernel test descriptors.
    pub fn kernel_test_entries() -> [KernelTestDescriptor],
    section = "orion_kernel_tests"
}

/// QEMU exit interface for the `isa-debug-exit` device.
pub mod qemu {
    /// Exit code indicating all tests passed (process exit code 33).
    pub const SUCCESS: u32 = 0x10;
    /// Exit code indicating a test failure (process exit code 35).
    pub const FAILURE: u32 = 0x11;

    /// Exits QEMU via the `isa-debug-exit` device at port `0xF4`.
    ///
    /// QEMU computes the process exit code as `(value << 1) | 1`.
    #[cfg(target_arch = "x86_64")]
    pub fn exit_qemu(code: u32) -> ! {
        // SAFETY: Port 0xF4 is the isa-debug-exit device configured by the
        // test harness; writing to it terminates the VM.
        unsafe {
            core::arch::asm!("out dx, eax", in("dx") 0xF4u16, in("eax") code,
                options(nomem, nostack, preserves_flags));
        }
        loop {
            core::hint::spin_loop();
        }
    }

    /// Host stub so the crate type-checks off-target.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn exit_qemu(_code: u32) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}
