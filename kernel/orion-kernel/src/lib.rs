//! Orion kernel library.
//!
//! A monolithic, preemptive, SMP x86-64 kernel core: physical and virtual
//! memory management, a per-CPU thread scheduler, IRQ/IPI and timekeeping
//! plumbing, and a vnode/ventry VFS with kqueue-style event notification.
//!
//! Pure-logic modules compile on the host so their unit tests run under
//! `cargo test`; hardware-bound modules require `target_os = "none"`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![warn(missing_docs)]

extern crate alloc;

// ── Always-available modules (pure logic, host-testable) ─────────────────

pub mod addr;
pub mod config;
pub mod dev;
pub mod fs;
pub mod ipc;
pub mod log;
pub mod mm;
pub mod percpu;
pub mod proc;
pub mod sched;
pub mod sync;
pub mod time;
pub mod tty;

pub mod irq;
pub mod syscall;

// ── Kernel-runtime modules (require target_os = "none") ──────────────────

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod backtrace;
#[cfg(target_os = "none")]
pub mod boot;
#[cfg(target_os = "none")]
pub mod drivers;
#[cfg(target_os = "none")]
pub mod ipi;
#[cfg(target_os = "none")]
pub mod ktest;
#[cfg(all(target_os = "none", ktest))]
mod ktest_tests;

#[cfg(target_os = "none")]
pub use boot::kernel_init;
pub use log::LogLevel;
