//! Per-CPU state.
//!
//! Each CPU owns one cache-line-aligned [`PerCpu`] page reachable through
//! GS-relative addressing: `GS:[0]` holds a self-pointer, so `current_cpu`,
//! and through it the current-thread/process/scheduler mirrors, resolve in
//! one indirection. The BSP uses a static instance; APs allocate theirs on
//! the heap during bootstrap.
//!
//! Initialization functions are collected in three linker sections run at
//! different points of bring-up: `early` on every CPU as it comes online,
//! `static` on the BSP once, and `module` inside the root kernel thread.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::config::MAX_CPUS;

/// Logical CPU identifier (0 = BSP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Wraps a raw CPU number.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw CPU number.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the CPU number as an index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Per-CPU data page.
///
/// `#[repr(C)]` keeps field offsets stable for the assembly entry stubs:
/// - offset  0: `self_ptr` (the `GS:[0]` self-pointer)
/// - offset  8: `kernel_rsp`
/// - offset 16: `user_rsp`
/// - offset 24: `curthread` mirror
/// - offset 32: `curproc` mirror
/// - offset 40: `curspace` mirror (user PML4 phys, for CR3 switches)
/// - offset 48: `user_rip` (syscall entry capture)
/// - offset 56: `user_rflags` (syscall entry capture)
/// - offset 64: `cpu_id` / `apic_id` / flags
#[repr(C, align(64))]
pub struct PerCpu {
    /// Self-pointer for the `GS:[0]` access pattern.
    pub self_ptr: u64,
    /// Kernel stack pointer loaded on syscall entry.
    pub kernel_rsp: u64,
    /// Saved user stack pointer during syscall handling.
    pub user_rsp: u64,
    /// Raw pointer to the running thread (mirror of the scheduler state).
    pub curthread: AtomicPtr<()>,
    /// Raw pointer to the running thread's process.
    pub curproc: AtomicPtr<()>,
    /// Physical address of the active user address space root.
    pub curspace: u64,
    /// User RIP captured by the syscall entry stub (offset 48).
    pub user_rip: u64,
    /// User RFLAGS captured by the syscall entry stub (offset 56).
    pub user_rflags: u64,
    /// Logical CPU ID.
    cpu_id: AtomicU32,
    /// Local APIC ID.
    apic_id: AtomicU32,
    /// Whether a preemption is pending for the running thread.
    preempt_pending: AtomicBool,
    /// Whether this instance finished initialization.
    initialized: AtomicBool,
}

impl PerCpu {
    /// Creates an uninitialized `PerCpu`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            user_rsp: 0,
            curthread: AtomicPtr::new(core::ptr::null_mut()),
            curproc: AtomicPtr::new(core::ptr::null_mut()),
            curspace: 0,
            user_rip: 0,
            user_rflags: 0,
            cpu_id: AtomicU32::new(0),
            apic_id: AtomicU32::new(0),
            preempt_pending: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    /// Records identity and marks the instance initialized.
    pub fn init(&self, cpu_id: CpuId, apic_id: u32) {
        self.cpu_id.store(cpu_id.as_u32(), Ordering::Relaxed);
        self.apic_id.store(apic_id, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Returns the logical CPU ID.
    #[must_use]
    pub fn id(&self) -> CpuId {
        CpuId::new(self.cpu_id.load(Ordering::Relaxed))
    }

    /// Returns the local APIC ID.
    #[must_use]
    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Relaxed)
    }

    /// Whether this instance finished initialization.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Marks or clears a pending preemption for the running thread.
    pub fn set_preempt_pending(&self, pending: bool) {
        self.preempt_pending.store(pending, Ordering::Release);
    }

    /// Reads and clears the pending-preemption flag.
    #[must_use]
    pub fn take_preempt_pending(&self) -> bool {
        self.preempt_pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// BSP per-CPU data (also the host-test instance).
static BSP_PERCPU: PerCpu = PerCpu::new();

/// Number of online CPUs.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Returns the number of online CPUs.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Records the number of online CPUs.
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::Release);
}

/// Returns the current CPU's per-CPU data.
///
/// Reads the self-pointer from `GS:[0]`, set during CPU init.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn current_cpu() -> &'static PerCpu {
    // SAFETY: GS:[0] holds the self_ptr field written during init_gs_base
    // (BSP) or AP bootstrap; the pointed-to PerCpu lives forever.
    unsafe {
        let ptr: u64;
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

/// Host fallback: a single-CPU system using the BSP instance.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
pub fn current_cpu() -> &'static PerCpu {
    &BSP_PERCPU
}

/// Points the GS base MSRs at the BSP per-CPU data.
///
/// Sets both `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` so `swapgs` is a
/// no-op from ring 0 until the first user process exists.
///
/// # Safety
///
/// Must be called after GDT init and before any syscall or per-CPU access.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub unsafe fn init_gs_base() {
    use crate::arch::x86_64::msr::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};

    let percpu_addr = core::ptr::addr_of!(BSP_PERCPU) as u64;
    // SAFETY: BSP_PERCPU is a static; writing its self_ptr before any
    // per-CPU access is the caller's contract.
    unsafe {
        let percpu_mut = core::ptr::addr_of!(BSP_PERCPU).cast_mut();
        (*percpu_mut).self_ptr = percpu_addr;
        IA32_GS_BASE.write(percpu_addr);
        IA32_KERNEL_GS_BASE.write(percpu_addr);
    }
}

/// CPU-local storage: one `T` per possible CPU, indexed by CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Wraps a pre-built array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns the current CPU's slot.
    pub fn get(&self) -> &T {
        &self.data[current_cpu().id().as_usize()]
    }

    /// Returns a specific CPU's slot.
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }

    /// Iterates every CPU slot (online or not).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}

// SAFETY: Each CPU only touches its own slot; cross-CPU access goes through
// whatever synchronization T itself provides.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

// ---------------------------------------------------------------------------
// Phased init sections
// ---------------------------------------------------------------------------

/// An initialization function collected in a linker section.
pub type InitFn = fn();

/// A named init entry.
pub struct InitEntry {
    /// Diagnostic name.
    pub name: &'static str,
    /// The function to run.
    pub func: InitFn,
}

orion_linkset::declare_linkset! {
    /// Init functions run on every CPU as it comes online.
    pub fn percpu_early_init_entries() -> [InitEntry],
    section = "orion_percpu_early_init"
}

orion_linkset::declare_linkset! {
    /// Init functions run once on the BSP before the scheduler starts.
    pub fn static_init_entries() -> [InitEntry],
    section = "orion_static_init"
}

orion_linkset::declare_linkset! {
    /// Init functions run inside the root kernel thread.
    pub fn module_init_entries() -> [InitEntry],
    section = "orion_module_init"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_current_cpu_is_bsp() {
        let cpu = current_cpu();
        assert_eq!(cpu.id(), CpuId::new(0));
    }

    #[test]
    fn preempt_flag_take_clears() {
        let cpu = PerCpu::new();
        assert!(!cpu.take_preempt_pending());
        cpu.set_preempt_pending(true);
        assert!(cpu.take_preempt_pending());
        assert!(!cpu.take_preempt_pending());
    }

    #[test]
    fn cpu_local_indexing() {
        let local: CpuLocal<u32> = CpuLocal::new([7; MAX_CPUS]);
        assert_eq!(*local.get(), 7);
        assert_eq!(*local.get_for(CpuId::new(3)), 7);
        assert_eq!(local.iter().count(), MAX_CPUS);
    }
}
