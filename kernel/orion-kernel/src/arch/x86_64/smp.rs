//! Application-processor bring-up.
//!
//! Each AP runs the per-CPU early-init chain, installs its GS base and
//! descriptor tables, brings its scheduler online with fresh boot and
//! idle threads, and parks in the idle loop.

extern crate alloc;

use alloc::boxed::Box;

use crate::percpu::{CpuId, PerCpu};

/// AP entry, called from the bootstrap trampoline with the CPU number.
///
/// # Safety
///
/// Must run exactly once per AP with a valid, unique stack.
pub unsafe extern "C" fn ap_entry(cpu_number: u64, _arg: u64) -> ! {
    let percpu: &'static mut PerCpu = Box::leak(Box::new(PerCpu::new()));
    percpu.self_ptr = core::ptr::from_ref(&*percpu) as u64;

    // SAFETY: Setting both GS bases before any per-CPU access.
    unsafe {
        super::msr::IA32_GS_BASE.write(percpu.self_ptr);
        super::msr::IA32_KERNEL_GS_BASE.write(percpu.self_ptr);
    }

    super::cpu_init();
    percpu.init(CpuId::new(cpu_number as u32), super::lapic::id());

    // Early-init hooks run on every CPU.
    for entry in crate::percpu::percpu_early_init_entries() {
        (entry.func)();
    }

    let boot = crate::proc::Thread::adopt_current("ap_boot");
    let idle = crate::proc::Thread::new_kernel("idle", crate::boot::idle_loop, 0)
        .expect("AP idle thread");
    idle.set_priority(0);
    crate::sched::init_cpu(boot, idle);
    crate::sched::start_tick();

    // SAFETY: IDT and LAPIC are programmed.
    unsafe { super::enable_interrupts() };
    crate::kinfo!("cpu {} online", cpu_number);

    crate::boot::idle_loop(0);
    unreachable!("idle loop returned");
}
