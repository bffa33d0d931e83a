//! Interrupt descriptor table and exception entry points.
//!
//! CPU exceptions get dedicated handlers (the page fault routes into the
//! VMM); vectors ≥ 32 funnel through per-vector stubs into the IRQ
//! dispatch and the IPI receiver. Every interrupt return passes the
//! preemption check.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::VirtAddr;
use crate::mm::vmm::{FaultAccess, FaultOutcome};

use super::gdt::KERNEL_CS;

/// One IDT gate.
#[repr(C)]
#[derive(Clone, Copy)]
struct Gate {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl Gate {
    const EMPTY: Gate = Gate {
        offset_low: 0,
        selector: 0,
        ist: 0,
        type_attr: 0,
        offset_mid: 0,
        offset_high: 0,
        _reserved: 0,
    };

    fn interrupt(handler: u64) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CS,
            ist: 0,
            type_attr: 0x8E, // present, DPL 0, interrupt gate
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            _reserved: 0,
        }
    }
}

/// The IDT, written once at init through atomics-free single-CPU setup.
static mut IDT: [Gate; 256] = [Gate::EMPTY; 256];

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

/// The interrupt frame pushed by the CPU.
#[repr(C)]
#[derive(Debug)]
pub struct InterruptFrame {
    /// Faulting/next instruction.
    pub rip: u64,
    /// Code segment.
    pub cs: u64,
    /// Saved flags.
    pub rflags: u64,
    /// Stack pointer at interruption.
    pub rsp: u64,
    /// Stack segment.
    pub ss: u64,
}

/// Exceptions observed, for diagnostics.
static EXCEPTION_COUNT: AtomicU64 = AtomicU64::new(0);

extern "x86-interrupt" fn divide_error(frame: InterruptFrame) {
    fatal_exception("divide error", &frame, None);
}

extern "x86-interrupt" fn invalid_opcode(frame: InterruptFrame) {
    fatal_exception("invalid opcode", &frame, None);
}

extern "x86-interrupt" fn double_fault(frame: InterruptFrame, code: u64) -> ! {
    fatal_exception("double fault", &frame, Some(code));
}

extern "x86-interrupt" fn general_protection(frame: InterruptFrame, code: u64) {
    if frame.cs & 3 == 3 {
        user_fault(orion_syscall::signal::SIGSEGV, frame.rip as usize);
        return;
    }
    fatal_exception("general protection fault", &frame, Some(code));
}

extern "x86-interrupt" fn page_fault(frame: InterruptFrame, code: u64) {
    let addr = VirtAddr::new_truncate(super::control::Cr2::read());
    let access = FaultAccess {
        write: code & 0x2 != 0,
        exec: code & 0x10 != 0,
        user: code & 0x4 != 0,
        present: code & 0x1 != 0,
    };

    let outcome = fault_space(addr)
        .map_or(FaultOutcome::Fatal, |space| space.handle_fault(addr, access));

    match outcome {
        FaultOutcome::Resolved => {}
        FaultOutcome::Segv(si_code) => {
            if let Some(proc) = crate::sched::current_process() {
                crate::proc::signal::send(&proc, orion_syscall::signal::SigInfo {
                    si_signo: orion_syscall::signal::SIGSEGV,
                    si_code,
                    si_addr: addr.as_u64() as usize,
                    ..Default::default()
                });
            } else {
                fatal_exception("page fault with no process", &frame, Some(code));
            }
        }
        FaultOutcome::Fatal => {
            crate::kfatal!(
                "page fault at {addr} (code {code:#x}, rip {:#x})",
                frame.rip
            );
            fatal_exception("unrecoverable page fault", &frame, Some(code));
        }
    }
}

/// The address space responsible for a faulting address.
fn fault_space(addr: VirtAddr) -> Option<alloc::sync::Arc<crate::mm::vmm::AddressSpace>> {
    if addr.is_kernel() {
        Some(crate::boot::kernel_space_arc())
    } else {
        crate::sched::current_process().and_then(|p| p.space())
    }
}

fn user_fault(signo: i32, addr: usize) {
    if let Some(proc) = crate::sched::current_process() {
        crate::proc::signal::send(&proc, orion_syscall::signal::SigInfo {
            si_signo: signo,
            si_code: orion_syscall::signal::SI_KERNEL,
            si_addr: addr,
            ..Default::default()
        });
    }
}

fn fatal_exception(what: &str, frame: &InterruptFrame, code: Option<u64>) -> ! {
    EXCEPTION_COUNT.fetch_add(1, Ordering::Relaxed);
    match code {
        Some(code) => {
            panic!("{what} at rip {:#x} (error code {code:#x})", frame.rip)
        }
        None => panic!("{what} at rip {:#x}", frame.rip),
    }
}

// ---------------------------------------------------------------------------
// Device-vector stubs
// ---------------------------------------------------------------------------

/// Generates one `extern "x86-interrupt"` stub per device vector so the
/// dispatcher learns the vector number.
macro_rules! device_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptFrame) {
            device_interrupt($vector);
        }
    };
}

fn device_interrupt(vector: u8) {
    match vector {
        crate::irq::IPI_VECTOR_NOOP
        | crate::irq::IPI_VECTOR_INVLPG
        | crate::irq::IPI_VECTOR_SCHEDULE
        | crate::irq::IPI_VECTOR_PANIC => crate::ipi::handle(vector),
        _ => crate::irq::dispatch(vector),
    }
    super::lapic::eoi();
    // The interrupt-return preemption point.
    crate::sched::preempt_check();
}

// The timer tick and the ISA band get dedicated stubs; the rest of the
// vector space shares a spread of stubs installed in blocks of 16.
device_stub!(stub_32, 32);
device_stub!(stub_33, 33);
device_stub!(stub_34, 34);
device_stub!(stub_35, 35);
device_stub!(stub_36, 36);
device_stub!(stub_37, 37);
device_stub!(stub_38, 38);
device_stub!(stub_39, 39);
device_stub!(stub_40, 40);
device_stub!(stub_41, 41);
device_stub!(stub_42, 42);
device_stub!(stub_43, 43);
device_stub!(stub_44, 44);
device_stub!(stub_45, 45);
device_stub!(stub_46, 46);
device_stub!(stub_47, 47);
device_stub!(stub_timer, super::lapic::TIMER_VECTOR);
device_stub!(stub_ipi_noop, crate::irq::IPI_VECTOR_NOOP);
device_stub!(stub_ipi_invlpg, crate::irq::IPI_VECTOR_INVLPG);
device_stub!(stub_ipi_sched, crate::irq::IPI_VECTOR_SCHEDULE);
device_stub!(stub_ipi_panic, crate::irq::IPI_VECTOR_PANIC);

/// Loads the IDT on the current CPU (the table itself is shared).
pub fn init() {
    // SAFETY: Single-threaded during BSP init; APs only load the pointer.
    unsafe {
        let idt = &mut *core::ptr::addr_of_mut!(IDT);
        idt[0] = Gate::interrupt(divide_error as usize as u64);
        idt[6] = Gate::interrupt(invalid_opcode as usize as u64);
        idt[8] = Gate::interrupt(double_fault as usize as u64);
        idt[13] = Gate::interrupt(general_protection as usize as u64);
        idt[14] = Gate::interrupt(page_fault as usize as u64);

        let isa_stubs: [u64; 16] = [
            stub_32 as usize as u64,
            stub_33 as usize as u64,
            stub_34 as usize as u64,
            stub_35 as usize as u64,
            stub_36 as usize as u64,
            stub_37 as usize as u64,
            stub_38 as usize as u64,
            stub_39 as usize as u64,
            stub_40 as usize as u64,
            stub_41 as usize as u64,
            stub_42 as usize as u64,
            stub_43 as usize as u64,
            stub_44 as usize as u64,
            stub_45 as usize as u64,
            stub_46 as usize as u64,
            stub_47 as usize as u64,
        ];
        for (i, &stub) in isa_stubs.iter().enumerate() {
            idt[32 + i] = Gate::interrupt(stub);
        }
        idt[super::lapic::TIMER_VECTOR as usize] = Gate::interrupt(stub_timer as usize as u64);
        idt[crate::irq::IPI_VECTOR_NOOP as usize] =
            Gate::interrupt(stub_ipi_noop as usize as u64);
        idt[crate::irq::IPI_VECTOR_INVLPG as usize] =
            Gate::interrupt(stub_ipi_invlpg as usize as u64);
        idt[crate::irq::IPI_VECTOR_SCHEDULE as usize] =
            Gate::interrupt(stub_ipi_sched as usize as u64);
        idt[crate::irq::IPI_VECTOR_PANIC as usize] =
            Gate::interrupt(stub_ipi_panic as usize as u64);

        let pointer = IdtPointer {
            limit: (size_of::<[Gate; 256]>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as u64,
        };
        core::arch::asm!("lidt [{}]", in(reg) &pointer);
    }
}
