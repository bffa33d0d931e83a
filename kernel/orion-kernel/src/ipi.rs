//! Inter-processor interrupts.
//!
//! Delivery publishes a `{type, payload, ack}` triple under a spin mutex,
//! writes the LAPIC ICR for each destination, and busy-waits until every
//! target CPU has bumped the ack counter. Receivers run their handler
//! inline in the interrupt frame. Vectors are pinned compile-time
//! constants reserved out of the IRQ vector pool.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::addr::{PhysAddr, VirtAddr};
use crate::irq::{IPI_VECTOR_INVLPG, IPI_VECTOR_NOOP, IPI_VECTOR_PANIC, IPI_VECTOR_SCHEDULE};
use crate::percpu::CpuId;
use crate::sync::SpinMutex;

/// IPI message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiType {
    /// Wake the target out of halt; no action.
    Noop,
    /// Invalidate a VA range of one address space.
    Invlpg,
    /// Re-run the target's scheduler.
    Schedule,
    /// Halt: a CPU is panicking.
    Panic,
}

/// The in-flight IPI message (one at a time, system-wide).
struct IpiMessage {
    kind: IpiType,
    /// INVLPG payload: address-space root.
    space_root: PhysAddr,
    /// INVLPG payload: range base.
    va: VirtAddr,
    /// INVLPG payload: range length.
    len: u64,
    /// Optional remote handler for PANIC.
    panic_handler: Option<fn()>,
}

static MESSAGE: SpinMutex<IpiMessage> = SpinMutex::named(
    "IPI_MESSAGE",
    IpiMessage {
        kind: IpiType::Noop,
        space_root: PhysAddr::zero(),
        va: VirtAddr::zero(),
        len: 0,
        panic_handler: None,
    },
);

/// Acks from receivers for the message in flight.
static ACKS: AtomicU32 = AtomicU32::new(0);

fn vector_for(kind: IpiType) -> u8 {
    match kind {
        IpiType::Noop => IPI_VECTOR_NOOP,
        IpiType::Invlpg => IPI_VECTOR_INVLPG,
        IpiType::Schedule => IPI_VECTOR_SCHEDULE,
        IpiType::Panic => IPI_VECTOR_PANIC,
    }
}

/// Sends an IPI to every other CPU and waits for their acks.
fn send_to_others(fill: impl FnOnce(&mut IpiMessage)) {
    let others = crate::percpu::cpu_count().saturating_sub(1);
    if others == 0 {
        return;
    }
    let mut message = MESSAGE.lock();
    fill(&mut message);
    let kind = message.kind;
    ACKS.store(0, Ordering::Release);
    crate::arch::x86_64::lapic::broadcast_ipi(vector_for(kind));
    while ACKS.load(Ordering::Acquire) < others {
        core::hint::spin_loop();
    }
    drop(message);
}

/// TLB shootdown: invalidate `[va, va+len)` of the space rooted at
/// `root` on every other CPU running it.
pub fn send_invlpg(root: PhysAddr, va: VirtAddr, len: u64) {
    send_to_others(|m| {
        m.kind = IpiType::Invlpg;
        m.space_root = root;
        m.va = va;
        m.len = len;
    });
}

/// Nudges a remote CPU to reschedule.
pub fn send_schedule(cpu: CpuId) {
    if cpu == crate::percpu::current_cpu().id() {
        return;
    }
    // SCHEDULE carries no payload; no ack needed beyond delivery.
    crate::arch::x86_64::lapic::send_ipi(cpu, IPI_VECTOR_SCHEDULE);
}

/// Halts every other CPU (the panic path), optionally running a handler
/// on each before the halt.
pub fn send_panic(handler: Option<fn()>) {
    send_to_others(|m| {
        m.kind = IpiType::Panic;
        m.panic_handler = handler;
    });
}

/// Receiver side, called from the arch interrupt stubs.
pub fn handle(vector: u8) {
    match vector {
        IPI_VECTOR_NOOP => {
            ACKS.fetch_add(1, Ordering::AcqRel);
        }
        IPI_VECTOR_INVLPG => {
            let (root, va, len) = {
                // The sender holds the message lock; read the payload
                // without reacquiring it (we only race the fields the
                // sender published before the ICR write).
                // SAFETY: The payload fields are stable while the sender
                // busy-waits on our ack.
                let message = unsafe { MESSAGE.force_get() };
                (message.space_root, message.va, message.len)
            };
            if crate::percpu::current_cpu().curspace == root.as_u64()
                || root == PhysAddr::zero()
            {
                crate::arch::x86_64::tlb::invalidate_range(va, len);
            }
            ACKS.fetch_add(1, Ordering::AcqRel);
        }
        IPI_VECTOR_SCHEDULE => {
            // The actual reschedule happens at interrupt return.
            crate::percpu::current_cpu().set_preempt_pending(true);
        }
        IPI_VECTOR_PANIC => {
            let handler = {
                // SAFETY: Same stability argument as INVLPG.
                let message = unsafe { MESSAGE.force_get() };
                message.panic_handler
            };
            if let Some(handler) = handler {
                handler();
            }
            ACKS.fetch_add(1, Ordering::AcqRel);
            crate::arch::x86_64::halt_forever();
        }
        _ => crate::kwarn!("ipi: unknown vector {vector:#x}"),
    }
}
