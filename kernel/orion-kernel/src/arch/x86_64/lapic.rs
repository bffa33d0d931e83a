//! Local APIC: interrupt acknowledgement, IPIs, and the per-CPU timer.
//!
//! The LAPIC timer is the alarm source: one-shot capable, so the kernel
//! runs tickless. Its frequency is calibrated once against the PIT.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::PhysAddr;
use crate::percpu::CpuId;

/// Vector the LAPIC timer fires on.
pub const TIMER_VECTOR: u8 = 0xEF;

// Register offsets.
const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_TIMER_LVT: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;

/// Virtual base of the LAPIC registers (HHDM-mapped at init).
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Calibrated timer ticks per millisecond.
static TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

fn reg(offset: u64) -> *mut u32 {
    ((LAPIC_BASE.load(Ordering::Acquire)) + offset) as *mut u32
}

fn read(offset: u64) -> u32 {
    // SAFETY: The LAPIC window was mapped during init.
    unsafe { reg(offset).read_volatile() }
}

fn write(offset: u64, value: u32) {
    // SAFETY: The LAPIC window was mapped during init.
    unsafe { reg(offset).write_volatile(value) }
}

/// Maps and enables the local APIC on this CPU.
///
/// `phys` comes from the MADT (or the APIC base MSR).
pub fn init(phys: PhysAddr) {
    if LAPIC_BASE.load(Ordering::Acquire) == 0 {
        let virt = crate::mm::highmem::phys_to_virt(phys);
        LAPIC_BASE.store(virt.as_u64(), Ordering::Release);
    }
    // Software-enable with the spurious vector at 0xFF.
    write(REG_SPURIOUS, 0x100 | 0xFF);
    // Timer: one-shot, masked until armed, divide by 16.
    write(REG_TIMER_DIVIDE, 0b0011);
    write(REG_TIMER_LVT, u32::from(TIMER_VECTOR) | LVT_MASKED);
}

/// This CPU's APIC id.
#[must_use]
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

/// Signals end-of-interrupt.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Calibrates the timer against the PIT (one 10 ms window).
pub fn calibrate_timer() {
    write(REG_TIMER_INITIAL, u32::MAX);
    super::pit::spin_wait_ms(10);
    let elapsed = u64::from(u32::MAX - read(REG_TIMER_CURRENT));
    let per_ms = (elapsed / 10).max(1);
    TICKS_PER_MS.store(per_ms, Ordering::Release);
    write(REG_TIMER_INITIAL, 0);
    crate::kinfo!("lapic: timer calibrated at {} ticks/ms", per_ms);
}

fn ns_to_ticks(ns: u64) -> u32 {
    let per_ms = TICKS_PER_MS.load(Ordering::Acquire).max(1);
    u32::try_from((u128::from(ns) * u128::from(per_ms) / 1_000_000).max(1))
        .unwrap_or(u32::MAX)
}

/// The LAPIC timer as the kernel alarm source.
pub struct LapicTimer;

impl crate::time::alarm::AlarmSource for LapicTimer {
    fn name(&self) -> &'static str {
        "lapic-timer"
    }

    fn oneshot_supported(&self) -> bool {
        true
    }

    fn arm_oneshot(&self, delay_ns: u64) {
        write(REG_TIMER_LVT, u32::from(TIMER_VECTOR));
        write(REG_TIMER_INITIAL, ns_to_ticks(delay_ns));
    }

    fn arm_periodic(&self, period_ns: u64) {
        write(REG_TIMER_LVT, u32::from(TIMER_VECTOR) | (1 << 17));
        write(REG_TIMER_INITIAL, ns_to_ticks(period_ns));
    }

    fn disarm(&self) {
        write(REG_TIMER_LVT, u32::from(TIMER_VECTOR) | LVT_MASKED);
        write(REG_TIMER_INITIAL, 0);
    }
}

// ---------------------------------------------------------------------------
// IPIs
// ---------------------------------------------------------------------------

fn wait_icr_idle() {
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

/// Sends a fixed IPI to one CPU.
pub fn send_ipi(cpu: CpuId, vector: u8) {
    let apic_id = crate::boot::apic_id_of(cpu);
    wait_icr_idle();
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, u32::from(vector));
}

/// Sends a fixed IPI to every CPU but this one.
pub fn broadcast_ipi(vector: u8) {
    wait_icr_idle();
    write(REG_ICR_HIGH, 0);
    // Destination shorthand 0b11: all excluding self.
    write(REG_ICR_LOW, (0b11 << 18) | u32::from(vector));
}
