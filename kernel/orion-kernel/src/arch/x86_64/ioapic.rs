//! I/O APIC programming.
//!
//! Routes ISA and device IRQs (as global system interrupts) to the
//! vectors the IRQ layer assigns. Interrupt source overrides from the
//! MADT are applied before any routing.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::PhysAddr;
use crate::sync::SpinMutex;

const REG_SELECT: u64 = 0x00;
const REG_DATA: u64 = 0x10;
/// First redirection-table register.
const REG_REDTBL_BASE: u32 = 0x10;

/// Virtual base of the (first) I/O APIC.
static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0);
/// GSI base of the (first) I/O APIC.
static GSI_BASE: AtomicU64 = AtomicU64::new(0);

/// ISA IRQ → GSI overrides from the MADT (identity by default).
static OVERRIDES: SpinMutex<[u32; 16]> = SpinMutex::named(
    "IOAPIC_OVERRIDES",
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
);

fn write_reg(index: u32, value: u32) {
    let base = IOAPIC_BASE.load(Ordering::Acquire);
    // SAFETY: The IOAPIC window was mapped during init.
    unsafe {
        ((base + REG_SELECT) as *mut u32).write_volatile(index);
        ((base + REG_DATA) as *mut u32).write_volatile(value);
    }
}

/// Maps the I/O APIC and records its GSI base.
pub fn init(phys: PhysAddr, gsi_base: u32) {
    let virt = crate::mm::highmem::phys_to_virt(phys);
    IOAPIC_BASE.store(virt.as_u64(), Ordering::Release);
    GSI_BASE.store(u64::from(gsi_base), Ordering::Release);
}

/// Records an ISA interrupt source override.
pub fn set_override(source: u8, gsi: u32) {
    if let Some(slot) = OVERRIDES.lock().get_mut(source as usize) {
        *slot = gsi;
    }
}

/// Routes an IRQ to a vector on the BSP, optionally masked.
pub fn route(irq: u32, vector: u8, masked: bool) {
    let gsi = if irq < 16 { OVERRIDES.lock()[irq as usize] } else { irq };
    let index = REG_REDTBL_BASE + 2 * (gsi - GSI_BASE.load(Ordering::Acquire) as u32);
    let mut low = u32::from(vector);
    if masked {
        low |= 1 << 16;
    }
    // Destination: physical mode, APIC id 0 (the BSP).
    write_reg(index + 1, 0);
    write_reg(index, low);
}
