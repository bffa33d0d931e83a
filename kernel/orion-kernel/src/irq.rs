//! IRQ management: vector reservation and handler dispatch.
//!
//! The layer owns the pool of free interrupt vectors (≥ 32, minus the
//! pinned IPI vectors) and the `irq → {vector, handler, cookie}` map.
//! ISA IRQs land on well-known vectors (32 + irq) programmed into the
//! IOAPIC at init; other IRQ numbers are reserved dynamically. Handlers
//! run inline in the interrupt frame.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use orion_syscall::Errno;

use crate::sync::SpinMutex;

/// First vector available to devices (0..32 are CPU exceptions).
pub const VECTOR_BASE: u8 = 32;

/// Number of legacy ISA IRQ lines pinned at `VECTOR_BASE`.
pub const ISA_IRQS: u32 = 16;

/// Pinned IPI vectors (reserved out of the pool at init).
pub const IPI_VECTOR_NOOP: u8 = 0xF0;
/// TLB shootdown.
pub const IPI_VECTOR_INVLPG: u8 = 0xF1;
/// Remote run-queue wakeup.
pub const IPI_VECTOR_SCHEDULE: u8 = 0xF2;
/// Halt for panic.
pub const IPI_VECTOR_PANIC: u8 = 0xF3;

/// An interrupt handler plus its registration cookie.
pub type IrqHandler = fn(cookie: usize);

struct IrqEntry {
    vector: u8,
    handler: Option<(IrqHandler, usize)>,
    enabled: bool,
}

/// The vector pool and irq map (pure state, testable off-target).
pub struct IrqTable {
    free_vectors: Vec<u8>,
    irqs: BTreeMap<u32, IrqEntry>,
    next_irqnum: u32,
}

impl IrqTable {
    /// Builds the initial table: ISA IRQs pinned, the rest of the vector
    /// space free except the IPI vectors.
    #[must_use]
    pub fn new() -> Self {
        let mut free_vectors = Vec::new();
        for vector in (VECTOR_BASE + ISA_IRQS as u8)..=u8::MAX {
            if !matches!(
                vector,
                IPI_VECTOR_NOOP | IPI_VECTOR_INVLPG | IPI_VECTOR_SCHEDULE | IPI_VECTOR_PANIC
            ) {
                free_vectors.push(vector);
            }
        }
        let mut irqs = BTreeMap::new();
        for irq in 0..ISA_IRQS {
            irqs.insert(irq, IrqEntry {
                vector: VECTOR_BASE + irq as u8,
                handler: None,
                enabled: false,
            });
        }
        Self { free_vectors, irqs, next_irqnum: ISA_IRQS }
    }

    /// Reserves an IRQ number, honoring `hint` when it is free.
    pub fn reserve_irqnum(&mut self, hint: Option<u32>) -> Result<u32, Errno> {
        let irq = match hint {
            Some(h) if !self.irqs.contains_key(&h) => h,
            _ => {
                while self.irqs.contains_key(&self.next_irqnum) {
                    self.next_irqnum += 1;
                }
                self.next_irqnum
            }
        };
        let vector = self.free_vectors.pop().ok_or(Errno::EAGAIN)?;
        self.irqs.insert(irq, IrqEntry { vector, handler: None, enabled: false });
        Ok(irq)
    }

    /// Registers the handler for an IRQ.
    pub fn register_handler(
        &mut self,
        irq: u32,
        handler: IrqHandler,
        cookie: usize,
    ) -> Result<(), Errno> {
        let entry = self.irqs.get_mut(&irq).ok_or(Errno::ENOENT)?;
        if entry.handler.is_some() {
            return Err(Errno::EBUSY);
        }
        entry.handler = Some((handler, cookie));
        Ok(())
    }

    /// The vector assigned to an IRQ.
    pub fn vector(&self, irq: u32) -> Result<u8, Errno> {
        self.irqs.get(&irq).map(|e| e.vector).ok_or(Errno::ENOENT)
    }

    /// Marks an IRQ enabled/disabled. Returns the vector for IOAPIC
    /// programming.
    pub fn set_enabled(&mut self, irq: u32, enabled: bool) -> Result<u8, Errno> {
        let entry = self.irqs.get_mut(&irq).ok_or(Errno::ENOENT)?;
        entry.enabled = enabled;
        Ok(entry.vector)
    }

    /// Finds the handler for a vector (the dispatch path).
    #[must_use]
    pub fn handler_for_vector(&self, vector: u8) -> Option<(IrqHandler, usize)> {
        self.irqs
            .values()
            .find(|e| e.vector == vector && e.enabled)
            .and_then(|e| e.handler)
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

static TABLE: SpinMutex<Option<IrqTable>> = SpinMutex::named("IRQ_TABLE", None);

/// Initializes the IRQ layer.
///
/// # Panics
///
/// Panics if called twice.
pub fn init() {
    let mut table = TABLE.lock();
    assert!(table.is_none(), "IRQ layer already initialized");
    *table = Some(IrqTable::new());
}

fn with_table<R>(f: impl FnOnce(&mut IrqTable) -> Result<R, Errno>) -> Result<R, Errno> {
    let mut table = TABLE.lock();
    f(table.as_mut().ok_or(Errno::EFAILED)?)
}

/// Reserves an IRQ number (honoring `hint` when free) with a vector.
pub fn reserve_irqnum(hint: Option<u32>) -> Result<u32, Errno> {
    with_table(|t| t.reserve_irqnum(hint))
}

/// Registers a handler for an IRQ.
pub fn register_handler(irq: u32, handler: IrqHandler, cookie: usize) -> Result<(), Errno> {
    with_table(|t| t.register_handler(irq, handler, cookie))
}

/// The vector assigned to an IRQ.
pub fn get_vector(irq: u32) -> Result<u8, Errno> {
    with_table(|t| t.vector(irq))
}

/// Unmasks an IRQ at the IOAPIC.
pub fn enable_interrupt(irq: u32) -> Result<(), Errno> {
    let vector = with_table(|t| t.set_enabled(irq, true))?;
    route_to_ioapic(irq, vector, false);
    Ok(())
}

/// Masks an IRQ at the IOAPIC.
pub fn disable_interrupt(irq: u32) -> Result<(), Errno> {
    let vector = with_table(|t| t.set_enabled(irq, false))?;
    route_to_ioapic(irq, vector, true);
    Ok(())
}

/// Dispatches a device interrupt from the arch entry stub.
///
/// Runs the handler inline in the interrupt frame.
pub fn dispatch(vector: u8) {
    let handler = {
        let table = TABLE.lock();
        table.as_ref().and_then(|t| t.handler_for_vector(vector))
    };
    match handler {
        Some((handler, cookie)) => handler(cookie),
        None => crate::kwarn!("irq: spurious vector {vector:#x}"),
    }
}

#[cfg(target_os = "none")]
fn route_to_ioapic(irq: u32, vector: u8, masked: bool) {
    crate::arch::x86_64::ioapic::route(irq, vector, masked);
}

#[cfg(not(target_os = "none"))]
fn route_to_ioapic(_irq: u32, _vector: u8, _masked: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler(_cookie: usize) {}

    #[test]
    fn isa_irqs_are_pinned() {
        let table = IrqTable::new();
        assert_eq!(table.vector(0).unwrap(), 32);
        assert_eq!(table.vector(15).unwrap(), 47);
        assert!(table.vector(16).is_err());
    }

    #[test]
    fn ipi_vectors_never_leave_the_pool() {
        let mut table = IrqTable::new();
        let mut seen = Vec::new();
        while let Ok(irq) = table.reserve_irqnum(None) {
            seen.push(table.vector(irq).unwrap());
        }
        for pinned in [IPI_VECTOR_NOOP, IPI_VECTOR_INVLPG, IPI_VECTOR_SCHEDULE, IPI_VECTOR_PANIC] {
            assert!(!seen.contains(&pinned));
        }
        // Exhaustion reports EAGAIN.
        assert_eq!(table.reserve_irqnum(None).err(), Some(Errno::EAGAIN));
    }

    #[test]
    fn hint_is_honored_when_free() {
        let mut table = IrqTable::new();
        let irq = table.reserve_irqnum(Some(100)).unwrap();
        assert_eq!(irq, 100);
        // A taken hint falls back to allocation.
        let other = table.reserve_irqnum(Some(100)).unwrap();
        assert_ne!(other, 100);
    }

    #[test]
    fn handler_registration_and_dispatch() {
        let mut table = IrqTable::new();
        table.register_handler(4, noop_handler, 0xC0).unwrap();
        assert_eq!(table.register_handler(4, noop_handler, 0).err(), Some(Errno::EBUSY));
        assert_eq!(table.register_handler(99, noop_handler, 0).err(), Some(Errno::ENOENT));

        // Disabled IRQs do not dispatch.
        assert!(table.handler_for_vector(36).is_none());
        table.set_enabled(4, true).unwrap();
        let (_, cookie) = table.handler_for_vector(36).expect("dispatchable");
        assert_eq!(cookie, 0xC0);
    }
}
