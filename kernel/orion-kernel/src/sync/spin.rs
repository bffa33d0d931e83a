//! IRQ-saving recursive spin mutex.
//!
//! The spin mutex is the foundation of every other lock: it disables
//! interrupts before acquiring (so a handler on the same CPU cannot
//! deadlock against the holder), supports recursive acquisition by the
//! same CPU, and records the owner for diagnostics. Contended acquires
//! re-enable interrupts while spinning so pending interrupts are not
//! starved, then disable them again before retrying.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Sentinel for "no owner".
const NO_OWNER: u32 = u32::MAX;

/// A spin-based mutual exclusion lock, IRQ-saving and re-entrant.
///
/// Const-constructable for use in `static` items.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    /// CPU that holds the lock, or [`NO_OWNER`].
    owner: AtomicU32,
    /// Recursive acquisition depth (only touched by the owner).
    recursion: AtomicU32,
    /// Name for diagnostics.
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The lock provides exclusive access to `T` via atomics; `T: Send`
// because the data moves between CPUs.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Creates a new unlocked `SpinMutex`.
    pub const fn new(value: T) -> Self {
        Self::named("<unnamed>", value)
    }

    /// Creates a new unlocked `SpinMutex` with a diagnostic name.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(NO_OWNER),
            recursion: AtomicU32::new(0),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Returns the diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Interrupts are disabled while the lock is held. Recursive
    /// acquisition by the owning CPU succeeds immediately.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let saved = irq_save();
        let cpu = crate::percpu::current_cpu().id().as_u32();

        if self.owner.load(Ordering::Relaxed) == cpu {
            // Recursive acquire on the owning CPU.
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return SpinMutexGuard { lock: self, saved, recursive: true, _not_send: core::marker::PhantomData };
        }

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(cpu, Ordering::Relaxed);
                return SpinMutexGuard { lock: self, saved, recursive: false, _not_send: core::marker::PhantomData };
            }
            // Contended: let interrupts in while we spin on a plain read.
            irq_restore(saved);
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            let _ = irq_save();
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Useful in fault and panic paths where blocking would deadlock.
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        let saved = irq_save();
        let cpu = crate::percpu::current_cpu().id().as_u32();

        if self.owner.load(Ordering::Relaxed) == cpu {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return Some(SpinMutexGuard { lock: self, saved, recursive: true, _not_send: core::marker::PhantomData });
        }

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(cpu, Ordering::Relaxed);
            Some(SpinMutexGuard { lock: self, saved, recursive: false, _not_send: core::marker::PhantomData })
        } else {
            irq_restore(saved);
            None
        }
    }

    /// Returns a mutable reference to the data without locking.
    ///
    /// # Safety
    ///
    /// The caller must ensure no concurrent access (e.g. the panic path
    /// after all other CPUs halted).
    pub unsafe fn force_get(&self) -> &mut T {
        // SAFETY: Deferred to the caller.
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard; restores the interrupt state on drop.
///
/// Not `Send`: the guard must stay on the CPU whose interrupt state it
/// saved (enforced by the raw-pointer marker).
pub struct SpinMutexGuard<'a, T> {
    lock: &'a SpinMutex<T>,
    saved: u64,
    recursive: bool,
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive (or owner-recursive) access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive (or owner-recursive) access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.recursive {
            self.lock.recursion.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
            self.lock.locked.store(false, Ordering::Release);
        }
        irq_restore(self.saved);
    }
}

// ---------------------------------------------------------------------------
// Interrupt save/restore
// ---------------------------------------------------------------------------

/// RFLAGS interrupt-enable bit.
const IF_BIT: u64 = 1 << 9;

/// Saves RFLAGS and disables interrupts, returning the saved flags.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub(crate) fn irq_save() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and masking interrupts is safe in ring 0.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

/// Restores the interrupt-enable state saved by [`irq_save`].
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub(crate) fn irq_restore(flags: u64) {
    if flags & IF_BIT != 0 {
        // SAFETY: Re-enabling interrupts restores a previously observed state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub(crate) fn irq_save() -> u64 {
    IF_BIT
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub(crate) fn irq_restore(_flags: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinMutex::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinMutex::new(0);
        *lock.lock() = 99;
        assert_eq!(*lock.lock(), 99);
    }

    #[test]
    fn recursive_acquire_same_cpu() {
        let lock = SpinMutex::named("recursive", 1);
        let outer = lock.lock();
        // Same CPU (host is single-CPU): the nested acquire must succeed.
        let inner = lock.lock();
        assert_eq!(*inner, 1);
        drop(inner);
        drop(outer);
        // Fully released afterwards.
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_recursive() {
        let lock = SpinMutex::new(5);
        let _outer = lock.lock();
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn named_constructor() {
        let lock = SpinMutex::named("test_lock", ());
        assert_eq!(lock.name(), "test_lock");
    }
}
