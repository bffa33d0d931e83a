//! Sleepable mutual exclusion lock.
//!
//! Contended acquires block on the waitqueue registered for the mutex's
//! address in the global ident map; unlock wakes one waiter. Recursive
//! acquisition by the owning thread is supported. Must not be taken while
//! holding a spin mutex or from interrupt context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::sync::waitq;

/// Sentinel for "no owner".
const NO_OWNER: u32 = u32::MAX;

/// A sleepable mutual exclusion lock.
///
/// Const-constructable for use in `static` items.
pub struct Mutex<T> {
    locked: AtomicBool,
    /// Thread that holds the lock, or [`NO_OWNER`].
    owner: AtomicU32,
    /// Recursive acquisition depth (only touched by the owner).
    recursion: AtomicU32,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The lock provides exclusive access to `T` via atomics.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex`.
    pub const fn new(value: T) -> Self {
        Self::named("<unnamed>", value)
    }

    /// Creates a new unlocked `Mutex` with a diagnostic name.
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

    fn current_tid() -> u32 {
        crate::sched::current_thread().map_or(NO_OWNER - 1, |td| td.tid())
    }

    /// Acquires the lock, blocking while it is held by another thread.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let tid = Self::current_tid();
        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(tid, Ordering::Relaxed);
                return MutexGuard { mutex: self, recursive: false };
            }
            if self.owner.load(Ordering::Relaxed) == tid {
                self.recursion.fetch_add(1, Ordering::Relaxed);
                return MutexGuard { mutex: self, recursive: true };
            }
            let _ = waitq::wait_on(self as *const Self as usize, self.name);
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let tid = Self::current_tid();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(tid, Ordering::Relaxed);
            return Some(MutexGuard { mutex: self, recursive: false });
        }
        if self.owner.load(Ordering::Relaxed) == tid {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return Some(MutexGuard { mutex: self, recursive: true });
        }
        None
    }
}

/// RAII guard for a [`Mutex`].
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    recursive: bool,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Returns the underlying mutex; used by
    /// [`Condvar::wait`](crate::sync::Condvar::wait) to re-acquire after
    /// the atomic release.
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive (or owner-recursive) access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive (or owner-recursive) access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.recursive {
            self.mutex.recursion.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.mutex.owner.store(NO_OWNER, Ordering::Relaxed);
            self.mutex.locked.store(false, Ordering::Release);
            waitq::signal(self.mutex as *const Mutex<T> as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let mutex = Mutex::new(42);
        {
            let guard = mutex.lock();
            assert_eq!(*guard, 42);
        }
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn guard_mutate_and_release() {
        let mutex = Mutex::new(0);
        *mutex.lock() = 99;
        assert_eq!(*mutex.lock(), 99);
    }

    #[test]
    fn recursive_acquire() {
        let mutex = Mutex::named("recursive", 7);
        let outer = mutex.lock();
        let inner = mutex.lock();
        assert_eq!(*inner, 7);
        drop(inner);
        drop(outer);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn try_lock_recursive_succeeds() {
        let mutex = Mutex::new(());
        let _outer = mutex.lock();
        assert!(mutex.try_lock().is_some());
    }
}
