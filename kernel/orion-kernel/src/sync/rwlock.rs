//! Sleepable reader/writer lock.
//!
//! Multiple readers or one writer. Contended acquires block on the global
//! waitqueue map: readers wait on the lock's address, writers on the
//! address + 1. Writer release wakes all readers and one writer; the last
//! reader out wakes one writer.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sync::{SpinMutex, waitq};

#[derive(Default)]
struct RwState {
    readers: u32,
    writer: bool,
}

/// A sleepable reader/writer lock.
pub struct RwLock<T> {
    state: SpinMutex<RwState>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: Exclusive/shared access is mediated by `state`; `T: Send + Sync`
// because readers on different CPUs share references.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock`.
    pub const fn new(value: T) -> Self {
        Self::named("<unnamed>", value)
    }

    /// Creates a new unlocked `RwLock` with a diagnostic name.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            state: SpinMutex::named(name, RwState { readers: 0, writer: false }),
            name,
            data: UnsafeCell::new(value),
        }
    }

    fn read_ident(&self) -> usize {
        self as *const Self as usize
    }

    fn write_ident(&self) -> usize {
        self as *const Self as usize + 1
    }

    /// Acquires shared (read) access, blocking while a writer holds the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.writer {
                    state.readers += 1;
                    return RwLockReadGuard { lock: self };
                }
            }
            let _ = waitq::wait_on(self.read_ident(), self.name);
        }
    }

    /// Acquires exclusive (write) access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.writer && state.readers == 0 {
                    state.writer = true;
                    return RwLockWriteGuard { lock: self };
                }
            }
            let _ = waitq::wait_on(self.write_ident(), self.name);
        }
    }

    /// Attempts shared access without blocking.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.writer {
            return None;
        }
        state.readers += 1;
        Some(RwLockReadGuard { lock: self })
    }

    /// Attempts exclusive access without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return None;
        }
        state.writer = true;
        Some(RwLockWriteGuard { lock: self })
    }

    /// Current reader count (diagnostic).
    pub fn reader_count(&self) -> u32 {
        self.state.lock().readers
    }
}

/// RAII guard for shared access.
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: readers > 0 excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.lock.state.lock();
            state.readers -= 1;
            state.readers == 0
        };
        if last {
            waitq::signal(self.lock.write_ident());
        }
    }
}

/// RAII guard for exclusive access.
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The writer flag excludes all other access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The writer flag excludes all other access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.lock().writer = false;
        waitq::broadcast(self.lock.read_ident());
        waitq::signal(self.lock.write_ident());
    }
}
