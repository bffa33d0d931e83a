//! Condition variables.
//!
//! `wait` atomically releases the caller's [`Mutex`], enqueues on the
//! condvar's waitqueue tagged with the condvar's name, blocks, and
//! re-acquires the mutex on wakeup. The waiter count is decremented on
//! every return path, including timeouts and signal interruptions.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sync::waitq::{self, WaitResult};
use crate::sync::{Mutex, MutexGuard};

/// A condition variable.
pub struct Condvar {
    name: &'static str,
    waiters: AtomicU32,
}

impl Condvar {
    /// Creates a new condvar.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name, waiters: AtomicU32::new(0) }
    }

    /// Returns the diagnostic name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the number of threads currently waiting.
    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Releases `guard`, waits for a signal, and re-acquires the mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait_inner(guard, None, false).0
    }

    /// Like [`Condvar::wait`] with a relative timeout in nanoseconds.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout_ns: u64,
    ) -> (MutexGuard<'a, T>, WaitResult) {
        self.wait_inner(guard, Some(timeout_ns), false)
    }

    /// Like [`Condvar::wait`], returning early on an unblocked signal.
    pub fn wait_sig<'a, T>(&self, guard: MutexGuard<'a, T>) -> (MutexGuard<'a, T>, WaitResult) {
        self.wait_inner(guard, None, true)
    }

    fn wait_inner<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout_ns: Option<u64>,
        interruptible: bool,
    ) -> (MutexGuard<'a, T>, WaitResult) {
        let mutex: &'a Mutex<T> = guard.mutex();
        let Some(thread) = crate::sched::current_thread() else {
            // Single-threaded bring-up: nothing can signal us, return.
            return (guard, WaitResult::Normal);
        };

        if interruptible && thread.has_pending_signal() {
            return (guard, WaitResult::Interrupted);
        }

        let ident = self as *const Self as usize;
        let queue = waitq::for_ident(ident);

        // Publish ourselves on the queue BEFORE releasing the mutex so a
        // signaller running between the release and the reschedule sees us.
        let cell = queue.enqueue(&thread, self.name, ident);
        thread.set_interruptible(interruptible);
        self.waiters.fetch_add(1, Ordering::AcqRel);

        let alarm = timeout_ns.map(|ns| {
            let weak = alloc::sync::Arc::downgrade(&cell);
            crate::time::alarm::register_relative(ns, alloc::boxed::Box::new(move || {
                if let Some(cell) = weak.upgrade()
                    && cell.claim()
                {
                    crate::sched::make_runnable(&cell.thread, WaitResult::Timeout);
                }
            }))
        });

        drop(guard);
        crate::sched::reschedule(crate::sched::Cause::Block);

        if let Some(id) = alarm {
            crate::time::alarm::cancel(id);
        }
        thread.set_interruptible(false);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        let result = thread.take_wake_reason();
        waitq::release_ident(ident);

        (mutex.lock(), result)
    }

    /// Wakes one waiting thread.
    pub fn signal(&self) {
        waitq::signal(self as *const Self as usize);
    }

    /// Wakes every waiting thread.
    pub fn broadcast(&self) {
        waitq::broadcast(self as *const Self as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_without_scheduler_returns() {
        let mutex = Mutex::new(0);
        let cv = Condvar::new("test_cv");
        let guard = mutex.lock();
        // No current thread on the host: wait returns with the lock held.
        let guard = cv.wait(guard);
        assert_eq!(*guard, 0);
        assert_eq!(cv.waiter_count(), 0);
    }

    #[test]
    fn signal_without_waiters_is_noop() {
        let cv = Condvar::new("lonely");
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.waiter_count(), 0);
    }
}
