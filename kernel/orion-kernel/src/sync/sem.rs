//! Counting semaphore.
//!
//! The count lives in an atomic for the uncontended fast path; the slow
//! path blocks on the waitqueue map. `up` prefers handing the token
//! directly to a blocked waiter (the wakeup *is* the token) over
//! incrementing the count, so a sleeping `down` never races fast-path
//! callers for a unit it was promised.
//!
//! A contended `down` publishes itself on the waitqueue *before* its
//! final look at the count: an `up` on another CPU that ran between the
//! failed fast path and the enqueue found no waiter and fell back to
//! incrementing, so the recheck picks that unit up instead of blocking
//! on a count that is already positive.

use core::sync::atomic::{AtomicI64, Ordering};

use crate::sync::waitq::{self, WaitResult};

/// Outcome of the contended path.
enum SlowPath {
    /// A unit was acquired (found on recheck or granted by a wakeup).
    Acquired,
    /// The timeout expired without a grant.
    TimedOut,
    /// Spurious resume; retry from the fast path.
    Retry,
}

/// A counting semaphore.
pub struct Semaphore {
    count: AtomicI64,
    name: &'static str,
}

impl Semaphore {
    /// Creates a semaphore with an initial count.
    #[must_use]
    pub const fn new(name: &'static str, count: i64) -> Self {
        Self { count: AtomicI64::new(count), name }
    }

    /// Returns the current count (diagnostic; racy by nature).
    #[must_use]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    fn ident(&self) -> usize {
        self as *const Self as usize
    }

    /// Attempts to take a unit without blocking.
    pub fn try_down(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Takes a unit, blocking while the count is zero.
    pub fn down(&self) {
        loop {
            if self.try_down() {
                return;
            }
            match self.down_slow(None) {
                SlowPath::Acquired => return,
                SlowPath::TimedOut | SlowPath::Retry => {}
            }
        }
    }

    /// Takes a unit, blocking with a timeout. Returns whether a unit was
    /// acquired.
    pub fn down_timeout(&self, timeout_ns: u64) -> bool {
        loop {
            if self.try_down() {
                return true;
            }
            match self.down_slow(Some(timeout_ns)) {
                SlowPath::Acquired => return true,
                SlowPath::TimedOut => return self.try_down(),
                SlowPath::Retry => {}
            }
        }
    }

    /// The contended path: publish a waiter, close the window against an
    /// `up` that missed the queue, then block.
    fn down_slow(&self, timeout_ns: Option<u64>) -> SlowPath {
        use crate::proc::ThreadState;

        let Some(thread) = crate::sched::current_thread() else {
            // Single-threaded bring-up cannot block; retry the fast path.
            core::hint::spin_loop();
            return SlowPath::Retry;
        };

        let ident = self.ident();
        let queue = waitq::for_ident(ident);
        let cell = queue.enqueue(&thread, self.name, ident);

        // Recheck with the cell published: an `up` that ran before the
        // enqueue incremented the count instead of granting a token, and
        // without this look the unit would be stranded while we block.
        if self.try_down() {
            thread.critical_enter();
            if cell.claim() {
                // Withdrawn before any waker saw the cell.
                thread.clear_wait();
                thread.set_state(ThreadState::Running);
                thread.critical_exit();
            } else {
                thread.critical_exit();
                // A waker granted a token concurrently: hand the spare
                // unit back. When the wake left us queued as ready while
                // still running, the reschedule guard pulls us back off
                // the run queue.
                self.count.fetch_add(1, Ordering::AcqRel);
                if thread.state() == ThreadState::Ready {
                    crate::sched::reschedule(crate::sched::Cause::Block);
                }
                let _ = thread.take_wake_reason();
            }
            waitq::release_ident(ident);
            return SlowPath::Acquired;
        }

        let result = waitq::block_prepared(&thread, &cell, timeout_ns, false);
        waitq::release_ident(ident);
        match result {
            // A Normal wake is a direct grant from `up`.
            WaitResult::Normal => SlowPath::Acquired,
            WaitResult::Timeout => SlowPath::TimedOut,
            WaitResult::Interrupted => SlowPath::Retry,
        }
    }

    /// Releases a unit, waking one blocked waiter in preference to
    /// incrementing the count.
    pub fn up(&self) {
        if !waitq::signal(self.ident()) {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_down_counts() {
        let sem = Semaphore::new("test_sem", 2);
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn up_without_waiters_increments() {
        let sem = Semaphore::new("test_sem", 0);
        sem.up();
        assert_eq!(sem.count(), 1);
        assert!(sem.try_down());
    }

    #[test]
    fn down_consumes_prior_up() {
        let sem = Semaphore::new("test_sem", 0);
        sem.up();
        sem.down();
        assert_eq!(sem.count(), 0);
    }
}
