//! Wait queues and the global ident→waitqueue map.
//!
//! A [`WaitQueue`] holds the threads blocked on one event. The sleepable
//! primitives do not embed queues; they look one up in a process-wide map
//! keyed by an arbitrary pointer-sized ident (typically the address of the
//! lock or condition being waited on). The first waiter to arrive donates a
//! detached queue it carries for this purpose, so lookup never allocates
//! on the wait path.
//!
//! Each blocked thread is represented by a [`WaitCell`] shared between the
//! queue, the thread, and any pending timeout alarm. Wakers race on the
//! cell's `queued` flag: whoever clears it owns the wakeup, so a timeout
//! firing after a normal wake is a no-op.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::proc::Thread;
use crate::sync::SpinMutex;

/// Why a blocked thread resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by the event it was waiting for.
    Normal,
    /// Woken early by an unblocked signal.
    Interrupted,
    /// Woken by a timeout expiring.
    Timeout,
}

/// One blocked thread's entry, shared with wakers and timeout alarms.
pub struct WaitCell {
    /// The blocked thread.
    pub thread: Arc<Thread>,
    /// Why the thread is waiting (diagnostic tag, e.g. a lock name).
    pub tag: &'static str,
    /// Set while the cell sits in a queue; cleared by whoever wakes it.
    queued: AtomicBool,
}

impl WaitCell {
    /// Claims the wakeup. Returns `true` for exactly one caller.
    pub fn claim(&self) -> bool {
        self.queued.swap(false, Ordering::AcqRel)
    }

    /// Whether the cell is still queued.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

/// A queue of threads blocked on one event.
pub struct WaitQueue {
    waiters: SpinMutex<VecDeque<Arc<WaitCell>>>,
}

impl WaitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self { waiters: SpinMutex::named("waitq", VecDeque::new()) }
    }

    /// Whether no live waiter is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().iter().all(|c| !c.is_queued())
    }

    /// Enqueues a thread and marks it blocked. Returns the cell.
    ///
    /// The caller must follow up with a reschedule; this only publishes the
    /// thread on the queue.
    pub fn enqueue(&self, thread: &Arc<Thread>, tag: &'static str, ident: usize) -> Arc<WaitCell> {
        self.enqueue_state(thread, tag, ident, crate::proc::ThreadState::Blocked)
    }

    fn enqueue_state(
        &self,
        thread: &Arc<Thread>,
        tag: &'static str,
        ident: usize,
        state: crate::proc::ThreadState,
    ) -> Arc<WaitCell> {
        let cell = Arc::new(WaitCell {
            thread: thread.clone(),
            tag,
            queued: AtomicBool::new(true),
        });
        {
            let mut waiters = self.waiters.lock();
            waiters.push_back(cell.clone());
        }
        thread.enter_wait(ident, &cell, state);
        cell
    }

    /// Wakes one waiter. Returns whether a thread was woken.
    pub fn wake_one(&self) -> bool {
        loop {
            let cell = {
                let mut waiters = self.waiters.lock();
                match waiters.pop_front() {
                    Some(c) => c,
                    None => return false,
                }
            };
            // Skip cells already claimed by a timeout or signal.
            if cell.claim() {
                crate::sched::make_runnable(&cell.thread, WaitResult::Normal);
                return true;
            }
        }
    }

    /// Wakes every waiter. Returns the number of threads woken.
    pub fn wake_all(&self) -> usize {
        let mut woken = 0;
        while self.wake_one() {
            woken += 1;
        }
        woken
    }

    /// Blocks the current thread on this queue until woken.
    ///
    /// Returns [`WaitResult::Normal`] immediately when no scheduler is
    /// running yet (single-threaded bring-up cannot block).
    pub fn wait(&self, tag: &'static str) -> WaitResult {
        self.wait_inner(tag, None, false)
    }

    /// Blocks with a relative timeout in nanoseconds.
    pub fn wait_timeout(&self, tag: &'static str, timeout_ns: u64) -> WaitResult {
        self.wait_inner(tag, Some(timeout_ns), false)
    }

    /// Blocks until woken or an unblocked signal arrives.
    pub fn wait_sig(&self, tag: &'static str) -> WaitResult {
        self.wait_inner(tag, None, true)
    }

    /// Blocks with a timeout, interruptible by signals.
    pub fn wait_sig_timeout(&self, tag: &'static str, timeout_ns: u64) -> WaitResult {
        self.wait_inner(tag, Some(timeout_ns), true)
    }

    /// Puts the current thread to sleep on this queue (state SLEEPING
    /// rather than BLOCKED; used by `sched::sleep_ns`).
    pub fn sleep_current(
        &self,
        tag: &'static str,
        timeout_ns: Option<u64>,
        interruptible: bool,
    ) -> WaitResult {
        self.wait_with_state(tag, timeout_ns, interruptible, crate::proc::ThreadState::Sleeping)
    }

    fn wait_inner(&self, tag: &'static str, timeout_ns: Option<u64>, interruptible: bool) -> WaitResult {
        self.wait_with_state(tag, timeout_ns, interruptible, crate::proc::ThreadState::Blocked)
    }

    fn wait_with_state(
        &self,
        tag: &'static str,
        timeout_ns: Option<u64>,
        interruptible: bool,
        state: crate::proc::ThreadState,
    ) -> WaitResult {
        let Some(thread) = crate::sched::current_thread() else {
            return WaitResult::Normal;
        };

        // A signal that arrived before we block wins immediately.
        if interruptible && thread.has_pending_signal() {
            return WaitResult::Interrupted;
        }

        let ident = self as *const Self as usize;
        let cell = self.enqueue_state(&thread, tag, ident, state);
        block_prepared(&thread, &cell, timeout_ns, interruptible)
    }
}

/// Parks the current thread on an already-published wait cell.
///
/// Split out of the wait path so callers that must recheck a condition
/// *after* publishing themselves (the semaphore's enqueue-then-recheck)
/// can enqueue first and block separately. Arms the optional timeout,
/// reschedules, and reports why the thread resumed.
pub fn block_prepared(
    thread: &Arc<Thread>,
    cell: &Arc<WaitCell>,
    timeout_ns: Option<u64>,
    interruptible: bool,
) -> WaitResult {
    thread.set_interruptible(interruptible);

    let alarm = timeout_ns.map(|ns| {
        let weak = Arc::downgrade(cell);
        crate::time::alarm::register_relative(ns, alloc::boxed::Box::new(move || {
            if let Some(cell) = weak.upgrade()
                && cell.claim()
            {
                crate::sched::make_runnable(&cell.thread, WaitResult::Timeout);
            }
        }))
    });

    crate::sched::reschedule(crate::sched::Cause::Block);

    if let Some(id) = alarm {
        crate::time::alarm::cancel(id);
    }
    thread.set_interruptible(false);
    thread.take_wake_reason()
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global ident → waitqueue map
// ---------------------------------------------------------------------------

static WAITQ_MAP: SpinMutex<BTreeMap<usize, Arc<WaitQueue>>> =
    SpinMutex::named("WAITQ_MAP", BTreeMap::new());

/// Returns the waitqueue for `ident`, creating one if none exists.
///
/// A new entry is stocked from the current thread's spare queue so the
/// wait path does not allocate; a fresh queue is built only when no
/// thread (early boot) or no spare is available.
pub fn for_ident(ident: usize) -> Arc<WaitQueue> {
    let mut map = WAITQ_MAP.lock();
    if let Some(q) = map.get(&ident) {
        return q.clone();
    }
    let queue = crate::sched::current_thread()
        .and_then(|td| td.take_spare_waitq())
        .unwrap_or_else(|| Arc::new(WaitQueue::new()));
    map.insert(ident, queue.clone());
    queue
}

/// Drops the map entry for `ident` if its queue has drained, restocking
/// the current thread's spare queue.
pub fn release_ident(ident: usize) {
    let mut map = WAITQ_MAP.lock();
    let Some(q) = map.get(&ident) else {
        return;
    };
    if q.is_empty() {
        let q = map.remove(&ident).unwrap();
        drop(map);
        if let Some(td) = crate::sched::current_thread() {
            td.restock_spare_waitq(q);
        }
    }
}

/// Blocks the current thread on the queue registered for `ident`.
pub fn wait_on(ident: usize, tag: &'static str) -> WaitResult {
    let q = for_ident(ident);
    let result = q.wait(tag);
    release_ident(ident);
    result
}

/// Blocks on `ident` with a relative timeout.
pub fn wait_on_timeout(ident: usize, tag: &'static str, timeout_ns: u64) -> WaitResult {
    let q = for_ident(ident);
    let result = q.wait_timeout(tag, timeout_ns);
    release_ident(ident);
    result
}

/// Blocks on `ident`, interruptible by signals.
pub fn wait_on_sig(ident: usize, tag: &'static str) -> WaitResult {
    let q = for_ident(ident);
    let result = q.wait_sig(tag);
    release_ident(ident);
    result
}

/// Wakes one thread blocked on `ident`. Returns whether one was woken.
pub fn signal(ident: usize) -> bool {
    let q = {
        let map = WAITQ_MAP.lock();
        match map.get(&ident) {
            Some(q) => q.clone(),
            None => return false,
        }
    };
    q.wake_one()
}

/// Wakes every thread blocked on `ident`. Returns the number woken.
pub fn broadcast(ident: usize) -> usize {
    let q = {
        let map = WAITQ_MAP.lock();
        match map.get(&ident) {
            Some(q) => q.clone(),
            None => return 0,
        }
    };
    q.wake_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Thread;

    #[test]
    fn enqueue_and_wake_one() {
        let q = WaitQueue::new();
        let td = Thread::new_for_test(1);
        assert!(q.is_empty());

        q.enqueue(&td, "test", 0x1000);
        assert!(!q.is_empty());
        assert!(q.wake_one());
        assert!(q.is_empty());
        assert!(!q.wake_one());
    }

    #[test]
    fn claimed_cells_are_skipped() {
        let q = WaitQueue::new();
        let a = Thread::new_for_test(1);
        let b = Thread::new_for_test(2);

        let cell_a = q.enqueue(&a, "test", 0x1000);
        q.enqueue(&b, "test", 0x1000);

        // A timeout claims thread A's cell first.
        assert!(cell_a.claim());
        // wake_one must skip the dead cell and wake B.
        assert!(q.wake_one());
        assert_eq!(b.state(), crate::proc::ThreadState::Ready);
        assert!(q.is_empty());
    }

    #[test]
    fn wake_all_counts_live_waiters() {
        let q = WaitQueue::new();
        for tid in 1..=3 {
            q.enqueue(&Thread::new_for_test(tid), "test", 0x2000);
        }
        assert_eq!(q.wake_all(), 3);
    }

    #[test]
    fn ident_map_round_trip() {
        let ident = 0xDEAD_0000;
        let q1 = for_ident(ident);
        let q2 = for_ident(ident);
        assert!(Arc::ptr_eq(&q1, &q2));

        // Queue is empty, so releasing drops the map entry.
        release_ident(ident);
        let q3 = for_ident(ident);
        assert!(!Arc::ptr_eq(&q1, &q3));
        release_ident(ident);
    }

    #[test]
    fn signal_without_waiters_is_noop() {
        assert!(!signal(0xBEEF_0000));
        assert_eq!(broadcast(0xBEEF_0000), 0);
    }
}
