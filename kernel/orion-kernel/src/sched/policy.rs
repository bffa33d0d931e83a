//! Scheduling policies.
//!
//! Each per-CPU scheduler carries one instance of every policy, asked for
//! a successor in fixed order: DRIVER first (strictly higher absolute
//! priority, used by driver worker threads), then SYSTEM (the general
//! priority-FIFO for kernel and user threads).

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use crate::proc::Thread;

/// Policy identifiers, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PolicyKind {
    /// Driver worker threads; beats SYSTEM at any priority.
    Driver,
    /// The default policy for kernel and user threads.
    System,
}

/// A scheduling policy: owns the ready threads assigned to it on one CPU.
pub trait Policy: Send {
    /// The policy's identifier.
    fn kind(&self) -> PolicyKind;
    /// Enqueues a ready thread.
    fn add_thread(&mut self, thread: Arc<Thread>);
    /// Removes a specific thread; returns whether it was queued.
    fn remove_thread(&mut self, thread: &Arc<Thread>) -> bool;
    /// Dequeues the next thread to run.
    fn get_next_thread(&mut self) -> Option<Arc<Thread>>;
    /// Number of queued threads.
    fn ready_count(&self) -> usize;
    /// The timeslice granted to threads of this policy.
    fn timeslice_ns(&self) -> u64;
}

/// Priority-FIFO: one queue per priority, highest priority first, round
/// robin within a priority.
pub struct PriorityFifo {
    kind: PolicyKind,
    queues: BTreeMap<u8, VecDeque<Arc<Thread>>>,
    count: usize,
    timeslice_ns: u64,
}

impl PriorityFifo {
    /// Creates an empty priority-FIFO policy.
    #[must_use]
    pub fn new(kind: PolicyKind, timeslice_ns: u64) -> Self {
        Self { kind, queues: BTreeMap::new(), count: 0, timeslice_ns }
    }
}

impl Policy for PriorityFifo {
    fn kind(&self) -> PolicyKind {
        self.kind
    }

    fn add_thread(&mut self, thread: Arc<Thread>) {
        self.queues.entry(thread.priority()).or_default().push_back(thread);
        self.count += 1;
    }

    fn remove_thread(&mut self, thread: &Arc<Thread>) -> bool {
        let Some(queue) = self.queues.get_mut(&thread.priority()) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) else {
            return false;
        };
        queue.remove(pos);
        self.count -= 1;
        true
    }

    fn get_next_thread(&mut self) -> Option<Arc<Thread>> {
        // Highest priority first.
        let (&prio, _) = self.queues.iter().rev().find(|(_, q)| !q.is_empty())?;
        let queue = self.queues.get_mut(&prio).expect("queue exists");
        let thread = queue.pop_front()?;
        self.count -= 1;
        Some(thread)
    }

    fn ready_count(&self) -> usize {
        self.count
    }

    fn timeslice_ns(&self) -> u64 {
        self.timeslice_ns
    }
}

/// Builds the standard policy set for one CPU.
#[must_use]
pub fn default_policies() -> alloc::vec::Vec<Box<dyn Policy>> {
    alloc::vec![
        Box::new(PriorityFifo::new(PolicyKind::Driver, crate::config::SCHED_TIMESLICE_NS))
            as Box<dyn Policy>,
        Box::new(PriorityFifo::new(PolicyKind::System, crate::config::SCHED_TIMESLICE_NS)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_priority() {
        let mut policy = PriorityFifo::new(PolicyKind::System, 10);
        let a = Thread::new_for_test(1);
        let b = Thread::new_for_test(2);
        policy.add_thread(a.clone());
        policy.add_thread(b.clone());

        assert_eq!(policy.ready_count(), 2);
        assert!(Arc::ptr_eq(&policy.get_next_thread().unwrap(), &a));
        assert!(Arc::ptr_eq(&policy.get_next_thread().unwrap(), &b));
        assert!(policy.get_next_thread().is_none());
    }

    #[test]
    fn higher_priority_first() {
        let mut policy = PriorityFifo::new(PolicyKind::System, 10);
        let low = Thread::new_for_test(1);
        low.set_priority(10);
        let high = Thread::new_for_test(2);
        high.set_priority(20);

        policy.add_thread(low.clone());
        policy.add_thread(high.clone());
        assert!(Arc::ptr_eq(&policy.get_next_thread().unwrap(), &high));
        assert!(Arc::ptr_eq(&policy.get_next_thread().unwrap(), &low));
    }

    #[test]
    fn remove_specific_thread() {
        let mut policy = PriorityFifo::new(PolicyKind::System, 10);
        let a = Thread::new_for_test(1);
        let b = Thread::new_for_test(2);
        policy.add_thread(a.clone());
        policy.add_thread(b.clone());

        assert!(policy.remove_thread(&a));
        assert!(!policy.remove_thread(&a));
        assert_eq!(policy.ready_count(), 1);
        assert!(Arc::ptr_eq(&policy.get_next_thread().unwrap(), &b));
    }
}
