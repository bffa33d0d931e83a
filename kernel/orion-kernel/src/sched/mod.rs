//! The thread scheduler.
//!
//! One [`Scheduler`] per CPU, each with its own policy instances, idle
//! thread, and run-set lock. Threads are the unit of scheduling; the CPU
//! running a thread is the sole mutator of its scheduling state except
//! while it sits on a waitqueue, where the waking CPU may transition it
//! back to ready. [`reschedule`] is the single context-switch entry
//! point, called from timer expiry, blocking, yielding, waking, and
//! termination.
//!
//! Placement scans CPUs by an affinity score combining the thread's CPU
//! mask with a cache-warmth bonus for its previous CPU; threads migrate
//! only at block/wake boundaries. Preemption is flag-based: the
//! end-of-timeslice alarm marks the CPU, and the flag is consumed at the
//! next interrupt return (deferred while the thread holds a critical
//! section).

extern crate alloc;

pub mod policy;

use alloc::sync::Arc;
use alloc::vec::Vec;

use alloc::boxed::Box;
pub use policy::{Policy, PolicyKind, PriorityFifo};

use crate::addr::{PhysAddr, VirtAddr};
use crate::percpu::{CpuId, CpuLocal};
use crate::proc::{Thread, ThreadState};
use crate::sync::SpinMutex;
use crate::sync::waitq::WaitResult;

/// Why [`reschedule`] was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// The running thread's timeslice expired.
    Timer,
    /// The running thread blocked on a waitqueue.
    Block,
    /// The running thread yielded voluntarily.
    Yield,
    /// A thread was woken; re-evaluate the run set.
    Wake,
    /// The running thread terminated.
    Terminate,
}

struct SchedInner {
    online: bool,
    active: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    policies: Vec<Box<dyn Policy>>,
    blocked_count: usize,
}

/// One CPU's scheduler instance.
pub struct Scheduler {
    inner: SpinMutex<SchedInner>,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            inner: SpinMutex::named(
                "sched",
                SchedInner {
                    online: false,
                    active: None,
                    idle: None,
                    policies: Vec::new(),
                    blocked_count: 0,
                },
            ),
        }
    }

    /// Number of ready threads across all policies.
    pub fn ready_count(&self) -> usize {
        self.inner.lock().policies.iter().map(|p| p.ready_count()).sum()
    }

    /// Number of threads blocked from this CPU.
    pub fn blocked_count(&self) -> usize {
        self.inner.lock().blocked_count
    }
}

/// Per-CPU scheduler instances.
static SCHEDULERS: CpuLocal<Scheduler> =
    CpuLocal::new([const { Scheduler::new() }; crate::config::MAX_CPUS]);

/// Per-CPU current thread.
static CURRENT: CpuLocal<SpinMutex<Option<Arc<Thread>>>> =
    CpuLocal::new([const { SpinMutex::named("current", None) }; crate::config::MAX_CPUS]);

/// Returns this CPU's scheduler.
pub fn scheduler() -> &'static Scheduler {
    SCHEDULERS.get()
}

/// Returns the thread running on this CPU, if the scheduler is up.
pub fn current_thread() -> Option<Arc<Thread>> {
    CURRENT.get().lock().clone()
}

/// Installs a current thread directly (host-test fixtures only).
#[cfg(test)]
pub(crate) fn set_current_for_test(td: Option<Arc<Thread>>) -> Option<Arc<Thread>> {
    core::mem::replace(&mut *CURRENT.get().lock(), td)
}

/// Returns the process of the running thread.
pub fn current_process() -> Option<Arc<crate::proc::Process>> {
    current_thread().and_then(|td| td.process())
}

/// Brings this CPU's scheduler online.
///
/// `boot` is the thread representing the currently executing context
/// (it becomes the active thread); `idle` is this CPU's idle thread.
///
/// # Panics
///
/// Panics if the CPU's scheduler is already online.
pub fn init_cpu(boot: Arc<Thread>, idle: Arc<Thread>) {
    let cpu = crate::percpu::current_cpu().id();
    let sched = SCHEDULERS.get();
    {
        let mut inner = sched.inner.lock();
        assert!(!inner.online, "scheduler already online");
        inner.policies = policy::default_policies();
        boot.set_state(ThreadState::Running);
        boot.set_last_cpu(cpu);
        idle.set_last_cpu(cpu);
        inner.active = Some(boot.clone());
        inner.idle = Some(idle);
        inner.online = true;
    }
    *CURRENT.get().lock() = Some(boot);
}

/// Whether this CPU's scheduler is online.
pub fn is_online() -> bool {
    SCHEDULERS.get().inner.lock().online
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Scores CPU `cpu` as a home for a thread. Higher is better; `None`
/// means the affinity mask forbids it.
fn placement_score(
    cpu: u32,
    mask: u64,
    last_cpu: u32,
    last_run_ns: u64,
    now_ns: u64,
    load: usize,
) -> Option<u64> {
    if mask & (1 << cpu) == 0 {
        return None;
    }
    let mut score = 1000u64.saturating_sub(load as u64 * 10);
    if cpu == last_cpu && now_ns.saturating_sub(last_run_ns) < crate::config::SCHED_WARMTH_NS {
        // The thread's working set is likely still in this CPU's caches.
        score += 500;
    }
    Some(score)
}

/// Picks the CPU a ready thread should run on.
fn select_cpu(thread: &Arc<Thread>) -> CpuId {
    let now = crate::time::clock::try_uptime_nanos().unwrap_or(0);
    let mask = thread.affinity();
    let last_cpu = thread.last_cpu().as_u32();
    let last_run = thread.last_run_ns();

    let mut best = (crate::percpu::current_cpu().id(), 0u64);
    for cpu in 0..crate::percpu::cpu_count() {
        let load = SCHEDULERS.get_for(CpuId::new(cpu)).ready_count();
        if let Some(score) = placement_score(cpu, mask, last_cpu, last_run, now, load)
            && score > best.1
        {
            best = (CpuId::new(cpu), score);
        }
    }
    best.0
}

// ---------------------------------------------------------------------------
// Run-set transitions
// ---------------------------------------------------------------------------

fn policy_index(policies: &[Box<dyn Policy>], kind: PolicyKind) -> Option<usize> {
    policies.iter().position(|p| p.kind() == kind)
}

/// Submits a new thread to a run queue (placement by affinity).
pub fn submit(thread: Arc<Thread>) {
    let cpu = select_cpu(&thread);
    enqueue_on(cpu, thread, WaitResult::Normal, false);
}

/// Wakes a blocked or sleeping thread.
pub fn make_runnable(thread: &Arc<Thread>, reason: WaitResult) {
    let was_blocked = matches!(
        thread.state(),
        ThreadState::Blocked | ThreadState::Sleeping
    );
    thread.set_wake_reason(reason);
    thread.clear_wait();
    let cpu = select_cpu(thread);
    enqueue_on(cpu, thread.clone(), reason, was_blocked);
}

fn enqueue_on(cpu: CpuId, thread: Arc<Thread>, _reason: WaitResult, was_blocked: bool) {
    let sched = SCHEDULERS.get_for(cpu);
    let preempt = {
        let mut inner = sched.inner.lock();
        if !inner.online {
            // Pre-scheduler bring-up: the thread just becomes ready.
            thread.set_state(ThreadState::Ready);
            return;
        }
        if was_blocked && inner.blocked_count > 0 {
            inner.blocked_count -= 1;
        }
        thread.set_state(ThreadState::Ready);
        thread.set_last_cpu(cpu);
        let prio = thread.priority();
        let kind = thread.policy();
        let index = policy_index(&inner.policies, kind).expect("policy installed");
        inner.policies[index].add_thread(thread);

        // Preempt the active thread when the newcomer outranks it.
        match &inner.active {
            Some(active) => {
                kind < active.policy() || (kind == active.policy() && prio > active.priority())
            }
            None => false,
        }
    };

    if cpu == crate::percpu::current_cpu().id() {
        if preempt {
            crate::percpu::current_cpu().set_preempt_pending(true);
        }
    } else {
        remote_schedule(cpu);
    }
}

/// The single context-switch entry point.
pub fn reschedule(cause: Cause) {
    let cpu = crate::percpu::current_cpu();
    let sched = SCHEDULERS.get();
    let now = crate::time::clock::try_uptime_nanos().unwrap_or(0);

    let switch = {
        let mut locked = sched.inner.lock();
        let inner = &mut *locked;
        if !inner.online {
            return;
        }
        let active = inner.active.clone();

        // (1) Remove or requeue the active thread as the cause demands.
        if let Some(active) = &active {
            active.account_stop(now);
            match cause {
                Cause::Block => {
                    // Lost wakeup guard: a waker may have made us ready
                    // again between the enqueue and this reschedule. Pull
                    // the thread back off the run queues and keep running.
                    if active.state() == ThreadState::Ready {
                        for p in &mut inner.policies {
                            if p.remove_thread(active) {
                                break;
                            }
                        }
                        active.set_state(ThreadState::Running);
                        active.account_start(now);
                        return;
                    }
                    inner.blocked_count += 1;
                }
                Cause::Terminate => {
                    // The thread leaves the run set immediately; the
                    // reaper frees its resources.
                    active.set_state(ThreadState::Killed);
                }
                Cause::Yield | Cause::Timer | Cause::Wake => {
                    let is_idle = inner
                        .idle
                        .as_ref()
                        .is_some_and(|idle| Arc::ptr_eq(idle, active));
                    if !is_idle && active.state() == ThreadState::Running {
                        active.set_state(ThreadState::Ready);
                        let index = policy_index(&inner.policies, active.policy())
                            .expect("policy installed");
                        inner.policies[index].add_thread(active.clone());
                    }
                }
            }
        }

        // (2) Ask each policy in priority order for a successor.
        let mut next = None;
        for p in &mut inner.policies {
            if let Some(td) = p.get_next_thread() {
                next = Some(td);
                break;
            }
        }
        let next = next.or_else(|| inner.idle.clone());
        let Some(next) = next else {
            return;
        };

        match &active {
            Some(active) if Arc::ptr_eq(active, &next) => {
                // Only candidate is ourselves: keep running.
                next.set_state(ThreadState::Running);
                next.account_start(now);
                return;
            }
            _ => {}
        }

        inner.active = Some(next.clone());
        next.set_state(ThreadState::Running);
        next.set_last_cpu(cpu.id());
        next.account_start(now);
        (active, next)
    };

    let (prev, next) = switch;
    *CURRENT.get().lock() = Some(next.clone());

    // Publish the per-CPU mirrors for the fast paths and entry stubs.
    let percpu = crate::percpu::current_cpu();
    percpu
        .curthread
        .store(Arc::as_ptr(&next) as *mut (), core::sync::atomic::Ordering::Release);
    let space_root = next.process().map(|p| p.space_root());
    if let Some(root) = space_root {
        // A user thread: its address space root goes live on this CPU.
        // SAFETY: The mirror field is only read by this CPU.
        let percpu_mut = percpu as *const crate::percpu::PerCpu as *mut crate::percpu::PerCpu;
        // SAFETY: Single-CPU field write, see above.
        unsafe { (*percpu_mut).curspace = root.as_u64() };
    }

    switch_context(prev.as_ref(), &next, space_root);
}

/// Swaps TCBs and the page-table root.
#[cfg(target_os = "none")]
fn switch_context(prev: Option<&Arc<Thread>>, next: &Arc<Thread>, space_root: Option<PhysAddr>) {
    if let Some(root) = space_root
        && crate::arch::x86_64::control::Cr3::read() != root
    {
        // SAFETY: The kernel half is shared between all address spaces.
        unsafe { crate::arch::x86_64::control::Cr3::write(root) };
    }
    if let Some(prev) = prev {
        // SAFETY: Both TCBs are valid; the switch saves into prev's TCB
        // and restores next's. Returns when prev is rescheduled.
        unsafe {
            crate::arch::x86_64::context::switch(prev.tcb_ptr(), next.tcb_ptr());
        }
    } else {
        // First dispatch on this CPU: jump without saving.
        // SAFETY: next's TCB was initialized by Thread::new_kernel.
        unsafe { crate::arch::x86_64::context::jump(next.tcb_ptr()) };
    }
}

/// Host builds cannot switch stacks; the run-set bookkeeping above is the
/// tested surface.
#[cfg(not(target_os = "none"))]
fn switch_context(_prev: Option<&Arc<Thread>>, _next: &Arc<Thread>, _root: Option<PhysAddr>) {}

/// Voluntarily gives up the CPU.
pub fn yield_now() {
    reschedule(Cause::Yield);
}

/// Sleeps for at least `ns` nanoseconds.
///
/// Returns [`WaitResult::Timeout`] on normal expiry,
/// [`WaitResult::Interrupted`] when an unblocked signal cut the sleep
/// short, and [`WaitResult::Normal`] on an explicit wakeup.
pub fn sleep_ns(ns: u64) -> WaitResult {
    let Some(td) = current_thread() else {
        return WaitResult::Timeout;
    };
    td.sleep_queue().sleep_current("sleep", Some(ns), true)
}

/// Consumes a pending preemption at an interrupt-return boundary.
///
/// Deferred while the thread is in a critical section; the flag stays
/// consumed (the next tick re-arms it).
pub fn preempt_check() {
    if !crate::percpu::current_cpu().take_preempt_pending() {
        return;
    }
    if let Some(td) = current_thread()
        && td.in_critical_section()
    {
        return;
    }
    reschedule(Cause::Timer);
}

/// Starts the end-of-timeslice tick on this CPU (self-rearming alarm).
pub fn start_tick() {
    fn arm() {
        crate::time::alarm::register_relative(
            crate::config::SCHED_TIMESLICE_NS,
            Box::new(|| {
                crate::percpu::current_cpu().set_preempt_pending(true);
                arm();
            }),
        );
    }
    arm();
}

// ---------------------------------------------------------------------------
// Cross-CPU notifications
// ---------------------------------------------------------------------------

/// Nudges a remote CPU to run its scheduler.
#[cfg(target_os = "none")]
fn remote_schedule(cpu: CpuId) {
    crate::ipi::send_schedule(cpu);
}

#[cfg(not(target_os = "none"))]
fn remote_schedule(_cpu: CpuId) {}

/// Invalidates `[va, va+len)` of the address space rooted at `root` on
/// every CPU that has it loaded.
#[cfg(target_os = "none")]
pub fn tlb_shootdown(root: PhysAddr, va: VirtAddr, len: u64) {
    crate::ipi::send_invlpg(root, va, len);
}

/// Host stub: no remote TLBs exist.
#[cfg(not(target_os = "none"))]
pub fn tlb_shootdown(_root: PhysAddr, _va: VirtAddr, _len: u64) {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serializes tests that observe or mutate the global run set.
    pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Brings the host CPU's scheduler online exactly once.
    pub(crate) fn init_test_sched() -> (Arc<Thread>, Arc<Thread>) {
        use std::sync::OnceLock;
        static BOOT: OnceLock<(Arc<Thread>, Arc<Thread>)> = OnceLock::new();
        BOOT.get_or_init(|| {
            let boot = Thread::new_for_test(1000);
            let idle = Thread::new_for_test(1001);
            idle.set_priority(0);
            init_cpu(boot.clone(), idle.clone());
            (boot, idle)
        })
        .clone()
    }

    #[test]
    fn placement_respects_affinity_mask() {
        assert!(placement_score(2, 0b100, 0, 0, 0, 0).is_some());
        assert!(placement_score(1, 0b100, 0, 0, 0, 0).is_none());
    }

    #[test]
    fn placement_warmth_bonus() {
        let now = 10_000_000;
        let warm = placement_score(1, u64::MAX, 1, now - 1_000_000, now, 0).unwrap();
        let cold = placement_score(2, u64::MAX, 1, now - 1_000_000, now, 0).unwrap();
        assert!(warm > cold);

        // The bonus decays past the warmth window.
        let stale =
            placement_score(1, u64::MAX, 1, 0, crate::config::SCHED_WARMTH_NS + 1, 0).unwrap();
        assert_eq!(stale, cold);
    }

    #[test]
    fn placement_prefers_lower_load() {
        let light = placement_score(1, u64::MAX, 9, 0, 0, 1).unwrap();
        let heavy = placement_score(2, u64::MAX, 9, 0, 0, 20).unwrap();
        assert!(light > heavy);
    }

    #[test]
    fn submit_and_reschedule_picks_highest_priority() {
        let _serial = test_lock();
        let (boot, _) = init_test_sched();

        let low = Thread::new_for_test(1);
        low.set_priority(5);
        let high = Thread::new_for_test(2);
        high.set_priority(20);
        submit(low.clone());
        submit(high.clone());

        reschedule(Cause::Yield);
        // The high-priority thread is now active; boot was requeued.
        let current = current_thread().unwrap();
        assert!(Arc::ptr_eq(&current, &high));
        assert_eq!(high.state(), ThreadState::Running);
        assert_eq!(boot.state(), ThreadState::Ready);

        // Retire the test threads: terminating the active picks the next
        // best (boot at priority 10 beats low at 5).
        reschedule(Cause::Terminate);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &boot));
        assert_eq!(high.state(), ThreadState::Killed);

        let mut inner = scheduler().inner.lock();
        for p in &mut inner.policies {
            p.remove_thread(&low);
        }
    }

    #[test]
    fn driver_policy_outranks_system() {
        let _serial = test_lock();
        let (boot, _) = init_test_sched();

        let worker = Thread::new_for_test(3);
        worker.set_policy(PolicyKind::Driver);
        worker.set_priority(1);
        let user = Thread::new_for_test(4);
        user.set_priority(200);
        submit(user.clone());
        submit(worker.clone());

        reschedule(Cause::Yield);
        // DRIVER beats SYSTEM regardless of priority numbers.
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &worker));

        // Retire: worker dies, then the priority-200 user thread runs,
        // then boot again.
        reschedule(Cause::Terminate);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &user));
        reschedule(Cause::Terminate);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &boot));
    }

    #[test]
    fn block_then_wake_roundtrip() {
        let _serial = test_lock();
        let (boot, _) = init_test_sched();

        let td = Thread::new_for_test(5);
        td.set_priority(30);
        submit(td.clone());
        reschedule(Cause::Yield);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &td));

        // The thread blocks: boot takes over and the blocked count rises.
        let q = crate::sync::WaitQueue::new();
        q.enqueue(&td, "test", 0x9000);
        assert_eq!(td.state(), ThreadState::Blocked);
        reschedule(Cause::Block);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &boot));
        assert_eq!(scheduler().blocked_count(), 1);

        // Waking it makes it ready and it wins the next dispatch.
        assert!(q.wake_one());
        assert_eq!(td.state(), ThreadState::Ready);
        assert_eq!(scheduler().blocked_count(), 0);
        reschedule(Cause::Yield);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &td));

        reschedule(Cause::Terminate);
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &boot));
    }
}
