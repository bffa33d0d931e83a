//! Processes, threads, and the job-control hierarchy.
//!
//! Sessions own pgroups (and at most one controlling TTY), pgroups own
//! processes, processes own threads. A process bundles the user address
//! space, file table, credentials, working directory, signal state, and
//! accounting; a thread is the schedulable unit with its own TCB, kernel
//! stack, priority, affinity, and signal mask.
//!
//! Lifecycle: `fork` creates a process whose threads become runnable via
//! `sched::submit`; `exit` turns it into a zombie until the parent reaps
//! it with `waitpid`; terminated threads leave the run set immediately
//! and are freed by the reaper thread.

pub mod exec;
pub mod signal;

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use orion_syscall::Errno;
use orion_syscall::signal::{SIGCHLD, SigInfo};

use crate::addr::PhysAddr;
use crate::mm::vmm::{AddressSpace, VmError};
use crate::percpu::CpuId;
use crate::sched::PolicyKind;
use crate::sync::waitq::{WaitCell, WaitResult};
use crate::sync::{Condvar, Mutex, SpinMutex, WaitQueue};

// ── Identities ──────────────────────────────────────────────────────

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Default scheduling priority for new threads.
pub const DEFAULT_PRIORITY: u8 = 10;

// ── Thread ──────────────────────────────────────────────────────────

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Queued on a run queue.
    Ready,
    /// Executing on a CPU.
    Running,
    /// On a waitqueue.
    Blocked,
    /// On a waitqueue with a sleep deadline.
    Sleeping,
    /// Terminated; awaiting the reaper.
    Killed,
}

/// Per-thread statistics.
#[derive(Debug, Default)]
pub struct ThreadStats {
    /// Total on-CPU time.
    pub runtime_ns: AtomicU64,
    /// Number of dispatches.
    pub switches: AtomicU64,
}

/// A kernel-schedulable thread.
pub struct Thread {
    tid: u32,
    name: SpinMutex<String>,
    process: SpinMutex<Option<Weak<Process>>>,
    state: SpinMutex<ThreadState>,
    policy: AtomicU8,
    priority: AtomicU8,
    /// CPU affinity bit mask (bit n = CPU n allowed).
    affinity: AtomicU64,
    last_cpu: AtomicU32,
    last_run_ns: AtomicU64,
    run_start_ns: AtomicU64,
    critical_level: AtomicU32,
    /// Blocked signals (bit n-1 = signal n).
    sigmask: AtomicU64,
    interruptible: AtomicBool,
    wake_reason: SpinMutex<WaitResult>,
    wait_cell: SpinMutex<Option<Arc<WaitCell>>>,
    wait_ident: AtomicUsize,
    spare_waitq: SpinMutex<Option<Arc<WaitQueue>>>,
    sleep_q: WaitQueue,
    /// Signal-delivery state machine.
    pub(crate) sig_delivery: signal::DeliverySlot,
    stats: ThreadStats,
    /// Kernel stack base (pool allocation) and size; `None` for the boot
    /// and idle contexts whose stacks predate the pool.
    kstack: Option<(usize, usize)>,
    #[cfg(target_os = "none")]
    tcb: crate::arch::x86_64::context::TcbCell,
}

impl Thread {
    fn new_raw(name: String, process: Option<Weak<Process>>) -> Self {
        Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: SpinMutex::new(name),
            process: SpinMutex::new(process),
            state: SpinMutex::new(ThreadState::Ready),
            policy: AtomicU8::new(PolicyKind::System as u8),
            priority: AtomicU8::new(DEFAULT_PRIORITY),
            affinity: AtomicU64::new(u64::MAX),
            last_cpu: AtomicU32::new(0),
            last_run_ns: AtomicU64::new(0),
            run_start_ns: AtomicU64::new(0),
            critical_level: AtomicU32::new(0),
            sigmask: AtomicU64::new(0),
            interruptible: AtomicBool::new(false),
            wake_reason: SpinMutex::new(WaitResult::Normal),
            wait_cell: SpinMutex::new(None),
            wait_ident: AtomicUsize::new(0),
            spare_waitq: SpinMutex::new(Some(Arc::new(WaitQueue::new()))),
            sleep_q: WaitQueue::new(),
            sig_delivery: signal::DeliverySlot::new(),
            stats: ThreadStats::default(),
            kstack: None,
            #[cfg(target_os = "none")]
            tcb: crate::arch::x86_64::context::TcbCell::new(),
        }
    }

    /// Creates a kernel thread that starts at `entry(arg)`.
    ///
    /// The stack comes from the kernel-stack pool; the TCB is set up so
    /// the first dispatch lands in the entry trampoline.
    #[cfg(target_os = "none")]
    pub fn new_kernel(name: &str, entry: fn(usize), arg: usize) -> Result<Arc<Self>, Errno> {
        let stack_size = crate::config::KERNEL_STACK_SIZE as usize;
        let stack = crate::boot::kernel_stack_pool().alloc(stack_size);
        if stack.is_null() {
            return Err(Errno::ENOMEM);
        }
        let mut thread = Self::new_raw(String::from(name), None);
        thread.kstack = Some((stack as usize, stack_size));
        let stack_top = stack as usize + stack_size;
        thread.tcb.init_kernel(stack_top, entry, arg);
        Ok(Arc::new(thread))
    }

    /// Wraps the currently executing context (boot or AP bring-up).
    #[cfg(target_os = "none")]
    pub fn adopt_current(name: &str) -> Arc<Self> {
        Arc::new(Self::new_raw(String::from(name), None))
    }

    /// Builds a bare thread for host tests with a fixed tid.
    #[cfg(not(target_os = "none"))]
    #[must_use]
    pub fn new_for_test(tid: u32) -> Arc<Self> {
        let mut td = Self::new_raw(String::from("test"), None);
        td.tid = tid;
        Arc::new(td)
    }

    /// Creates a user thread belonging to `process`.
    fn new_user(name: String, process: &Arc<Process>) -> Arc<Self> {
        Arc::new(Self::new_raw(name, Some(Arc::downgrade(process))))
    }

    /// The thread id.
    #[must_use]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// The thread name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// The owning process, if this is a user thread.
    #[must_use]
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Current scheduling state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    /// Sets the scheduling state.
    pub fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    /// The scheduling policy.
    #[must_use]
    pub fn policy(&self) -> PolicyKind {
        if self.policy.load(Ordering::Relaxed) == PolicyKind::Driver as u8 {
            PolicyKind::Driver
        } else {
            PolicyKind::System
        }
    }

    /// Assigns the scheduling policy.
    pub fn set_policy(&self, policy: PolicyKind) {
        self.policy.store(policy as u8, Ordering::Relaxed);
    }

    /// The scheduling priority (higher runs first).
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Sets the scheduling priority.
    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// The CPU affinity mask.
    #[must_use]
    pub fn affinity(&self) -> u64 {
        self.affinity.load(Ordering::Relaxed)
    }

    /// Sets the CPU affinity mask.
    pub fn set_affinity(&self, mask: u64) {
        self.affinity.store(mask.max(1), Ordering::Relaxed);
    }

    /// The CPU this thread last ran on.
    #[must_use]
    pub fn last_cpu(&self) -> CpuId {
        CpuId::new(self.last_cpu.load(Ordering::Relaxed))
    }

    /// Records the thread's home CPU.
    pub fn set_last_cpu(&self, cpu: CpuId) {
        self.last_cpu.store(cpu.as_u32(), Ordering::Relaxed);
    }

    /// When the thread last stopped running.
    #[must_use]
    pub fn last_run_ns(&self) -> u64 {
        self.last_run_ns.load(Ordering::Relaxed)
    }

    /// Accounting: the thread was dispatched at `now`.
    pub fn account_start(&self, now: u64) {
        self.run_start_ns.store(now, Ordering::Relaxed);
        self.stats.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounting: the thread stopped running at `now`.
    pub fn account_stop(&self, now: u64) {
        let started = self.run_start_ns.load(Ordering::Relaxed);
        if started != 0 && now > started {
            self.stats.runtime_ns.fetch_add(now - started, Ordering::Relaxed);
        }
        self.last_run_ns.store(now, Ordering::Relaxed);
    }

    /// Total on-CPU time.
    #[must_use]
    pub fn runtime_ns(&self) -> u64 {
        self.stats.runtime_ns.load(Ordering::Relaxed)
    }

    /// Enters a critical section deferring preemption.
    pub fn critical_enter(&self) {
        self.critical_level.fetch_add(1, Ordering::AcqRel);
    }

    /// Leaves a critical section.
    pub fn critical_exit(&self) {
        let prev = self.critical_level.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "critical level underflow");
    }

    /// Whether preemption is currently deferred.
    #[must_use]
    pub fn in_critical_section(&self) -> bool {
        self.critical_level.load(Ordering::Acquire) > 0
    }

    /// The per-thread signal mask.
    #[must_use]
    pub fn sigmask(&self) -> u64 {
        self.sigmask.load(Ordering::Acquire)
    }

    /// Replaces the signal mask, returning the old one.
    pub fn set_sigmask(&self, mask: u64) -> u64 {
        self.sigmask.swap(mask & !orion_syscall::signal::UNBLOCKABLE, Ordering::AcqRel)
    }

    /// Whether a deliverable (unmasked) signal is pending.
    #[must_use]
    pub fn has_pending_signal(&self) -> bool {
        if self.sig_delivery.is_pending() {
            return true;
        }
        match self.process() {
            Some(proc) => proc.signals.has_deliverable(self.sigmask()),
            None => false,
        }
    }

    /// Publishes this thread as waiting on `ident`.
    pub fn enter_wait(&self, ident: usize, cell: &Arc<WaitCell>, state: ThreadState) {
        debug_assert!(matches!(state, ThreadState::Blocked | ThreadState::Sleeping));
        *self.wait_cell.lock() = Some(cell.clone());
        self.wait_ident.store(ident, Ordering::Release);
        self.set_state(state);
    }

    /// Clears the wait bookkeeping (called by the waker).
    pub fn clear_wait(&self) {
        *self.wait_cell.lock() = None;
        self.wait_ident.store(0, Ordering::Release);
    }

    /// The ident this thread is blocked on (0 when runnable).
    #[must_use]
    pub fn wait_ident(&self) -> usize {
        self.wait_ident.load(Ordering::Acquire)
    }

    /// Takes the thread's current wait cell, if any (signal delivery).
    #[must_use]
    pub fn take_wait_cell(&self) -> Option<Arc<WaitCell>> {
        self.wait_cell.lock().take()
    }

    /// Marks whether the current wait can be cut short by signals.
    pub fn set_interruptible(&self, interruptible: bool) {
        self.interruptible.store(interruptible, Ordering::Release);
    }

    /// Whether the current wait is signal-interruptible.
    #[must_use]
    pub fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    /// Stores the reason the thread is being woken.
    pub fn set_wake_reason(&self, reason: WaitResult) {
        *self.wake_reason.lock() = reason;
    }

    /// Consumes the wake reason (resets to `Normal`).
    #[must_use]
    pub fn take_wake_reason(&self) -> WaitResult {
        core::mem::replace(&mut *self.wake_reason.lock(), WaitResult::Normal)
    }

    /// Takes the thread's donated waitqueue for the ident map.
    #[must_use]
    pub fn take_spare_waitq(&self) -> Option<Arc<WaitQueue>> {
        self.spare_waitq.lock().take()
    }

    /// Restocks the donated waitqueue.
    pub fn restock_spare_waitq(&self, queue: Arc<WaitQueue>) {
        let mut spare = self.spare_waitq.lock();
        if spare.is_none() {
            *spare = Some(queue);
        }
    }

    /// The queue `sched::sleep_ns` parks this thread on.
    #[must_use]
    pub fn sleep_queue(&self) -> &WaitQueue {
        &self.sleep_q
    }

    /// Raw TCB pointer for the context-switch primitive.
    #[cfg(target_os = "none")]
    pub(crate) fn tcb_ptr(&self) -> *mut crate::arch::x86_64::context::Tcb {
        self.tcb.get()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some((base, size)) = self.kstack {
            #[cfg(target_os = "none")]
            // SAFETY: The stack came from the kernel-stack pool and the
            // thread can no longer run on it.
            unsafe {
                crate::boot::kernel_stack_pool().free(base as *mut u8, size);
            }
            #[cfg(not(target_os = "none"))]
            let _ = (base, size);
        }
    }
}

// ── Credentials ─────────────────────────────────────────────────────

/// Process credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Creds {
    /// Real user id.
    pub uid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Effective group id.
    pub egid: u32,
}

// ── Session / Pgroup ────────────────────────────────────────────────

/// A login session: owns pgroups and at most one controlling TTY.
pub struct Session {
    /// Session id (pid of the leader).
    pub sid: u32,
    /// The controlling terminal.
    pub tty: SpinMutex<Option<Arc<crate::tty::Tty>>>,
    pgroups: SpinMutex<Vec<Weak<Pgroup>>>,
}

impl Session {
    fn new(sid: u32) -> Arc<Self> {
        Arc::new(Self { sid, tty: SpinMutex::new(None), pgroups: SpinMutex::new(Vec::new()) })
    }

    /// Adds a pgroup to the session.
    pub fn adopt_pgroup(self: &Arc<Self>, pgroup: &Arc<Pgroup>) {
        self.pgroups.lock().push(Arc::downgrade(pgroup));
    }
}

/// A process group.
pub struct Pgroup {
    /// Pgroup id (pid of the leader).
    pub pgid: u32,
    /// Owning session.
    pub session: Weak<Session>,
    procs: SpinMutex<Vec<Weak<Process>>>,
}

impl Pgroup {
    fn new(pgid: u32, session: &Arc<Session>) -> Arc<Self> {
        let pg = Arc::new(Self {
            pgid,
            session: Arc::downgrade(session),
            procs: SpinMutex::new(Vec::new()),
        });
        session.adopt_pgroup(&pg);
        pg
    }

    /// Adds a process to the group.
    pub fn adopt(self: &Arc<Self>, proc: &Arc<Process>) {
        self.procs.lock().push(Arc::downgrade(proc));
        *proc.pgroup.lock() = Arc::downgrade(self);
    }

    /// Returns the live member processes.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<Process>> {
        self.procs.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Sends a signal to every member (tty job control).
    pub fn signal_all(&self, signo: i32) {
        for proc in self.members() {
            signal::send(&proc, SigInfo {
                si_signo: signo,
                si_code: orion_syscall::signal::SI_KERNEL,
                ..Default::default()
            });
        }
    }
}

// ── Process ─────────────────────────────────────────────────────────

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Running (has live threads).
    Active,
    /// Exited but not yet reaped.
    Zombie,
    /// Reaped; the table entry is gone.
    Exited,
}

bitflags! {
    /// `fork` behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ForkFlags: u32 {
        /// Duplicate the file table.
        const COPY_FDS = 1 << 0;
        /// Share one file table with the parent.
        const SHARE_FDS = 1 << 1;
        /// Duplicate the signal action table.
        const COPY_SIGACTS = 1 << 2;
    }
}

/// CPU-time accounting for a process.
#[derive(Debug, Default)]
pub struct Usage {
    /// Time spent in user mode.
    pub user_ns: AtomicU64,
    /// Time spent in the kernel.
    pub sys_ns: AtomicU64,
}

/// A user process.
pub struct Process {
    /// Process id.
    pub pid: u32,
    parent: SpinMutex<Option<Weak<Process>>>,
    pgroup: SpinMutex<Weak<Pgroup>>,
    state: SpinMutex<ProcState>,
    exit_status: SpinMutex<Option<i32>>,
    creds: SpinMutex<Creds>,
    space: SpinMutex<Option<Arc<AddressSpace>>>,
    /// The open-file table (shared across `SHARE_FDS` forks).
    pub ftable: Arc<crate::fs::Ftable>,
    /// Working directory.
    pub cwd: SpinMutex<Option<Arc<crate::fs::Ventry>>>,
    threads: SpinMutex<Vec<Arc<Thread>>>,
    /// Signal state: pending queue and action table.
    pub signals: signal::SignalState,
    /// Program break for `brk`-style heap growth.
    pub brk: AtomicU64,
    /// CPU accounting.
    pub usage: Usage,
    /// Guarded by `child_lock`; signalled when a child exits.
    child_cond: Condvar,
    child_lock: Mutex<()>,
    /// Knotes watching this process (`EVFILT_PROC`).
    pub knotes: crate::ipc::kqueue::KnList,
}

impl Process {
    fn new_raw(ftable: Arc<crate::fs::Ftable>) -> Self {
        Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            parent: SpinMutex::new(None),
            pgroup: SpinMutex::new(Weak::new()),
            state: SpinMutex::new(ProcState::Active),
            exit_status: SpinMutex::new(None),
            creds: SpinMutex::new(Creds::default()),
            space: SpinMutex::new(None),
            ftable,
            cwd: SpinMutex::new(None),
            threads: SpinMutex::new(Vec::new()),
            signals: signal::SignalState::new(),
            brk: AtomicU64::new(0),
            usage: Usage::default(),
            child_cond: Condvar::new("waitpid"),
            child_lock: Mutex::named("child_lock", ()),
            knotes: crate::ipc::kqueue::KnList::new(),
        }
    }

    /// Creates the root process (init's parent-less shell) with a fresh
    /// session and pgroup.
    pub fn new_root() -> Arc<Self> {
        let proc = Arc::new(Self::new_raw(Arc::new(crate::fs::Ftable::new())));
        let session = Session::new(proc.pid);
        let pgroup = Pgroup::new(proc.pid, &session);
        pgroup.adopt(&proc);
        register_session(session);
        register_pgroup(pgroup);
        register_process(&proc);
        proc
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcState {
        *self.state.lock()
    }

    /// The parent process.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// The parent pid (0 for the root).
    #[must_use]
    pub fn ppid(&self) -> u32 {
        self.parent().map_or(0, |p| p.pid)
    }

    /// The process group.
    #[must_use]
    pub fn pgroup(&self) -> Option<Arc<Pgroup>> {
        self.pgroup.lock().upgrade()
    }

    /// A snapshot of the credentials.
    #[must_use]
    pub fn creds(&self) -> Creds {
        *self.creds.lock()
    }

    /// The user address space root (for CR3 switches).
    #[must_use]
    pub fn space_root(&self) -> PhysAddr {
        self.space.lock().as_ref().map_or(PhysAddr::zero(), |s| s.root_phys())
    }

    /// The user address space.
    #[must_use]
    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.lock().clone()
    }

    /// Installs a (new) user address space, returning the old one.
    pub fn set_space(&self, space: Option<Arc<AddressSpace>>) -> Option<Arc<AddressSpace>> {
        core::mem::replace(&mut *self.space.lock(), space)
    }

    /// The live threads.
    #[must_use]
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    /// Adds a thread to the process.
    pub fn adopt_thread(self: &Arc<Self>, thread: &Arc<Thread>) {
        *thread.process.lock() = Some(Arc::downgrade(self));
        self.threads.lock().push(thread.clone());
    }

    /// The exit status once the process is a zombie.
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    /// Live children of this process.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Process>> {
        with_process_table(|table| {
            table
                .values()
                .filter(|p| p.parent().is_some_and(|pp| pp.pid == self.pid))
                .cloned()
                .collect()
        })
    }
}

// ── Global tables ───────────────────────────────────────────────────

static PROCESS_TABLE: SpinMutex<BTreeMap<u32, Arc<Process>>> =
    SpinMutex::named("PROCESS_TABLE", BTreeMap::new());
static SESSION_TABLE: SpinMutex<BTreeMap<u32, Arc<Session>>> =
    SpinMutex::named("SESSION_TABLE", BTreeMap::new());
static PGROUP_TABLE: SpinMutex<BTreeMap<u32, Arc<Pgroup>>> =
    SpinMutex::named("PGROUP_TABLE", BTreeMap::new());

/// Registers a process in the global table.
pub fn register_process(proc: &Arc<Process>) {
    PROCESS_TABLE.lock().insert(proc.pid, proc.clone());
}

/// Looks up a process by pid.
#[must_use]
pub fn lookup_process(pid: u32) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&pid).cloned()
}

/// Removes a process from the global table (reaping).
pub fn unregister_process(pid: u32) {
    PROCESS_TABLE.lock().remove(&pid);
}

/// Runs a closure over the process table.
pub fn with_process_table<R>(f: impl FnOnce(&BTreeMap<u32, Arc<Process>>) -> R) -> R {
    f(&PROCESS_TABLE.lock())
}

fn register_session(session: Arc<Session>) {
    SESSION_TABLE.lock().insert(session.sid, session);
}

fn register_pgroup(pgroup: Arc<Pgroup>) {
    PGROUP_TABLE.lock().insert(pgroup.pgid, pgroup);
}

/// Looks up a pgroup by id.
#[must_use]
pub fn lookup_pgroup(pgid: u32) -> Option<Arc<Pgroup>> {
    PGROUP_TABLE.lock().get(&pgid).cloned()
}

// ── Address-space factory ───────────────────────────────────────────

/// Builds fresh user address spaces (page-table root + mapper).
///
/// Installed by the boot path on the target and by fixtures in tests so
/// `fork`/`exec` stay independent of the live MMU.
pub type SpaceFactory = fn() -> Result<SpaceParts, VmError>;

/// A fresh root table plus the mapper editing it.
pub type SpaceParts = (PhysAddr, alloc::boxed::Box<dyn crate::mm::vmm::PageTableOps>);

static SPACE_FACTORY: SpinMutex<Option<SpaceFactory>> =
    SpinMutex::named("SPACE_FACTORY", None);

/// Installs the user address-space factory.
pub fn set_space_factory(factory: SpaceFactory) {
    *SPACE_FACTORY.lock() = Some(factory);
}

/// Creates the raw parts of a user address space.
pub fn new_space_parts() -> Result<SpaceParts, Errno> {
    let factory = SPACE_FACTORY.lock().ok_or(Errno::EFAILED)?;
    factory().map_err(VmError::to_errno)
}

/// Creates an empty user address space through the installed factory.
pub fn new_user_space() -> Result<AddressSpace, Errno> {
    let (root, mapper) = new_space_parts()?;
    Ok(AddressSpace::new_user(root, mapper))
}

// ── Fork ────────────────────────────────────────────────────────────

/// Forks the current process.
///
/// Clones credentials and working directory, makes the address space
/// copy-on-write, clones or shares the file table per `flags`, clones
/// the signal action table when asked, and submits a copy of the calling
/// thread that resumes in the child's return-from-fork path.
pub fn fork(flags: ForkFlags) -> Result<Arc<Process>, Errno> {
    let parent = crate::sched::current_process().ok_or(Errno::ESRCH)?;
    let calling = crate::sched::current_thread().ok_or(Errno::ESRCH)?;

    let ftable = if flags.contains(ForkFlags::SHARE_FDS) {
        parent.ftable.clone()
    } else {
        Arc::new(parent.ftable.duplicate())
    };

    let child = Arc::new(Process::new_raw(ftable));
    *child.parent.lock() = Some(Arc::downgrade(&parent));
    *child.creds.lock() = parent.creds();
    *child.cwd.lock() = parent.cwd.lock().clone();
    child.brk.store(parent.brk.load(Ordering::Relaxed), Ordering::Relaxed);

    if flags.contains(ForkFlags::COPY_SIGACTS) {
        child.signals.copy_actions_from(&parent.signals);
    }

    // Address space: CoW clone of the parent's.
    if let Some(parent_space) = parent.space() {
        let (root, mapper) = new_space_parts()?;
        let child_space = parent_space.fork(root, mapper);
        *child.space.lock() = Some(Arc::new(child_space));
    }

    // Join the parent's pgroup.
    if let Some(pgroup) = parent.pgroup() {
        pgroup.adopt(&child);
    }

    // The child's first thread is a copy of the caller, resuming in the
    // fork-return path with rax = 0.
    let thread = Thread::new_user(calling.name(), &child);
    thread.set_priority(calling.priority());
    thread.set_affinity(calling.affinity());
    let _ = thread.set_sigmask(calling.sigmask());
    #[cfg(target_os = "none")]
    {
        let stack_size = crate::config::KERNEL_STACK_SIZE as usize;
        let stack = crate::boot::kernel_stack_pool().alloc(stack_size);
        if stack.is_null() {
            return Err(Errno::ENOMEM);
        }
        // SAFETY: The new stack is exclusively the child thread's; the
        // caller's user-mode register snapshot is cloned into the new TCB
        // so the child resumes at the same user PC with rax = 0.
        unsafe {
            thread
                .tcb
                .init_forked(calling.tcb_ptr(), stack as usize + stack_size);
        }
    }
    child.adopt_thread(&thread);

    register_process(&child);
    parent.knotes.activate(orion_syscall::kevent::NOTE_FORK);
    crate::sched::submit(thread);

    Ok(child)
}

// ── Exit / wait ─────────────────────────────────────────────────────

/// Terminates the current process with `status`.
///
/// Marks the process a zombie, closes its files, drops the address
/// space, notifies the parent, and terminates the calling thread. Does
/// not return.
pub fn exit(status: i32) -> ! {
    let proc = crate::sched::current_process();

    if let Some(proc) = proc {
        {
            *proc.exit_status.lock() = Some(status);
            *proc.state.lock() = ProcState::Zombie;
        }
        proc.ftable.close_all();
        let _old_space = proc.set_space(None);
        proc.knotes.activate(orion_syscall::kevent::NOTE_EXIT);

        if let Some(parent) = proc.parent() {
            signal::send(&parent, SigInfo {
                si_signo: SIGCHLD,
                si_code: orion_syscall::signal::CLD_EXITED,
                si_pid: proc.pid as i32,
                si_status: status,
                ..Default::default()
            });
            let _guard = parent.child_lock.lock();
            parent.child_cond.broadcast();
        }
    }

    exit_thread();
}

/// Terminates the calling thread, handing its carcass to the reaper.
pub fn exit_thread() -> ! {
    if let Some(td) = crate::sched::current_thread() {
        if let Some(proc) = td.process() {
            let mut threads = proc.threads.lock();
            threads.retain(|t| !Arc::ptr_eq(t, &td));
        }
        REAP_QUEUE.lock().push(td);
        REAP_COND.signal();
    }
    crate::sched::reschedule(crate::sched::Cause::Terminate);
    unreachable!("terminated thread rescheduled");
}

/// Which children `waitpid` matches.
#[derive(Debug, Clone, Copy)]
pub enum WaitTarget {
    /// Any child.
    Any,
    /// A specific pid.
    Pid(u32),
}

/// Waits for a child to exit and reaps it.
///
/// Returns `(pid, exit_status)`. The child is removed from the process
/// table exactly once; a second wait for the same pid reports `ECHILD`.
pub fn waitpid(target: WaitTarget) -> Result<(u32, i32), Errno> {
    let parent = crate::sched::current_process().ok_or(Errno::ESRCH)?;

    let mut guard = parent.child_lock.lock();
    loop {
        let children = parent.children();
        if children.is_empty() {
            return Err(Errno::ECHILD);
        }

        let candidate = children.iter().find(|c| {
            let matches = match target {
                WaitTarget::Any => true,
                WaitTarget::Pid(pid) => c.pid == pid,
            };
            matches && c.state() == ProcState::Zombie
        });

        if let Some(child) = candidate {
            let status = child.exit_status().unwrap_or(0);
            *child.state.lock() = ProcState::Exited;
            unregister_process(child.pid);
            return Ok((child.pid, status));
        }

        if let WaitTarget::Pid(pid) = target
            && !children.iter().any(|c| c.pid == pid)
        {
            return Err(Errno::ECHILD);
        }

        let (g, result) = parent.child_cond.wait_sig(guard);
        guard = g;
        if result == WaitResult::Interrupted {
            return Err(Errno::EINTR);
        }
        #[cfg(not(target_os = "none"))]
        {
            // Host builds cannot block; bail out instead of spinning.
            let zombies =
                parent.children().iter().any(|c| c.state() == ProcState::Zombie);
            if !zombies {
                return Err(Errno::EAGAIN);
            }
        }
    }
}

// ── Reaper ──────────────────────────────────────────────────────────

static REAP_QUEUE: SpinMutex<Vec<Arc<Thread>>> = SpinMutex::named("REAP_QUEUE", Vec::new());
static REAP_COND: Condvar = Condvar::new("reaper");
static REAP_LOCK: Mutex<()> = Mutex::named("reaper", ());

/// The reaper loop: frees terminated threads' stacks and TCBs.
pub fn reaper_loop() -> ! {
    loop {
        let dead = {
            let mut queue = REAP_QUEUE.lock();
            core::mem::take(&mut *queue)
        };
        for td in dead {
            // Wait until the victim has switched away for good.
            while td.state() != ThreadState::Killed {
                crate::sched::yield_now();
            }
            drop(td);
        }
        let guard = REAP_LOCK.lock();
        let _ = REAP_COND.wait(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_defaults() {
        let td = Thread::new_for_test(42);
        assert_eq!(td.tid(), 42);
        assert_eq!(td.state(), ThreadState::Ready);
        assert_eq!(td.priority(), DEFAULT_PRIORITY);
        assert_eq!(td.policy(), PolicyKind::System);
        assert_eq!(td.affinity(), u64::MAX);
        assert!(!td.in_critical_section());
    }

    #[test]
    fn critical_section_nesting() {
        let td = Thread::new_for_test(1);
        td.critical_enter();
        td.critical_enter();
        assert!(td.in_critical_section());
        td.critical_exit();
        assert!(td.in_critical_section());
        td.critical_exit();
        assert!(!td.in_critical_section());
    }

    #[test]
    fn sigmask_never_blocks_kill() {
        let td = Thread::new_for_test(1);
        td.set_sigmask(u64::MAX);
        assert_eq!(td.sigmask() & orion_syscall::signal::UNBLOCKABLE, 0);
    }

    #[test]
    fn accounting_accumulates_runtime() {
        let td = Thread::new_for_test(1);
        td.account_start(100);
        td.account_stop(400);
        td.account_start(500);
        td.account_stop(600);
        assert_eq!(td.runtime_ns(), 400);
        assert_eq!(td.last_run_ns(), 600);
    }

    #[test]
    fn root_process_hierarchy() {
        let root = Process::new_root();
        assert_eq!(root.ppid(), 0);
        assert_eq!(root.state(), ProcState::Active);
        let pgroup = root.pgroup().expect("pgroup");
        assert_eq!(pgroup.pgid, root.pid);
        let session = pgroup.session.upgrade().expect("session");
        assert_eq!(session.sid, root.pid);
        assert!(pgroup.members().iter().any(|p| p.pid == root.pid));
        assert!(lookup_process(root.pid).is_some());
        unregister_process(root.pid);
    }

    #[test]
    fn adopt_thread_links_both_ways() {
        let proc = Process::new_root();
        let td = Thread::new_for_test(77);
        proc.adopt_thread(&td);
        assert_eq!(td.process().unwrap().pid, proc.pid);
        assert!(proc.threads().iter().any(|t| t.tid() == 77));
        unregister_process(proc.pid);
    }

    #[test]
    fn waitpid_reaps_exactly_once() {
        let _serial = crate::sched::tests::test_lock();
        let parent = Process::new_root();
        let td = Thread::new_for_test(9000);
        parent.adopt_thread(&td);

        let child = Arc::new(Process::new_raw(Arc::new(crate::fs::Ftable::new())));
        *child.parent.lock() = Some(Arc::downgrade(&parent));
        *child.exit_status.lock() = Some(7);
        *child.state.lock() = ProcState::Zombie;
        register_process(&child);

        let prev = crate::sched::set_current_for_test(Some(td));

        // The exit status is observed exactly once.
        let (pid, status) = waitpid(WaitTarget::Pid(child.pid)).expect("reap");
        assert_eq!((pid, status), (child.pid, 7));
        assert_eq!(child.state(), ProcState::Exited);
        assert_eq!(waitpid(WaitTarget::Pid(child.pid)).err(), Some(Errno::ECHILD));

        let _ = crate::sched::set_current_for_test(prev);
        unregister_process(parent.pid);
    }

    #[test]
    fn children_lookup_via_table() {
        let parent = Process::new_root();
        let child = Arc::new(Process::new_raw(Arc::new(crate::fs::Ftable::new())));
        *child.parent.lock() = Some(Arc::downgrade(&parent));
        register_process(&child);

        let kids = parent.children();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].pid, child.pid);

        unregister_process(child.pid);
        unregister_process(parent.pid);
    }
}
