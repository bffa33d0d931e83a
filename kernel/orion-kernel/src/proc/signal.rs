//! Signal queueing and delivery.
//!
//! Signals live in three places: the per-process pending queue, the
//! per-process action table, and a per-thread delivery slot. Delivery is
//! an explicit state machine per thread —
//! `NONE → PENDING → DELIVERED → RETURNED` — with a saved-context slot
//! filled when the handler frame is built on the user stack and consumed
//! by `sigreturn`.
//!
//! `send` drops ignored signals early, queues the rest, and kicks a
//! thread whose mask permits delivery; a thread blocked in an
//! interruptible wait is woken with [`WaitResult::Interrupted`] so the
//! signal is handled at the next kernel→user boundary.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use orion_syscall::signal::{
    NSIG, SIG_DFL, SIG_IGN, SIGCHLD, SIGCONT, SIGSTOP, SIGWINCH, SigAction, SigInfo, UNBLOCKABLE,
    sigmask,
};

use crate::sync::SpinMutex;
use crate::sync::waitq::WaitResult;

use super::Process;

/// What the default disposition of a signal does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// Terminate the process.
    Terminate,
    /// Discard the signal.
    Ignore,
    /// Stop the process (job control).
    Stop,
    /// Resume a stopped process.
    Continue,
}

/// The default disposition table.
#[must_use]
pub fn default_action(signo: i32) -> DefaultAction {
    match signo {
        SIGCHLD | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | orion_syscall::signal::SIGTSTP
        | orion_syscall::signal::SIGTTIN
        | orion_syscall::signal::SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

// ---------------------------------------------------------------------------
// Per-process state
// ---------------------------------------------------------------------------

/// A process's pending queue and action table.
pub struct SignalState {
    pending: SpinMutex<VecDeque<SigInfo>>,
    actions: SpinMutex<[SigAction; NSIG]>,
}

impl SignalState {
    /// Creates a default-initialized signal state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: SpinMutex::named("sig_pending", VecDeque::new()),
            actions: SpinMutex::named("sig_actions", [SigAction::default_action(); NSIG]),
        }
    }

    /// The registered action for a signal.
    #[must_use]
    pub fn action(&self, signo: i32) -> SigAction {
        self.actions.lock()[signo as usize]
    }

    /// Replaces the action for a signal, returning the old one.
    pub fn set_action(&self, signo: i32, action: SigAction) -> SigAction {
        core::mem::replace(&mut self.actions.lock()[signo as usize], action)
    }

    /// Copies the whole action table from another process (fork).
    pub fn copy_actions_from(&self, other: &SignalState) {
        *self.actions.lock() = *other.actions.lock();
    }

    /// Resets caught signals to the default disposition (exec).
    pub fn reset_caught_actions(&self) {
        for action in self.actions.lock().iter_mut() {
            if action.sa_handler > SIG_IGN {
                *action = SigAction::default_action();
            }
        }
    }

    /// Queues a pending signal.
    pub fn queue(&self, info: SigInfo) {
        self.pending.lock().push_back(info);
    }

    /// Whether a signal not covered by `mask` is pending.
    #[must_use]
    pub fn has_deliverable(&self, mask: u64) -> bool {
        self.pending
            .lock()
            .iter()
            .any(|info| mask & sigmask(info.si_signo) == 0)
    }

    /// Removes and returns the first pending signal not covered by `mask`.
    #[must_use]
    pub fn take_deliverable(&self, mask: u64) -> Option<SigInfo> {
        let mut pending = self.pending.lock();
        let pos = pending.iter().position(|info| mask & sigmask(info.si_signo) == 0)?;
        pending.remove(pos)
    }

    /// Number of queued signals.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-thread delivery state machine
// ---------------------------------------------------------------------------

/// Saved user context while a handler runs (restored by `sigreturn`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    /// The interrupted user instruction pointer.
    pub rip: u64,
    /// The interrupted user stack pointer.
    pub rsp: u64,
    /// RFLAGS at interruption.
    pub rflags: u64,
    /// The signal mask to restore.
    pub saved_mask: u64,
}

/// Phases of delivering one signal to one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// No delivery in flight.
    None,
    /// A signal is picked for this thread, frame not yet built.
    Pending(SigInfo),
    /// The handler frame is on the user stack; the handler runs.
    Delivered(SigInfo),
    /// `sigreturn` ran; the saved context is being restored.
    Returned,
}

/// One thread's delivery slot.
pub struct DeliverySlot {
    phase: SpinMutex<DeliveryPhase>,
    saved: SpinMutex<Option<SavedContext>>,
}

impl DeliverySlot {
    /// Creates an idle slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: SpinMutex::named("sig_phase", DeliveryPhase::None),
            saved: SpinMutex::named("sig_saved", None),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> DeliveryPhase {
        *self.phase.lock()
    }

    /// Whether a signal is staged for this thread.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.phase(), DeliveryPhase::Pending(_))
    }

    /// Stages a signal. Only legal when no delivery is in flight.
    pub fn set_pending(&self, info: SigInfo) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            DeliveryPhase::None | DeliveryPhase::Returned => {
                *phase = DeliveryPhase::Pending(info);
                true
            }
            _ => false,
        }
    }

    /// Begins delivery: `PENDING → DELIVERED`, saving the context.
    #[must_use]
    pub fn begin_delivery(&self, context: SavedContext) -> Option<SigInfo> {
        let mut phase = self.phase.lock();
        let DeliveryPhase::Pending(info) = *phase else {
            return None;
        };
        *phase = DeliveryPhase::Delivered(info);
        *self.saved.lock() = Some(context);
        Some(info)
    }

    /// Completes delivery via `sigreturn`: `DELIVERED → RETURNED → NONE`,
    /// handing back the saved context.
    #[must_use]
    pub fn finish_return(&self) -> Option<SavedContext> {
        let mut phase = self.phase.lock();
        let DeliveryPhase::Delivered(_) = *phase else {
            return None;
        };
        *phase = DeliveryPhase::Returned;
        let saved = self.saved.lock().take();
        *phase = DeliveryPhase::None;
        saved
    }
}

impl Default for DeliverySlot {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

/// Sends a signal to a process.
///
/// Ignored signals (explicitly or by default disposition) are dropped
/// before queueing, except the unblockable ones. Delivery picks a thread
/// whose mask permits the signal; one blocked interruptibly is woken.
pub fn send(proc: &Arc<Process>, info: SigInfo) {
    let signo = info.si_signo;
    if signo <= 0 || signo as usize >= NSIG {
        return;
    }

    if UNBLOCKABLE & sigmask(signo) == 0 {
        let action = proc.signals.action(signo);
        let ignored = action.sa_handler == SIG_IGN
            || (action.sa_handler == SIG_DFL && default_action(signo) == DefaultAction::Ignore);
        if ignored {
            return;
        }
    }

    proc.signals.queue(info);

    // Kick a thread whose mask permits the signal.
    for td in proc.threads() {
        if td.sigmask() & sigmask(signo) != 0 {
            continue;
        }
        if td.is_interruptible()
            && let Some(cell) = td.take_wait_cell()
            && cell.claim()
        {
            crate::sched::make_runnable(&td, WaitResult::Interrupted);
        }
        break;
    }
}

/// Sends a signal to the process with the given pid.
pub fn kill(pid: u32, signo: i32) -> Result<(), orion_syscall::Errno> {
    let proc = super::lookup_process(pid).ok_or(orion_syscall::Errno::ESRCH)?;
    send(&proc, SigInfo {
        si_signo: signo,
        si_code: orion_syscall::signal::SI_USER,
        si_pid: crate::sched::current_process().map_or(0, |p| p.pid as i32),
        ..Default::default()
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_syscall::signal::{SIGINT, SIGTERM, SIGUSR1};

    #[test]
    fn queue_and_mask_filtering() {
        let state = SignalState::new();
        state.queue(SigInfo { si_signo: SIGINT, ..Default::default() });
        state.queue(SigInfo { si_signo: SIGTERM, ..Default::default() });

        // SIGINT masked: only SIGTERM is deliverable.
        let mask = sigmask(SIGINT);
        assert!(state.has_deliverable(mask));
        let taken = state.take_deliverable(mask).expect("deliverable");
        assert_eq!(taken.si_signo, SIGTERM);
        // SIGINT is still queued, blocked.
        assert!(!state.has_deliverable(mask));
        assert!(state.has_deliverable(0));
    }

    #[test]
    fn action_table_roundtrip() {
        let state = SignalState::new();
        let action = SigAction { sa_handler: 0x40_0000, sa_flags: 0, sa_restorer: 0, sa_mask: 0 };
        let old = state.set_action(SIGUSR1, action);
        assert_eq!(old.sa_handler, SIG_DFL);
        assert_eq!(state.action(SIGUSR1).sa_handler, 0x40_0000);

        // exec resets caught handlers, keeps ignored ones.
        let ign = SigAction { sa_handler: SIG_IGN, sa_flags: 0, sa_restorer: 0, sa_mask: 0 };
        state.set_action(SIGINT, ign);
        state.reset_caught_actions();
        assert_eq!(state.action(SIGUSR1).sa_handler, SIG_DFL);
        assert_eq!(state.action(SIGINT).sa_handler, SIG_IGN);
    }

    #[test]
    fn delivery_state_machine() {
        let slot = DeliverySlot::new();
        assert_eq!(slot.phase(), DeliveryPhase::None);

        let info = SigInfo { si_signo: SIGUSR1, ..Default::default() };
        assert!(slot.set_pending(info));
        assert!(slot.is_pending());
        // A second stage attempt while one is in flight fails.
        assert!(!slot.set_pending(info));

        let ctx = SavedContext { rip: 0x40_1000, rsp: 0x7FFF_0000, rflags: 0x202, saved_mask: 0 };
        let delivered = slot.begin_delivery(ctx).expect("pending → delivered");
        assert_eq!(delivered.si_signo, SIGUSR1);
        assert!(matches!(slot.phase(), DeliveryPhase::Delivered(_)));

        let restored = slot.finish_return().expect("delivered → returned");
        assert_eq!(restored.rip, 0x40_1000);
        assert_eq!(slot.phase(), DeliveryPhase::None);

        // begin_delivery without a pending signal is a no-op.
        assert!(slot.begin_delivery(ctx).is_none());
    }

    #[test]
    fn default_dispositions() {
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(SIGTERM), DefaultAction::Terminate);
        assert_eq!(default_action(SIGSTOP), DefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
    }

    #[test]
    fn ignored_signal_is_dropped_at_send() {
        let proc = crate::proc::Process::new_root();
        // SIGCHLD defaults to ignore: never queued.
        send(&proc, SigInfo { si_signo: SIGCHLD, ..Default::default() });
        assert_eq!(proc.signals.pending_count(), 0);

        // SIGTERM defaults to terminate: queued.
        send(&proc, SigInfo { si_signo: SIGTERM, ..Default::default() });
        assert_eq!(proc.signals.pending_count(), 1);
        crate::proc::unregister_process(proc.pid);
    }
}
