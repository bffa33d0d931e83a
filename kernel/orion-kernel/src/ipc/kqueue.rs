//! Kqueue event notification.
//!
//! A [`Knote`] is one filter+ident registration watching an object; the
//! watched object anchors its notes in a [`KnList`] protected by that
//! object's lock discipline. Completion paths (writes, exits, device
//! events) call [`KnList::activate`] with the filter flags describing
//! what happened; the owning [`KQueue`] aggregates activations and hands
//! them to userspace through its ioctl surface.

extern crate alloc;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use orion_syscall::kevent::{
    EV_CLEAR, EV_DISABLE, EV_ENABLE, EV_EOF, EV_ONESHOT, Kevent,
};

use crate::sync::{SpinMutex, WaitQueue};

/// One registered event filter.
pub struct Knote {
    /// The watched identifier (fd, pid, signal, timer id).
    pub ident: usize,
    /// The filter class (`EVFILT_*`).
    pub filter: i16,
    /// Action/behavior flags (`EV_*`).
    pub flags: AtomicU32,
    /// The filter flags of interest (`NOTE_*`); 0 = any.
    pub fflags_interest: u32,
    /// Accumulated filter flags since the last report.
    fflags_seen: AtomicU32,
    /// Filter data (bytes readable, exit status…).
    pub data: AtomicI64,
    /// Opaque user data.
    pub udata: usize,
    active: AtomicBool,
    enabled: AtomicBool,
    eof: AtomicBool,
    kq: Weak<KQueue>,
}

impl Knote {
    /// Whether the note has fired since the last report.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks EOF (writer side gone, process reaped).
    pub fn set_eof(&self) {
        self.eof.store(true, Ordering::Release);
    }

    /// Builds the outgoing event and resets per-report state.
    fn report(&self) -> Kevent {
        let mut flags = self.flags.load(Ordering::Acquire) as u16;
        if self.eof.load(Ordering::Acquire) {
            flags |= EV_EOF;
        }
        let fflags = self.fflags_seen.load(Ordering::Acquire);
        if self.flags.load(Ordering::Acquire) as u16 & EV_CLEAR != 0 {
            self.fflags_seen.store(0, Ordering::Release);
            self.data.store(0, Ordering::Release);
        }
        self.active.store(false, Ordering::Release);
        Kevent {
            ident: self.ident,
            filter: self.filter,
            flags,
            fflags,
            data: self.data.load(Ordering::Acquire) as isize,
            udata: self.udata,
        }
    }
}

/// An object-anchored list of knotes.
pub struct KnList {
    notes: SpinMutex<Vec<Arc<Knote>>>,
}

impl KnList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self { notes: SpinMutex::named("knlist", Vec::new()) }
    }

    /// Attaches a note.
    pub fn attach(&self, note: &Arc<Knote>) {
        self.notes.lock().push(note.clone());
    }

    /// Detaches a note (by kqueue + ident + filter identity).
    pub fn detach(&self, note: &Arc<Knote>) {
        self.notes.lock().retain(|n| !Arc::ptr_eq(n, note));
    }

    /// Number of attached notes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notes.lock().len()
    }

    /// Whether no notes are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notes.lock().is_empty()
    }

    /// Activates every enabled note interested in `fflags`, waking the
    /// owning kqueues.
    pub fn activate(&self, fflags: u32) {
        self.activate_with(fflags, 0);
    }

    /// Like [`KnList::activate`] with filter data (readable bytes, exit
    /// status…).
    pub fn activate_with(&self, fflags: u32, data: i64) {
        let notes: Vec<Arc<Knote>> = self.notes.lock().clone();
        for note in notes {
            if !note.enabled.load(Ordering::Acquire) {
                continue;
            }
            if note.fflags_interest != 0 && note.fflags_interest & fflags == 0 {
                continue;
            }
            let mask = if note.fflags_interest == 0 {
                fflags
            } else {
                fflags & note.fflags_interest
            };
            note.fflags_seen.fetch_or(mask, Ordering::AcqRel);
            if data != 0 {
                note.data.store(data, Ordering::Release);
            }
            note.active.store(true, Ordering::Release);
            if let Some(kq) = note.kq.upgrade() {
                kq.waiters.wake_all();
            }
        }
    }
}

impl Default for KnList {
    fn default() -> Self {
        Self::new()
    }
}

/// A process-owned event multiplexing endpoint.
pub struct KQueue {
    /// Every note registered through this kqueue.
    notes: SpinMutex<Vec<Arc<Knote>>>,
    /// Threads blocked in a poll.
    waiters: WaitQueue,
}

impl KQueue {
    /// Creates an empty kqueue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notes: SpinMutex::named("kqueue", Vec::new()),
            waiters: WaitQueue::new(),
        })
    }

    /// Registers a change, attaching the note to `list`.
    ///
    /// Returns the note so callers can stash it with the watched object.
    pub fn add(
        self: &Arc<Self>,
        change: &Kevent,
        list: &KnList,
    ) -> Arc<Knote> {
        let note = Arc::new(Knote {
            ident: change.ident,
            filter: change.filter,
            flags: AtomicU32::new(u32::from(change.flags)),
            fflags_interest: change.fflags,
            fflags_seen: AtomicU32::new(0),
            data: AtomicI64::new(0),
            udata: change.udata,
            active: AtomicBool::new(false),
            enabled: AtomicBool::new(change.flags & EV_DISABLE == 0),
            eof: AtomicBool::new(false),
            kq: Arc::downgrade(self),
        });
        list.attach(&note);
        self.notes.lock().push(note.clone());
        note
    }

    /// Finds a registered note by `(ident, filter)`.
    #[must_use]
    pub fn find(&self, ident: usize, filter: i16) -> Option<Arc<Knote>> {
        self.notes
            .lock()
            .iter()
            .find(|n| n.ident == ident && n.filter == filter)
            .cloned()
    }

    /// Removes a note from this kqueue (the caller also detaches it from
    /// its knlist).
    pub fn remove(&self, note: &Arc<Knote>) {
        self.notes.lock().retain(|n| !Arc::ptr_eq(n, note));
    }

    /// Applies `EV_ENABLE`/`EV_DISABLE` to a registered note.
    pub fn set_enabled(&self, note: &Arc<Knote>, change_flags: u16) {
        if change_flags & EV_ENABLE != 0 {
            note.enabled.store(true, Ordering::Release);
        }
        if change_flags & EV_DISABLE != 0 {
            note.enabled.store(false, Ordering::Release);
        }
    }

    /// Collects up to `out.len()` active events without blocking.
    ///
    /// One-shot notes are removed after reporting.
    pub fn poll(&self, out: &mut [Kevent]) -> usize {
        let mut count = 0;
        let mut oneshots = Vec::new();
        {
            let notes = self.notes.lock();
            for note in notes.iter() {
                if count == out.len() {
                    break;
                }
                if note.is_active() && note.enabled.load(Ordering::Acquire) {
                    out[count] = note.report();
                    count += 1;
                    if note.flags.load(Ordering::Acquire) as u16 & EV_ONESHOT != 0 {
                        oneshots.push(note.clone());
                    }
                }
            }
        }
        for note in oneshots {
            self.remove(&note);
        }
        count
    }

    /// Waits for events, blocking up to `timeout_ns` (None = forever).
    pub fn wait(&self, out: &mut [Kevent], timeout_ns: Option<u64>) -> usize {
        loop {
            let n = self.poll(out);
            if n > 0 {
                return n;
            }
            let result = match timeout_ns {
                Some(ns) => self.waiters.wait_sig_timeout("kqueue", ns),
                None => self.waiters.wait_sig("kqueue"),
            };
            match result {
                crate::sync::WaitResult::Normal => continue,
                crate::sync::WaitResult::Timeout | crate::sync::WaitResult::Interrupted => {
                    return self.poll(out);
                }
            }
        }
    }

    /// Number of registered notes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notes.lock().len()
    }

    /// Whether no notes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notes.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_syscall::kevent::{EV_ADD, EVFILT_READ, EVFILT_VNODE, NOTE_EXTEND, NOTE_WRITE};

    fn change(ident: usize, filter: i16, flags: u16, fflags: u32) -> Kevent {
        Kevent::new(ident, filter, flags, fflags, 0, 0xAB)
    }

    #[test]
    fn activate_marks_matching_notes() {
        let kq = KQueue::new();
        let list = KnList::new();
        let note = kq.add(&change(3, EVFILT_VNODE, EV_ADD, NOTE_WRITE), &list);

        // A non-matching activation is ignored.
        list.activate(NOTE_EXTEND);
        assert!(!note.is_active());
        // A matching one fires.
        list.activate(NOTE_WRITE | NOTE_EXTEND);
        assert!(note.is_active());

        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 4];
        let n = kq.poll(&mut out);
        assert_eq!(n, 1);
        assert_eq!(out[0].ident, 3);
        assert_eq!(out[0].udata, 0xAB);
        assert_eq!(out[0].fflags & NOTE_WRITE, NOTE_WRITE);
    }

    #[test]
    fn zero_interest_matches_any() {
        let kq = KQueue::new();
        let list = KnList::new();
        let note = kq.add(&change(1, EVFILT_READ, EV_ADD, 0), &list);
        list.activate_with(0, 128);
        assert!(note.is_active());
        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 1];
        assert_eq!(kq.poll(&mut out), 1);
        assert_eq!(out[0].data, 128);
    }

    #[test]
    fn oneshot_notes_disappear_after_report() {
        let kq = KQueue::new();
        let list = KnList::new();
        let _ = kq.add(&change(1, EVFILT_READ, EV_ADD | EV_ONESHOT, 0), &list);
        list.activate(0);

        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 1];
        assert_eq!(kq.poll(&mut out), 1);
        assert_eq!(kq.len(), 0);
        assert_eq!(kq.poll(&mut out), 0);
    }

    #[test]
    fn clear_resets_state_after_report() {
        let kq = KQueue::new();
        let list = KnList::new();
        let note = kq.add(&change(1, EVFILT_VNODE, EV_ADD | EV_CLEAR, NOTE_WRITE), &list);
        list.activate(NOTE_WRITE);

        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 1];
        assert_eq!(kq.poll(&mut out), 1);
        // EV_CLEAR: inactive and fflags reset until the next activation.
        assert!(!note.is_active());
        assert_eq!(kq.poll(&mut out), 0);
        list.activate(NOTE_WRITE);
        assert_eq!(kq.poll(&mut out), 1);
    }

    #[test]
    fn disabled_notes_do_not_fire() {
        let kq = KQueue::new();
        let list = KnList::new();
        let note = kq.add(&change(1, EVFILT_READ, EV_ADD | EV_DISABLE, 0), &list);
        list.activate(0);
        assert!(!note.is_active());

        kq.set_enabled(&note, EV_ENABLE);
        list.activate(0);
        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 1];
        assert_eq!(kq.poll(&mut out), 1);
    }

    #[test]
    fn detach_stops_delivery() {
        let kq = KQueue::new();
        let list = KnList::new();
        let note = kq.add(&change(1, EVFILT_READ, EV_ADD, 0), &list);
        list.detach(&note);
        kq.remove(&note);
        list.activate(0);
        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 1];
        assert_eq!(kq.poll(&mut out), 0);
    }
}
