//! Anonymous pipes.
//!
//! A pipe is a 16-page ring buffer with reader/writer end counts and two
//! condition variables. Reading an empty pipe blocks while writers
//! exist and returns 0 (EOF) once they are gone; writing a full pipe
//! blocks while readers exist and raises `SIGPIPE` + `EPIPE` once they
//! are gone. Readable/writable transitions activate the pipe vnode's
//! knotes so kqueue filters see them.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use orion_syscall::Errno;
use orion_syscall::flags::OpenFlags;
use orion_syscall::kevent::{NOTE_LOWAT, NOTE_WRITE};
use orion_syscall::signal::{SIGPIPE, SigInfo};

use crate::fs::vnode::{Vnode, VnodeOps, VnodeType};
use crate::fs::File;
use crate::sync::{Condvar, Mutex};

/// Pipe capacity: 16 pages.
pub const PIPE_BUF_SIZE: usize = 16 * crate::addr::PAGE_SIZE as usize;

/// The ring buffer proper.
struct Ring {
    data: Box<[u8]>,
    rpos: usize,
    wpos: usize,
    count: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            data: alloc::vec![0u8; PIPE_BUF_SIZE].into_boxed_slice(),
            rpos: 0,
            wpos: 0,
            count: 0,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.count);
        for b in buf.iter_mut().take(n) {
            *b = self.data[self.rpos];
            self.rpos = (self.rpos + 1) % self.data.len();
        }
        self.count -= n;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let n = buf.len().min(self.data.len() - self.count);
        for &b in buf.iter().take(n) {
            self.data[self.wpos] = b;
            self.wpos = (self.wpos + 1) % self.data.len();
        }
        self.count += n;
        n
    }
}

/// Shared pipe state.
struct PipeInner {
    ring: Mutex<Ring>,
    readable: Condvar,
    writable: Condvar,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

/// Creates a pipe, returning `(read_end, write_end)` open files.
pub fn pipe() -> (Arc<File>, Arc<File>) {
    let inner = Arc::new(PipeInner {
        ring: Mutex::named("pipe", Ring::new()),
        readable: Condvar::new("pipe_read"),
        writable: Condvar::new("pipe_write"),
        readers: AtomicUsize::new(1),
        writers: AtomicUsize::new(1),
    });

    // Both ends share one knote list, so readable/writable transitions
    // reach filters registered on either descriptor.
    let knotes = Arc::new(crate::ipc::kqueue::KnList::new());
    let read_vn = Vnode::new_with_knotes(
        0,
        VnodeType::Fifo,
        Box::new(ReadEnd { inner: inner.clone() }),
        knotes.clone(),
    );
    let write_vn =
        Vnode::new_with_knotes(0, VnodeType::Fifo, Box::new(WriteEnd { inner }), knotes);

    (
        File::from_vnode(read_vn, OpenFlags::O_RDONLY),
        File::from_vnode(write_vn, OpenFlags::O_WRONLY),
    )
}

struct ReadEnd {
    inner: Arc<PipeInner>,
}

struct WriteEnd {
    inner: Arc<PipeInner>,
}

impl Drop for ReadEnd {
    fn drop(&mut self) {
        self.inner.readers.fetch_sub(1, Ordering::AcqRel);
        // Writers must notice the EPIPE condition.
        self.inner.writable.broadcast();
    }
}

impl Drop for WriteEnd {
    fn drop(&mut self) {
        self.inner.writers.fetch_sub(1, Ordering::AcqRel);
        // Readers must notice EOF.
        self.inner.readable.broadcast();
    }
}

impl VnodeOps for ReadEnd {
    fn lookup(&self, _dir: &Vnode, _name: &str) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::ENOTDIR)
    }

    fn poll(&self, _vn: &Vnode) -> u16 {
        let ring = self.inner.ring.lock();
        let mut events = 0;
        if ring.count > 0 || self.inner.writers.load(Ordering::Acquire) == 0 {
            events |= orion_syscall::flags::POLLIN;
        }
        events
    }

    fn read(&self, vn: &Vnode, _off: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut ring = self.inner.ring.lock();
        loop {
            if ring.count > 0 {
                let n = ring.read(buf);
                drop(ring);
                // Space opened up for writers.
                self.inner.writable.signal();
                vn.knotes.activate_with(NOTE_LOWAT, 0);
                return Ok(n);
            }
            if self.inner.writers.load(Ordering::Acquire) == 0 {
                return Ok(0); // EOF
            }
            let (guard, result) = self.inner.readable.wait_sig(ring);
            ring = guard;
            if result == crate::sync::WaitResult::Interrupted {
                return Err(Errno::EINTR);
            }
            #[cfg(not(target_os = "none"))]
            {
                // Host builds cannot block; surface would-block instead.
                if ring.count == 0 && self.inner.writers.load(Ordering::Acquire) > 0 {
                    return Err(Errno::EAGAIN);
                }
            }
        }
    }
}

impl VnodeOps for WriteEnd {
    fn lookup(&self, _dir: &Vnode, _name: &str) -> Result<Arc<Vnode>, Errno> {
        Err(Errno::ENOTDIR)
    }

    fn poll(&self, _vn: &Vnode) -> u16 {
        let ring = self.inner.ring.lock();
        let mut events = 0;
        if ring.count < PIPE_BUF_SIZE {
            events |= orion_syscall::flags::POLLOUT;
        }
        if self.inner.readers.load(Ordering::Acquire) == 0 {
            events |= orion_syscall::flags::POLLHUP;
        }
        events
    }

    fn write(&self, vn: &Vnode, _off: u64, buf: &[u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut ring = self.inner.ring.lock();
        loop {
            if self.inner.readers.load(Ordering::Acquire) == 0 {
                // Broken pipe: raise SIGPIPE at the writer and fail.
                drop(ring);
                if let Some(proc) = crate::sched::current_process() {
                    crate::proc::signal::send(&proc, SigInfo {
                        si_signo: SIGPIPE,
                        si_code: orion_syscall::signal::SI_KERNEL,
                        ..Default::default()
                    });
                }
                return Err(Errno::EPIPE);
            }
            if ring.count < PIPE_BUF_SIZE {
                let n = ring.write(buf);
                let level = ring.count;
                drop(ring);
                // Data arrived for readers.
                self.inner.readable.signal();
                vn.knotes.activate_with(NOTE_WRITE, level as i64);
                return Ok(n);
            }
            let (guard, result) = self.inner.writable.wait_sig(ring);
            ring = guard;
            if result == crate::sync::WaitResult::Interrupted {
                return Err(Errno::EINTR);
            }
            #[cfg(not(target_os = "none"))]
            {
                if ring.count == PIPE_BUF_SIZE {
                    return Err(Errno::EAGAIN);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let (rx, tx) = pipe();
        assert_eq!(tx.write(b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(rx.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn read_after_writer_close_is_eof() {
        let (rx, tx) = pipe();
        tx.write(b"tail").unwrap();
        drop(tx);

        // Buffered data drains first; then EOF.
        let mut buf = [0u8; 8];
        assert_eq!(rx.read(&mut buf).unwrap(), 4);
        assert_eq!(rx.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_after_reader_close_is_epipe() {
        let (rx, tx) = pipe();
        drop(rx);
        assert_eq!(tx.write(b"x").err(), Some(Errno::EPIPE));
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = Ring::new();
        let data = vec![0xA5u8; PIPE_BUF_SIZE - 10];
        assert_eq!(ring.write(&data), data.len());
        let mut out = vec![0u8; data.len()];
        assert_eq!(ring.read(&mut out), data.len());

        // The ring is now offset; a capacity-sized transfer must wrap.
        let data = vec![0x5Au8; PIPE_BUF_SIZE];
        assert_eq!(ring.write(&data), PIPE_BUF_SIZE);
        let mut out = vec![0u8; PIPE_BUF_SIZE];
        assert_eq!(ring.read(&mut out), PIPE_BUF_SIZE);
        assert_eq!(out, data);
    }

    #[test]
    fn capacity_bounds_single_write() {
        let (_rx, tx) = pipe();
        let data = vec![1u8; PIPE_BUF_SIZE + 100];
        // A single write stops at the ring capacity.
        assert_eq!(tx.write(&data).unwrap(), PIPE_BUF_SIZE);
    }

    #[test]
    fn knotes_fire_on_write() {
        use orion_syscall::kevent::{EV_ADD, EVFILT_READ, Kevent};

        let (rx, tx) = pipe();
        let kq = crate::ipc::kqueue::KQueue::new();
        // The filter registers on the read descriptor; the shared knlist
        // makes write-side activations visible to it.
        let note = kq.add(
            &Kevent::new(0, EVFILT_READ, EV_ADD, 0, 0, 0),
            &rx.vnode().knotes,
        );
        assert!(!note.is_active());
        let _ = tx.write(b"ping").unwrap();
        assert!(note.is_active());

        let mut out = [Kevent::new(0, 0, 0, 0, 0, 0); 2];
        assert!(kq.poll(&mut out) >= 1);
    }
}
