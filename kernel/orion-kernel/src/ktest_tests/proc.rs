//! Process boot tests.

use orion_ktest::kernel_test;

#[kernel_test(stage = "with_sched")]
fn waitq_blocks_and_wakes() {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static STATE: AtomicUsize = AtomicUsize::new(0);
    static QUEUE: crate::sync::WaitQueue = crate::sync::WaitQueue::new();

    fn waiter(_: usize) {
        STATE.store(1, Ordering::Release);
        let result = QUEUE.wait("ktest_waitq");
        assert_eq!(result, crate::sync::WaitResult::Normal);
        STATE.store(2, Ordering::Release);
    }

    STATE.store(0, Ordering::Release);
    let td = crate::proc::Thread::new_kernel("ktest_waiter", waiter, 0).expect("thread");
    crate::sched::submit(td);

    // Let the waiter block, then wake it.
    while STATE.load(Ordering::Acquire) < 1 {
        crate::sched::yield_now();
    }
    let _ = crate::sched::sleep_ns(1_000_000);
    assert!(QUEUE.wake_one(), "no waiter queued");
    let deadline = crate::time::clock::uptime_nanos() + crate::time::NANOS_PER_SEC;
    while STATE.load(Ordering::Acquire) < 2 {
        assert!(crate::time::clock::uptime_nanos() < deadline, "waiter never woke");
        crate::sched::yield_now();
    }
}

#[kernel_test(stage = "with_sched")]
fn mutex_excludes_across_threads() {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DONE: AtomicUsize = AtomicUsize::new(0);
    static SHARED: crate::sync::Mutex<u64> = crate::sync::Mutex::new(0);

    fn contender(_: usize) {
        for _ in 0..100 {
            let mut guard = SHARED.lock();
            let old = *guard;
            crate::sched::yield_now();
            *guard = old + 1;
        }
        DONE.fetch_add(1, Ordering::AcqRel);
    }

    DONE.store(0, Ordering::Release);
    *SHARED.lock() = 0;
    for _ in 0..2 {
        let td = crate::proc::Thread::new_kernel("ktest_mutex", contender, 0).expect("thread");
        crate::sched::submit(td);
    }
    let deadline = crate::time::clock::uptime_nanos() + 10 * crate::time::NANOS_PER_SEC;
    while DONE.load(Ordering::Acquire) < 2 {
        assert!(crate::time::clock::uptime_nanos() < deadline, "contenders stuck");
        crate::sched::yield_now();
    }
    // Lost updates would leave the count short.
    assert_eq!(*SHARED.lock(), 200);
}

#[kernel_test(stage = "with_sched")]
fn pipe_roundtrip_across_threads() {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static WRITER_DONE: AtomicUsize = AtomicUsize::new(0);
    static PIPE_TX: crate::sync::SpinMutex<Option<alloc::sync::Arc<crate::fs::File>>> =
        crate::sync::SpinMutex::new(None);

    fn writer(_: usize) {
        let tx = PIPE_TX.lock().take().expect("tx staged");
        assert_eq!(tx.write(b"hi").expect("pipe write"), 2);
        WRITER_DONE.store(1, Ordering::Release);
    }

    let (rx, tx) = crate::ipc::pipe::pipe();
    WRITER_DONE.store(0, Ordering::Release);
    *PIPE_TX.lock() = Some(tx);
    let td = crate::proc::Thread::new_kernel("ktest_pipe_w", writer, 0).expect("thread");
    crate::sched::submit(td);

    let mut buf = [0u8; 2];
    // The read blocks until the writer has run.
    assert_eq!(rx.read(&mut buf).expect("pipe read"), 2);
    assert_eq!(&buf, b"hi");

    // Close the write side (the writer dropped its handle): EOF.
    while WRITER_DONE.load(Ordering::Acquire) == 0 {
        crate::sched::yield_now();
    }
    assert_eq!(rx.read(&mut buf).expect("eof read"), 0);
}
