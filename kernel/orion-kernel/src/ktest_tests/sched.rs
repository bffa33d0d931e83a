//! Scheduler boot tests.

use core::sync::atomic::{AtomicUsize, Ordering};

use orion_ktest::kernel_test;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn bump_entry(arg: usize) {
    COUNTER.fetch_add(arg, Ordering::AcqRel);
}

#[kernel_test(stage = "with_sched")]
fn spawned_threads_run() {
    COUNTER.store(0, Ordering::Release);
    for _ in 0..4 {
        let td = crate::proc::Thread::new_kernel("ktest_bump", bump_entry, 1).expect("thread");
        crate::sched::submit(td);
    }
    let deadline = crate::time::clock::uptime_nanos() + crate::time::NANOS_PER_SEC;
    while COUNTER.load(Ordering::Acquire) < 4 {
        assert!(crate::time::clock::uptime_nanos() < deadline, "threads never ran");
        crate::sched::yield_now();
    }
}

#[kernel_test(stage = "with_sched")]
fn sleep_wakes_up() {
    let before = crate::time::clock::uptime_nanos();
    let result = crate::sched::sleep_ns(5_000_000);
    let elapsed = crate::time::clock::uptime_nanos() - before;
    assert_eq!(result, crate::sync::WaitResult::Timeout);
    assert!(elapsed >= 5_000_000, "sleep returned after {elapsed} ns");
}

#[kernel_test(stage = "with_sched")]
fn priority_starves_lower() {
    use crate::proc::Thread;

    static LOW_RAN: AtomicUsize = AtomicUsize::new(0);
    fn low_entry(_: usize) {
        LOW_RAN.fetch_add(1, Ordering::AcqRel);
    }

    LOW_RAN.store(0, Ordering::Release);
    let low = Thread::new_kernel("ktest_low", low_entry, 0).expect("thread");
    low.set_priority(1);
    // Our own priority outranks it; the low thread must not run until we
    // sleep (which cedes the CPU).
    let me = crate::sched::current_thread().expect("current");
    let old = me.priority();
    me.set_priority(50);
    crate::sched::submit(low);
    crate::sched::yield_now();
    assert_eq!(LOW_RAN.load(Ordering::Acquire), 0, "lower priority ran while we were runnable");

    let _ = crate::sched::sleep_ns(2_000_000);
    assert_eq!(LOW_RAN.load(Ordering::Acquire), 1, "lower priority never ran");
    me.set_priority(old);
}
