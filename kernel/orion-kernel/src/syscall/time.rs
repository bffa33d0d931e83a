//! Time syscalls.

use orion_syscall::{Errno, TimeSpec};

use crate::sync::WaitResult;

use super::userptr;

/// `CLOCK_REALTIME`.
const CLOCK_REALTIME: usize = 0;
/// `CLOCK_MONOTONIC`.
const CLOCK_MONOTONIC: usize = 1;

pub fn sys_sleep(seconds: usize) -> Result<isize, Errno> {
    let ns = (seconds as u64).saturating_mul(crate::time::NANOS_PER_SEC);
    match crate::sched::sleep_ns(ns) {
        WaitResult::Interrupted => Err(Errno::EINTR),
        _ => Ok(0),
    }
}

pub fn sys_nanosleep(req: usize, rem: usize) -> Result<isize, Errno> {
    let ts: TimeSpec = userptr::copy_in_val(req)?;
    let ns = ts.to_nanos().ok_or(Errno::EINVAL)?;
    let start = crate::time::clock::try_uptime_nanos().unwrap_or(0);
    match crate::sched::sleep_ns(ns) {
        WaitResult::Interrupted => {
            if rem != 0 {
                let elapsed = crate::time::clock::try_uptime_nanos().unwrap_or(0) - start;
                let left = TimeSpec::from_nanos(ns.saturating_sub(elapsed));
                userptr::copy_out_val(rem, &left)?;
            }
            Err(Errno::EINTR)
        }
        _ => Ok(0),
    }
}

pub fn sys_clock_gettime(clock_id: usize, tp: usize) -> Result<isize, Errno> {
    let nanos = match clock_id {
        CLOCK_REALTIME => crate::time::clock::realtime_nanos(),
        CLOCK_MONOTONIC => crate::time::clock::try_uptime_nanos().unwrap_or(0),
        _ => return Err(Errno::EINVAL),
    };
    userptr::copy_out_val(tp, &TimeSpec::from_nanos(nanos))?;
    Ok(0)
}

pub fn sys_clock_getres(clock_id: usize, res: usize) -> Result<isize, Errno> {
    if clock_id != CLOCK_REALTIME && clock_id != CLOCK_MONOTONIC {
        return Err(Errno::EINVAL);
    }
    if res != 0 {
        let ns = crate::time::clock::resolution_nanos();
        userptr::copy_out_val(res, &TimeSpec::from_nanos(ns))?;
    }
    Ok(0)
}
