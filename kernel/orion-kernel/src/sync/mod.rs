//! Synchronization primitives.
//!
//! Two families, split by whether the caller may sleep:
//!
//! - **Spin side** ([`SpinMutex`]): IRQ-saving, re-entrant, short critical
//!   sections only. The only primitive usable from interrupt handlers, and
//!   the only one usable before the scheduler starts.
//! - **Sleep side** ([`Mutex`], [`RwLock`], [`Condvar`], [`Semaphore`]):
//!   contended callers block on a [`WaitQueue`] and are woken by the
//!   releasing thread. Never usable from interrupt context, and a spin
//!   mutex may never be held across any of them.

mod cond;
mod mutex;
mod rwlock;
mod sem;
mod spin;
pub mod waitq;

pub use cond::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use sem::Semaphore;
pub use spin::{SpinMutex, SpinMutexGuard};
pub use waitq::{WaitQueue, WaitResult};
