//! Timekeeping: clock sources and alarms.
//!
//! [`clock`] derives monotonic and wall-clock time from the best available
//! free-running counter; [`alarm`] schedules one-shot callbacks against a
//! programmable timer, running tickless when the hardware supports
//! one-shot mode.

pub mod alarm;
pub mod clock;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;
