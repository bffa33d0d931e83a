//! Kernel configuration.
//!
//! Compile-time constants plus the boot cmdline parameter registry.
//! Parameters are declared by placing a [`KernelParam`] into the
//! `.orion_kernel_params` linker section; [`parse_cmdline`] walks the
//! space-separated `key=value` pairs at static-init and stores each value
//! into the parameter's registered target. Unknown keys and malformed
//! values warn and are otherwise ignored.

use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::log::LogLevel;
use crate::sync::SpinMutex;

// ---------------------------------------------------------------------------
// Compile-time configuration
// ---------------------------------------------------------------------------

/// Maximum kernel log level; higher-verbosity messages are compiled out.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// Maximum number of CPUs supported by the kernel.
pub const MAX_CPUS: usize = 32;

/// Size of the kernel heap window in bytes (4 MiB + 2 MiB).
pub const KERNEL_HEAP_SIZE: u64 = 0x40_0000 + 0x20_0000;

/// Virtual base of the kernel heap window.
pub const KERNEL_HEAP_VA: u64 = 0xFFFF_FF80_0040_0000;

/// Size of a kernel thread stack.
pub const KERNEL_STACK_SIZE: u64 = 0x4000;

/// Scheduler timeslice in nanoseconds (10 ms).
pub const SCHED_TIMESLICE_NS: u64 = 10_000_000;

/// Cache-warmth window for affinity placement (50 ms).
pub const SCHED_WARMTH_NS: u64 = 50_000_000;

/// Fixed load base of the dynamic linker in user address spaces.
pub const LIBC_BASE_ADDR: u64 = 0x0000_7FC0_0000_0000;

// ---------------------------------------------------------------------------
// Boot cmdline parameters
// ---------------------------------------------------------------------------

/// The writable target of a registered cmdline parameter.
pub enum ParamTarget {
    /// A string parameter; stores a slice of the (static) cmdline.
    Str(&'static SpinMutex<Option<&'static str>>),
    /// An integer parameter (decimal or `0x` hex).
    Int(&'static AtomicI64),
    /// A boolean parameter (`true/false`, `on/off`, `1/0`; bare key = true).
    Bool(&'static AtomicBool),
}

/// A cmdline parameter registration, placed in `.orion_kernel_params`.
pub struct KernelParam {
    /// The `key` this parameter matches.
    pub name: &'static str,
    /// Where the parsed value is stored.
    pub target: ParamTarget,
}

orion_linkset::declare_linkset! {
    /// Returns all registered cmdline parameters.
    pub fn kernel_params() -> [KernelParam],
    section = "orion_kernel_params"
}

/// Splits a cmdline into `(key, value)` pairs.
///
/// Values may be double-quoted to contain spaces; a bare key yields an
/// empty value. Returns pairs in order of appearance.
fn pairs(cmdline: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut rest = cmdline.trim();
    core::iter::from_fn(move || {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }

        let (token, remainder) = match rest.find('=') {
            Some(eq) if rest[..eq].find(char::is_whitespace).is_none() => {
                let key = &rest[..eq];
                let after = &rest[eq + 1..];
                if let Some(stripped) = after.strip_prefix('"') {
                    // Quoted value: scan to the closing quote.
                    match stripped.find('"') {
                        Some(close) => {
                            ((key, &stripped[..close]), &stripped[close + 1..])
                        }
                        None => ((key, stripped), ""),
                    }
                } else {
                    let end = after.find(char::is_whitespace).unwrap_or(after.len());
                    ((key, &after[..end]), &after[end..])
                }
            }
            _ => {
                // Bare key without a value.
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                ((&rest[..end], ""), &rest[end..])
            }
        };
        rest = remainder;
        Some(token)
    })
}

/// Parses a boolean value token.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "" | "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Parses an integer value token (decimal, or hex with a `0x` prefix).
fn parse_int(value: &str) -> Option<i64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Applies the boot cmdline to the given parameter registrations.
///
/// The cmdline must outlive the kernel (string parameters keep slices of
/// it). Unknown keys and malformed values warn.
pub fn parse_cmdline(cmdline: &'static str, params: &[KernelParam]) {
    for (key, value) in pairs(cmdline) {
        let Some(param) = params.iter().find(|p| p.name == key) else {
            crate::kwarn!("cmdline: unknown parameter '{key}'");
            continue;
        };
        match &param.target {
            ParamTarget::Str(slot) => {
                *slot.lock() = Some(value);
            }
            ParamTarget::Int(slot) => match parse_int(value) {
                Some(v) => slot.store(v, Ordering::Relaxed),
                None => crate::kwarn!("cmdline: malformed integer '{value}' for '{key}'"),
            },
            ParamTarget::Bool(slot) => match parse_bool(value) {
                Some(v) => slot.store(v, Ordering::Relaxed),
                None => crate::kwarn!("cmdline: malformed boolean '{value}' for '{key}'"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_splitting() {
        let got: Vec<_> = pairs("a=1  b=two c").collect();
        assert_eq!(got, vec![("a", "1"), ("b", "two"), ("c", "")]);
    }

    #[test]
    fn quoted_values() {
        let got: Vec<_> = pairs(r#"root=/dev/hda1 init="/bin/init --verbose" quiet"#).collect();
        assert_eq!(
            got,
            vec![("root", "/dev/hda1"), ("init", "/bin/init --verbose"), ("quiet", "")]
        );
    }

    #[test]
    fn int_and_bool_parsing() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int("0x1000"), Some(0x1000));
        assert_eq!(parse_int("nope"), None);

        assert_eq!(parse_bool(""), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn applies_to_targets() {
        static STR_SLOT: SpinMutex<Option<&'static str>> = SpinMutex::new(None);
        static INT_SLOT: AtomicI64 = AtomicI64::new(0);
        static BOOL_SLOT: AtomicBool = AtomicBool::new(false);

        let params = [
            KernelParam { name: "root", target: ParamTarget::Str(&STR_SLOT) },
            KernelParam { name: "loglevel", target: ParamTarget::Int(&INT_SLOT) },
            KernelParam { name: "smp", target: ParamTarget::Bool(&BOOL_SLOT) },
        ];
        parse_cmdline("root=/dev/hda1 loglevel=4 smp=on bogus=1", &params);

        assert_eq!(*STR_SLOT.lock(), Some("/dev/hda1"));
        assert_eq!(INT_SLOT.load(Ordering::Relaxed), 4);
        assert!(BOOL_SLOT.load(Ordering::Relaxed));
    }

    #[test]
    fn malformed_values_leave_defaults() {
        static INT_SLOT: AtomicI64 = AtomicI64::new(9);
        let params = [KernelParam { name: "n", target: ParamTarget::Int(&INT_SLOT) }];
        parse_cmdline("n=twelve", &params);
        assert_eq!(INT_SLOT.load(Ordering::Relaxed), 9);
    }
}
