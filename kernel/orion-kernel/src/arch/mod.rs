//! Architecture support.

pub mod x86_64;

pub use x86_64::{cpu_init, halt_forever};
