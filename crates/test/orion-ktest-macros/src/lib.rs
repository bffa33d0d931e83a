//! Proc-macro crate for the `#[kernel_test(...)]` attribute.
//!
//! Generates linkset entries for kernel test descriptors, enabling staged
//! test execution during kernel boot.

mod codegen;
mod parse;

use proc_macro::TokenStream;
use syn::parse_macro_input;

use parse::KernelTestDef;

/// Marks a function as a kernel test, collected via linker sections.
///
/// # Stages
///
/// - `early_boot` (default) — after frame allocator, VMM, and heap init
/// - `before_sched` — after IRQ, clock, VFS, device, and logging init
/// - `with_sched` — runs in its own kernel thread under the scheduler
/// - `userspace` — runs with full kernel including userspace support
///
/// # Examples
///
/// ```ignore
/// #[kernel_test]
/// fn heap_alloc_roundtrip() {
///     let b = alloc::boxed::Box::new(42u64);
///     assert_eq!(*b, 42);
/// }
///
/// #[kernel_test(stage = "with_sched", timeout = 10)]
/// fn sleep_wakes_up() {
///     // runs in a spawned kernel thread
/// }
/// ```
#[proc_macro_attribute]
pub fn kernel_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let def = parse_macro_input!(attr as KernelTestDef);
    let func = parse_macro_input!(item as syn::ItemFn);

    match codegen::generate(&def, &func) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}
