//! Typed access to linker-section collections.
//!
//! Several kernel registries (boot cmdline parameters, per-CPU init phases,
//! filesystem types, device drivers, boot tests) are populated by scattering
//! static entries into a named linker section and walking the section as a
//! slice at runtime. This crate wraps the two unsafe halves of that pattern
//! behind declarative macros:
//!
//! - [`declare_linkset!`] declares a function returning a typed
//!   `&'static [T]` bounded by the `__<section>_start` / `__<section>_end`
//!   symbols the linker script defines.
//! - [`linkset_entry!`] places a typed static into the matching section.
//! - [`declare_linkset_blob!`] is the untyped variant for binary blobs
//!   (e.g. embedded line-number data consumed by the backtrace printer).

#![no_std]
#![warn(missing_docs)]

/// Declares a function that returns a typed slice from a linker section.
///
/// The linker script must define `__<section>_start` and `__<section>_end`
/// symbols bounding the section, and the section may only contain values of
/// type `T` placed there by [`linkset_entry!`].
///
/// # Examples
///
/// ```ignore
/// orion_linkset::declare_linkset! {
///     /// Returns all registered boot cmdline parameters.
///     pub fn kernel_params() -> [KernelParam],
///     section = "orion_kernel_params"
/// }
/// ```
#[macro_export]
macro_rules! declare_linkset {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident() -> [$ty:ty],
        section = $section:literal
    ) => {
        $(#[$meta])*
        $vis fn $name() -> &'static [$ty] {
            unsafe extern "C" {
                #[link_name = concat!("__", $section, "_start")]
                static LINKSET_START: u8;
                #[link_name = concat!("__", $section, "_end")]
                static LINKSET_END: u8;
            }

            // SAFETY: The linker script defines these symbols at the
            // boundaries of the named section. The section contains only `T`
            // values placed by `linkset_entry!`, and the symbols remain valid
            // for the lifetime of the kernel image.
            unsafe {
                let start = ::core::ptr::addr_of!(LINKSET_START).cast::<$ty>();
                let end = ::core::ptr::addr_of!(LINKSET_END).cast::<$ty>();
                let count = end.offset_from(start) as usize;
                if count == 0 {
                    return &[];
                }
                ::core::slice::from_raw_parts(start, count)
            }
        }
    };
}

/// Places a typed static into the named linker section.
///
/// The section name must match a [`declare_linkset!`] declaration; the
/// entry becomes visible through the declared accessor with no further
/// registration step.
///
/// # Examples
///
/// ```ignore
/// orion_linkset::linkset_entry!("orion_fs_types",
///     RAMFS_TYPE: FsTypeEntry = FsTypeEntry { name: "ramfs", .. }
/// );
/// ```
#[macro_export]
macro_rules! linkset_entry {
    ($section:literal, $(#[$meta:meta])* $name:ident : $ty:ty = $expr:expr) => {
        $(#[$meta])*
        #[used]
        #[unsafe(link_section = concat!(".", $section))]
        static $name: $ty = $expr;
    };
}

/// Declares a function that returns a raw byte slice from a linker section.
///
/// For sections holding untyped bytes rather than an array of entries.
///
/// # Examples
///
/// ```ignore
/// orion_linkset::declare_linkset_blob! {
///     /// Returns the embedded line-number data.
///     pub fn lineinfo_data() -> &[u8],
///     section = "orion_lineinfo"
/// }
/// ```
#[macro_export]
macro_rules! declare_linkset_blob {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident() -> &[u8],
        section = $section:literal
    ) => {
        $(#[$meta])*
        $vis fn $name() -> &'static [u8] {
            unsafe extern "C" {
                #[link_name = concat!("__", $section, "_start")]
                static LINKSET_START: u8;
                #[link_name = concat!("__", $section, "_end")]
                static LINKSET_END: u8;
            }

            // SAFETY: The linker script defines these symbols at the
            // boundaries of the named section. The region is contiguous,
            // immutable, and valid for the lifetime of the kernel image.
            unsafe {
                let start = ::core::ptr::addr_of!(LINKSET_START);
                let end = ::core::ptr::addr_of!(LINKSET_END);
                let size = end.offset_from(start) as usize;
                if size == 0 {
                    return &[];
                }
                ::core::slice::from_raw_parts(start, size)
            }
        }
    };
}
