//! Panic backtraces.
//!
//! Invariant violations are fatal: the panic handler prints the message,
//! walks the frame-pointer chain resolving return addresses through the
//! embedded `.debug_line` data, halts the other CPUs with a panic IPI,
//! and parks this one.

use core::sync::atomic::{AtomicBool, Ordering};

use orion_dwarf::LineTable;

orion_linkset::declare_linkset_blob! {
    /// The `.debug_line` data the image tool embeds for PC resolution.
    fn lineinfo_data() -> &[u8],
    section = "orion_lineinfo"
}

/// Guards against recursive panics.
static IN_PANIC: AtomicBool = AtomicBool::new(false);

/// Maximum frames printed.
const MAX_FRAMES: usize = 32;

/// Walks the frame-pointer chain from the current frame.
fn walk_frames(mut f: impl FnMut(u64)) {
    let mut rbp: u64;
    // SAFETY: Reading rbp is side-effect free; the kernel builds with
    // frame pointers so the chain is intact.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
    }
    for _ in 0..MAX_FRAMES {
        if rbp == 0 || !crate::addr::VirtAddr::new_truncate(rbp).is_kernel() {
            break;
        }
        // SAFETY: A non-null kernel rbp points at [saved rbp][return rip].
        let (next, ret) = unsafe {
            ((rbp as *const u64).read(), (rbp as *const u64).add(1).read())
        };
        if ret == 0 {
            break;
        }
        f(ret);
        rbp = next;
    }
}

/// Prints the backtrace from the current frame.
pub fn print_backtrace() {
    let table = LineTable::new(lineinfo_data());
    let mut depth = 0;
    walk_frames(|ret| {
        match table.lookup(ret) {
            Some(pos) => {
                crate::kprintln!("  #{depth}: {ret:#018x} at {}:{}", pos.file, pos.line);
            }
            None => crate::kprintln!("  #{depth}: {ret:#018x}"),
        }
        depth += 1;
    });
    if depth == 0 {
        crate::kprintln!("  (no frames)");
    }
}

/// The kernel panic handler.
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    // A panic inside the panic path just halts.
    if IN_PANIC.swap(true, Ordering::AcqRel) {
        crate::arch::halt_forever();
    }

    crate::kprintln!();
    crate::kfatal!("kernel panic on cpu {}: {}", crate::percpu::current_cpu().id().as_u32(), info);
    print_backtrace();

    // Halt everyone else, then this CPU.
    crate::ipi::send_panic(None);
    crate::arch::halt_forever();
}
