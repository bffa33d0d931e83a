//! Global descriptor table and TSS.
//!
//! One flat GDT shared by every CPU: null, kernel code/data, user
//! data/code (in sysret order), and a TSS per CPU carrying the RSP0
//! stack used on privilege transitions.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::MAX_CPUS;
use crate::percpu::CpuLocal;

/// Kernel code selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DS: u16 = 0x10;
/// User data selector (RPL 3).
pub const USER_DS: u16 = 0x18 | 3;
/// User code selector (RPL 3).
pub const USER_CS: u16 = 0x20 | 3;
/// TSS selector base (two GDT slots per CPU).
pub const TSS_BASE: u16 = 0x28;

#[repr(C, packed)]
struct TaskStateSegment {
    _reserved0: u32,
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb_offset: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<TaskStateSegment>() as u16,
        }
    }
}

/// Per-CPU TSS instances.
static TSS: CpuLocal<core::cell::UnsafeCell<TaskStateSegment>> =
    CpuLocal::new([const { core::cell::UnsafeCell::new(TaskStateSegment::new()) }; MAX_CPUS]);

/// The GDT: 5 fixed descriptors plus 2 TSS slots per CPU.
static GDT: [AtomicU64; 5 + MAX_CPUS * 2] = {
    const ZERO: AtomicU64 = AtomicU64::new(0);
    [ZERO; 5 + MAX_CPUS * 2]
};

/// 64-bit code, DPL 0.
const KERNEL_CODE_DESC: u64 = 0x00AF_9B00_0000_FFFF;
/// Data, DPL 0.
const KERNEL_DATA_DESC: u64 = 0x00CF_9300_0000_FFFF;
/// Data, DPL 3.
const USER_DATA_DESC: u64 = 0x00CF_F300_0000_FFFF;
/// 64-bit code, DPL 3.
const USER_CODE_DESC: u64 = 0x00AF_FB00_0000_FFFF;

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Loads the GDT and TSS on the current CPU.
pub fn init() {
    let cpu = crate::percpu::current_cpu().id().as_usize();

    GDT[1].store(KERNEL_CODE_DESC, Ordering::Relaxed);
    GDT[2].store(KERNEL_DATA_DESC, Ordering::Relaxed);
    GDT[3].store(USER_DATA_DESC, Ordering::Relaxed);
    GDT[4].store(USER_CODE_DESC, Ordering::Relaxed);

    // TSS descriptor (16 bytes) for this CPU.
    let tss_addr = TSS.get_for(crate::percpu::CpuId::new(cpu as u32)).get() as u64;
    let limit = (size_of::<TaskStateSegment>() - 1) as u64;
    let low = (limit & 0xFFFF)
        | ((tss_addr & 0xFF_FFFF) << 16)
        | (0x89 << 40) // present, type = available 64-bit TSS
        | ((limit & 0xF_0000) << 32)
        | ((tss_addr & 0xFF00_0000) << 32);
    let high = tss_addr >> 32;
    GDT[5 + cpu * 2].store(low, Ordering::Relaxed);
    GDT[5 + cpu * 2 + 1].store(high, Ordering::Relaxed);

    let pointer = DescriptorPointer {
        limit: (size_of_val(&GDT) - 1) as u16,
        base: GDT.as_ptr() as u64,
    };

    // SAFETY: The GDT is static and fully populated above; reloading
    // segments with matching selectors is safe.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "push {cs}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            ptr = in(reg) &pointer,
            cs = in(reg) u64::from(KERNEL_CS),
            ds = in(reg) u32::from(KERNEL_DS),
            tmp = out(reg) _,
        );
        core::arch::asm!(
            "ltr {sel:x}",
            sel = in(reg) TSS_BASE + (cpu as u16) * 16,
        );
    }
}

/// Points this CPU's TSS RSP0 at a kernel stack top.
///
/// # Safety
///
/// The stack must be mapped and unused by any other CPU.
pub unsafe fn set_tss_rsp0(stack_top: u64) {
    let tss = TSS.get().get();
    // SAFETY: Only this CPU writes its TSS.
    unsafe { (*tss).rsp0 = stack_top };
}
