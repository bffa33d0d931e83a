//! Boot information and the phased bring-up.
//!
//! The UEFI loader enters the kernel with a `boot_info_v2` blob. Init
//! runs in three phases: **early** (single-threaded: frame allocator,
//! kernel address space, heap), **static** (IRQ/ACPI/clock/alarm, the
//! cmdline, per-CPU data, the scheduler and idle thread), and
//! **module** (inside the root kernel thread: VFS mounts, the device
//! subsystem and devfs population thread, TTY console, and finally the
//! user init process).

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::addr::{KERNEL_SPACE_START, PhysAddr, VirtAddr};
use crate::mm::frames::PhysAllocator;
use crate::mm::pool::Pool;
use crate::mm::vmm::{AddressSpace, VmFlags};
use crate::percpu::CpuId;
use crate::sync::SpinMutex;

// ---------------------------------------------------------------------------
// boot_info_v2
// ---------------------------------------------------------------------------

/// Memory map entry types in the boot blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryKind {
    /// Unclassified.
    Unknown = 0,
    /// Known-bad memory.
    Unusable = 1,
    /// Free RAM.
    Usable = 2,
    /// Firmware-reserved.
    Reserved = 3,
    /// ACPI tables (reclaimable after parsing).
    Acpi = 4,
    /// ACPI non-volatile storage.
    AcpiNvs = 5,
    /// Memory-mapped I/O.
    MappedIo = 6,
    /// UEFI runtime services code.
    EfiRuntimeCode = 7,
    /// UEFI runtime services data.
    EfiRuntimeData = 8,
}

/// One memory map entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMapEntry {
    /// Physical base.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
    /// Entry type.
    pub kind: MemoryKind,
    /// Padding to 8-byte layout.
    pub _pad: u32,
}

/// The handoff blob from the UEFI loader.
#[derive(Debug)]
#[repr(C)]
pub struct BootInfoV2 {
    /// Blob magic (`0xB007_1F02`).
    pub magic: u32,
    /// Number of CPUs the loader counted.
    pub cpu_count: u32,
    /// Physical address of the kernel image.
    pub kernel_phys: u64,
    /// Size of the kernel image.
    pub kernel_size: u64,
    /// Physical address of the boot PML4.
    pub pml4_phys: u64,
    /// Memory map pointer (physical, covered by the boot mapping).
    pub memory_map: u64,
    /// Number of memory map entries.
    pub memory_map_len: u64,
    /// ACPI RSDP physical address (0 when absent).
    pub rsdp: u64,
    /// Framebuffer base.
    pub fb_base: u64,
    /// Framebuffer width in pixels.
    pub fb_width: u32,
    /// Framebuffer height in pixels.
    pub fb_height: u32,
    /// Framebuffer size in bytes.
    pub fb_size: u64,
    /// Initrd physical base (0 when absent).
    pub initrd_base: u64,
    /// Initrd size.
    pub initrd_size: u64,
    /// Kernel cmdline pointer (physical).
    pub cmdline: u64,
    /// Cmdline length.
    pub cmdline_len: u64,
}

/// Blob magic value.
pub const BOOT_INFO_MAGIC: u32 = 0xB007_1F02;

impl BootInfoV2 {
    /// The memory map as a slice.
    ///
    /// # Safety
    ///
    /// The blob must describe a live boot mapping.
    #[must_use]
    pub unsafe fn memory_map(&self) -> &[MemoryMapEntry] {
        let virt = crate::mm::highmem::phys_to_virt(PhysAddr::new(self.memory_map));
        // SAFETY: Forwarded caller contract.
        unsafe {
            core::slice::from_raw_parts(virt.as_ptr(), self.memory_map_len as usize)
        }
    }

    /// The cmdline as a string.
    ///
    /// # Safety
    ///
    /// As for [`BootInfoV2::memory_map`].
    #[must_use]
    pub unsafe fn cmdline_str(&self) -> &'static str {
        if self.cmdline == 0 || self.cmdline_len == 0 {
            return "";
        }
        let virt = crate::mm::highmem::phys_to_virt(PhysAddr::new(self.cmdline));
        // SAFETY: Forwarded caller contract.
        let bytes = unsafe {
            core::slice::from_raw_parts(virt.as_ptr::<u8>(), self.cmdline_len as usize)
        };
        core::str::from_utf8(bytes).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Global boot-owned state
// ---------------------------------------------------------------------------

/// The kernel heap window, page-aligned and linker-reserved in `.bss`.
#[repr(align(4096))]
struct HeapWindow([u8; crate::config::KERNEL_HEAP_SIZE as usize]);

static mut KHEAP_WINDOW: HeapWindow = HeapWindow([0; crate::config::KERNEL_HEAP_SIZE as usize]);

static KERNEL_SPACE: SpinMutex<Option<Arc<AddressSpace>>> =
    SpinMutex::named("KERNEL_SPACE", None);

/// The shared kernel address space.
///
/// # Panics
///
/// Panics before `kernel_init` created it.
pub fn kernel_space_arc() -> Arc<AddressSpace> {
    KERNEL_SPACE.lock().clone().expect("kernel space not initialized")
}

/// Convenience accessor returning a leaked reference.
pub fn kernel_space() -> Arc<AddressSpace> {
    kernel_space_arc()
}

static STACK_POOL: SpinMutex<Option<Arc<Pool>>> = SpinMutex::named("STACK_POOL", None);

/// The kernel-thread stack pool.
///
/// # Panics
///
/// Panics before the heap phase created it.
pub fn kernel_stack_pool() -> Arc<Pool> {
    STACK_POOL.lock().clone().expect("stack pool not initialized")
}

/// APIC ids by logical CPU (from the MADT).
static APIC_IDS: SpinMutex<Vec<u32>> = SpinMutex::named("APIC_IDS", Vec::new());

/// The APIC id of a logical CPU.
#[must_use]
pub fn apic_id_of(cpu: CpuId) -> u32 {
    APIC_IDS.lock().get(cpu.as_usize()).copied().unwrap_or(0)
}

/// ACPI physical-memory access through the direct window.
struct WindowHandler;

// SAFETY: All of physical memory is covered by the direct window.
unsafe impl orion_acpi::AcpiHandler for WindowHandler {
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
        let virt = crate::mm::highmem::phys_to_virt(PhysAddr::new(phys));
        // SAFETY: Forwarded from the trait contract.
        unsafe { core::slice::from_raw_parts(virt.as_ptr(), size) }
    }
}

// ---------------------------------------------------------------------------
// Cmdline parameters
// ---------------------------------------------------------------------------

static PARAM_ROOT_FS: SpinMutex<Option<&'static str>> = SpinMutex::new(None);
static PARAM_INIT_PATH: SpinMutex<Option<&'static str>> = SpinMutex::new(None);

orion_linkset::linkset_entry!("orion_kernel_params",
    ROOTFS_PARAM: crate::config::KernelParam = crate::config::KernelParam {
        name: "rootfstype",
        target: crate::config::ParamTarget::Str(&PARAM_ROOT_FS),
    }
);

orion_linkset::linkset_entry!("orion_kernel_params",
    INIT_PARAM: crate::config::KernelParam = crate::config::KernelParam {
        name: "init",
        target: crate::config::ParamTarget::Str(&PARAM_INIT_PATH),
    }
);

// ---------------------------------------------------------------------------
// The bring-up
// ---------------------------------------------------------------------------

/// Kernel entry: runs early- and static-init, then becomes the root
/// kernel thread and runs module-init.
///
/// # Safety
///
/// `boot_info` must be a valid `boot_info_v2` blob from the loader, and
/// the boot page tables must map all physical memory at the kernel-half
/// base.
pub unsafe extern "C" fn kernel_init(boot_info: &'static BootInfoV2) -> ! {
    assert_eq!(boot_info.magic, BOOT_INFO_MAGIC, "bad boot_info magic");

    // ── Early init (single-threaded) ────────────────────────────────
    crate::arch::cpu_init();
    // SAFETY: GDT is loaded; nothing touched per-CPU data yet.
    unsafe { crate::percpu::init_gs_base() };
    crate::percpu::current_cpu().init(CpuId::new(0), 0);

    crate::drivers::uart16550::init_early_log();
    crate::kinfo!("orion: early init");

    crate::mm::highmem::init(KERNEL_SPACE_START);

    // The heap window is linker-reserved in the image so the frame
    // allocator's own bookkeeping can allocate from the first moment.
    // SAFETY: The window is ours alone and the linker made it writable.
    unsafe {
        crate::mm::heap::init(
            core::ptr::addr_of_mut!(KHEAP_WINDOW) as usize,
            crate::config::KERNEL_HEAP_SIZE as usize,
        );
    }
    crate::kinfo!(
        "heap: {} KiB at {:p}",
        crate::config::KERNEL_HEAP_SIZE / 1024,
        core::ptr::addr_of!(KHEAP_WINDOW)
    );

    // Frame allocator from the boot memory map.
    let pmm = PhysAllocator::new();
    // SAFETY: The blob and boot mapping are live per the entry contract.
    for entry in unsafe { boot_info.memory_map() } {
        if entry.kind == MemoryKind::Usable {
            pmm.add_usable_range(PhysAddr::new(entry.base), entry.size);
        }
    }
    crate::mm::frames::init(pmm);
    crate::mm::frames::with_pmm(|pmm| {
        crate::kinfo!("pmm: {} MiB free", pmm.free_pages() * 4 / 1024);
    });

    // The shared kernel address space over the boot PML4, with the fixed
    // windows recorded as reservations.
    let root = PhysAddr::new(boot_info.pml4_phys);
    let mapper = crate::arch::x86_64::paging::PageTableMapper::new(root);
    let kspace = Arc::new(AddressSpace::new_kernel(root, Box::new(mapper)));
    *KERNEL_SPACE.lock() = Some(kspace.clone());
    let _ = kspace.vmap_rsvd(
        VirtAddr::new_truncate(core::ptr::addr_of!(KHEAP_WINDOW) as u64),
        crate::config::KERNEL_HEAP_SIZE,
        VmFlags::READ | VmFlags::WRITE | VmFlags::FIXED,
        "kheap",
    );

    // Object pools (heap is up, so Arc/Vec work from here on).
    *STACK_POOL.lock() = Some(Arc::new(Pool::new(
        "kstack",
        &[crate::config::KERNEL_STACK_SIZE as usize],
        Arc::new(crate::mm::pool::VmapBacking),
    )));
    crate::log::init_logger();
    crate::log::add_sink(Box::new(crate::drivers::uart16550::SerialSink::com1()));

    // ── Static init (BSP once) ──────────────────────────────────────
    crate::irq::init();
    crate::arch::x86_64::pic::remap_and_mask();

    let mut bsp_apic = 0;
    if boot_info.rsdp != 0 {
        match orion_acpi::AcpiTables::new(boot_info.rsdp, WindowHandler) {
            Ok(tables) => bsp_apic = static_init_acpi(&tables),
            Err(e) => crate::kwarn!("acpi: bad RSDP: {e:?}"),
        }
    } else {
        crate::kwarn!("acpi: no RSDP in boot info");
    }
    crate::percpu::current_cpu().init(CpuId::new(0), bsp_apic);

    // Clock sources + election, then the tickless alarm source.
    crate::time::clock::register_source(Arc::new(
        crate::arch::x86_64::tsc::Tsc::calibrate(),
    ));
    crate::time::clock::init_clock();
    crate::arch::x86_64::lapic::calibrate_timer();
    crate::time::alarm::init_source(Arc::new(crate::arch::x86_64::lapic::LapicTimer));

    // SAFETY: The cmdline stays mapped for the kernel's lifetime.
    let cmdline = unsafe { boot_info.cmdline_str() };
    crate::config::parse_cmdline(cmdline, crate::config::kernel_params());

    for entry in crate::percpu::percpu_early_init_entries() {
        (entry.func)();
    }
    for entry in crate::percpu::static_init_entries() {
        crate::kdebug!("static-init: {}", entry.name);
        (entry.func)();
    }

    crate::percpu::set_cpu_count(boot_info.cpu_count.max(1));
    crate::proc::set_space_factory(user_space_factory);

    // The executing context becomes the root kernel thread; preemption
    // starts with the idle thread in place.
    let boot_thread = crate::proc::Thread::adopt_current("kmain");
    let idle = crate::proc::Thread::new_kernel("idle", idle_loop, 0).expect("idle thread");
    idle.set_priority(0);
    crate::sched::init_cpu(boot_thread, idle);
    crate::sched::start_tick();

    // SAFETY: IDT, LAPIC, and IOAPIC are programmed.
    unsafe { crate::arch::x86_64::enable_interrupts() };

    #[cfg(ktest)]
    crate::ktest::run_stage(orion_ktest::TestStage::EarlyBoot);

    // ── Module init (the root kernel thread) ────────────────────────
    module_init(boot_info);
}

/// Builds fresh user address-space parts over the kernel tables.
fn user_space_factory() -> Result<crate::proc::SpaceParts, crate::mm::vmm::VmError> {
    let kroot = kernel_space_arc().root_phys();
    let (root, mapper) = crate::arch::x86_64::paging::PageTableMapper::new_user(kroot)?;
    Ok((root, Box::new(mapper)))
}

/// ACPI static-init: MADT → LAPIC/IOAPIC, FADT → RTC epoch + PM timer.
/// Returns the BSP APIC id.
fn static_init_acpi(tables: &orion_acpi::AcpiTables<WindowHandler>) -> u32 {
    let mut bsp_apic = 0;
    match tables.madt() {
        Ok(madt) => {
            crate::arch::x86_64::lapic::init(PhysAddr::new(u64::from(madt.local_apic_address)));
            bsp_apic = crate::arch::x86_64::lapic::id();

            let mut apic_ids = Vec::new();
            for entry in madt.entries() {
                match entry {
                    orion_acpi::MadtEntry::LocalApic { apic_id, flags, .. } => {
                        if flags & 1 != 0 {
                            apic_ids.push(u32::from(apic_id));
                        }
                    }
                    orion_acpi::MadtEntry::IoApic { io_apic_address, gsi_base, .. } => {
                        crate::arch::x86_64::ioapic::init(
                            PhysAddr::new(u64::from(io_apic_address)),
                            gsi_base,
                        );
                    }
                    orion_acpi::MadtEntry::InterruptSourceOverride { source, gsi, .. } => {
                        crate::arch::x86_64::ioapic::set_override(source, gsi);
                    }
                    _ => {}
                }
            }
            crate::kinfo!("acpi: {} CPUs in MADT", apic_ids.len());
            *APIC_IDS.lock() = apic_ids;
        }
        Err(e) => crate::kwarn!("acpi: no MADT: {e:?}"),
    }

    match tables.fadt() {
        Ok(fadt) => {
            let epoch = crate::arch::x86_64::rtc::read_boot_epoch(fadt.century);
            crate::time::clock::set_boot_epoch(epoch);
            if let Some(port) = fadt.pm_timer_block {
                crate::time::clock::register_source(Arc::new(
                    crate::arch::x86_64::pmtimer::PmTimer::new(port, fadt.pm_timer_32bit),
                ));
            }
        }
        Err(e) => crate::kwarn!("acpi: no FADT: {e:?}"),
    }
    bsp_apic
}

/// Module-init inside the root kernel thread: filesystems, devices, the
/// console, boot tests, and finally the user init process.
fn module_init(boot_info: &'static BootInfoV2) -> ! {
    for entry in crate::percpu::module_init_entries() {
        crate::kdebug!("module-init: {}", entry.name);
        (entry.func)();
    }

    // Root filesystem: the cmdline picks the type; initrd by default
    // when the loader provided one.
    let default_root = if boot_info.initrd_base != 0 { "initrd" } else { "ramfs" };
    let rootfs_name = PARAM_ROOT_FS.lock().unwrap_or(default_root);
    match crate::fs::find_fs_type(rootfs_name) {
        Some(fstype) => {
            crate::fs::vfs::mount_root(fstype).expect("failed to mount the root filesystem");
        }
        None => crate::kwarn!("vfs: no '{rootfs_name}' filesystem registered"),
    }

    // devfs at /dev, populated by its own kernel thread.
    if let Some(root) = crate::fs::vfs::root_ventry() {
        if let Some(devfs) = crate::fs::find_fs_type("devfs") {
            let dev_ve = match crate::fs::vresolve(&root, "/dev", crate::fs::VrFlags::DIR) {
                Ok(crate::fs::Resolved::Found(ve)) => Some(ve),
                _ => root
                    .vnode()
                    .ok()
                    .and_then(|vn| vn.mkdir("dev", 0o755).ok())
                    .map(|vn| {
                        let ve = crate::fs::Ventry::alloc_linked("dev", &vn);
                        root.add_child(&ve);
                        ve
                    }),
            };
            if let Some(dev_ve) = dev_ve {
                match crate::fs::vfs::mount_at(&dev_ve, devfs) {
                    Ok(_) => {
                        let td = crate::proc::Thread::new_kernel("devfsd", devfs_thread, 0)
                            .expect("devfs thread");
                        crate::sched::submit(td);
                    }
                    Err(e) => crate::kwarn!("vfs: devfs mount failed: {e}"),
                }
            }
        }
    }

    // The reaper collects dead threads from here on.
    let reaper = crate::proc::Thread::new_kernel("reaper", |_| crate::proc::reaper_loop(), 0)
        .expect("reaper thread");
    reaper.set_policy(crate::sched::PolicyKind::Driver);
    crate::sched::submit(reaper);

    // Console TTY over COM1.
    let console = crate::tty::Tty::new();
    console.set_driver(Arc::new(crate::drivers::uart16550::Com1TtyDriver));
    crate::dev::register_class(crate::dev::DeviceClass {
        major: crate::drivers::CONSOLE_MAJOR,
        minor: Some(0),
        prefix: "console",
        scheme: crate::dev::NameScheme::Numbered,
    });
    crate::dev::register_device(
        crate::dev::DeviceKind::Char,
        crate::drivers::CONSOLE_MAJOR,
        Box::new(crate::drivers::ConsoleDevice::new(console)),
        "console",
    );

    #[cfg(ktest)]
    {
        crate::ktest::run_stage(orion_ktest::TestStage::BeforeSched);
        crate::ktest::run_stage(orion_ktest::TestStage::WithSched);
        crate::ktest::run_stage(orion_ktest::TestStage::Userspace);
        crate::ktest::finish();
    }

    // Hand off to userspace.
    let init_path = PARAM_INIT_PATH.lock().unwrap_or("/sbin/init");
    crate::kinfo!("boot: starting {init_path}");
    spawn_user_init(init_path);

    // The root thread stays as the waitpid-of-last-resort.
    loop {
        match crate::proc::waitpid(crate::proc::WaitTarget::Any) {
            Ok((pid, status)) => crate::kinfo!("reaped orphan {pid} (status {status})"),
            Err(_) => crate::sched::yield_now(),
        }
    }
}

/// Creates the init process and sends its first thread into userspace.
fn spawn_user_init(path: &'static str) {
    let proc = crate::proc::Process::new_root();
    if let Some(root) = crate::fs::vfs::root_ventry() {
        *proc.cwd.lock() = Some(root);
    }

    *INIT_PATH.lock() = path;
    let td = crate::proc::Thread::new_kernel("init", init_entry, 0).expect("init thread");
    proc.adopt_thread(&td);
    crate::sched::submit(td);
}

static INIT_PATH: SpinMutex<&'static str> = SpinMutex::new("/sbin/init");

/// Runs as the init process's first thread: exec the user image.
fn init_entry(_arg: usize) {
    let path = *INIT_PATH.lock();
    match crate::proc::exec::exec_current(path, &[path], &[]) {
        Ok(image) => crate::arch::x86_64::userspace::enter_image(&image),
        Err(e) => panic!("failed to exec init: {e}"),
    }
}

/// The devfs population thread: consumes device events and creates the
/// matching `/dev` nodes.
fn devfs_thread(_arg: usize) {
    let Some(root) = crate::fs::vfs::root_ventry() else {
        return;
    };
    let Ok(crate::fs::Resolved::Found(dev_dir)) =
        crate::fs::vresolve(&root, "/dev", crate::fs::VrFlags::DIR)
    else {
        return;
    };

    loop {
        match crate::dev::next_event() {
            crate::dev::DeviceEvent::Added(device) => {
                for class in crate::dev::classes() {
                    let Some(name) = crate::dev::device_name(&class, device.id) else {
                        continue;
                    };
                    let vtype = match device.kind {
                        crate::dev::DeviceKind::Block => crate::fs::VnodeType::Blk,
                        crate::dev::DeviceKind::Char => crate::fs::VnodeType::Chr,
                    };
                    match dev_dir.vnode().and_then(|vn| vn.mknod(&name, vtype, device.id.rdev()))
                    {
                        Ok(_) => {
                            device.add_entry(&name);
                            crate::kinfo!("devfs: /dev/{name}");
                        }
                        Err(e) => crate::kwarn!("devfs: mknod {name}: {e}"),
                    }
                }
            }
            crate::dev::DeviceEvent::Removed(id) => {
                if let Some(device) = crate::dev::lookup(id) {
                    for name in device.entries() {
                        if let Ok(vn) = dev_dir.vnode() {
                            let _ = vn.unlink(&name);
                        }
                    }
                }
            }
        }
    }
}

/// The idle loop: halt until the next interrupt, reschedule after.
pub fn idle_loop(_arg: usize) {
    loop {
        // SAFETY: Interrupts wake the halt; the scheduler runs from the
        // interrupt-return path.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack));
        }
        crate::sched::yield_now();
    }
}
