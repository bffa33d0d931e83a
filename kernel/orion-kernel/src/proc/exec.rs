//! Program image loading.
//!
//! `exec` builds a fresh address space from an ELF64 image: `PT_LOAD`
//! segments become PAGE mappings whose file-backed pages come from the
//! file's page cache (text stays shared across execs); writable segments
//! take copy-on-write views; partial tail pages and BSS get private
//! zero-filled pages. A `PT_INTERP` image (the dynamic linker) is loaded
//! the same way at a fixed high base, and the initial user stack carries
//! `argv`, `envp`, and the auxiliary vector.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use orion_elf::{AT_ENTRY, AT_NULL, AT_PHDR, AT_PHENT, AT_PHNUM, ElfImage, PF_W, PF_X, PT_PHDR};
use orion_syscall::Errno;

use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::mm::frames::{self, Page, PageList};
use crate::mm::vmm::{AddressSpace, VmFlags};

/// Where `exec` gets the pages backing a file-mapped segment.
pub trait ImageSource {
    /// Returns the shared (page-cache) page at file offset `off`.
    fn cached_page(&self, off: u64) -> Result<Arc<Page>, Errno>;
    /// Returns a private page holding `file_bytes` bytes of file content
    /// from `off` with the remainder zero-filled.
    fn private_page(&self, off: u64, file_bytes: usize) -> Result<Arc<Page>, Errno>;
}

/// What the loader produced for one ELF image.
#[derive(Debug, Clone)]
pub struct LoadInfo {
    /// Entry point (biased by the load base for PIE images).
    pub entry: u64,
    /// Virtual address of the program header table (for `AT_PHDR`).
    pub phdr_vaddr: u64,
    /// Number of program headers.
    pub phnum: u16,
    /// Size of one program header entry.
    pub phent: u16,
    /// The `PT_INTERP` path, if the image wants a dynamic linker.
    pub interp: Option<String>,
}

/// Maps every `PT_LOAD` segment of `image` into `space` at `base` bias.
///
/// `data` is the raw file (for header parsing); segment pages come from
/// `source` so file-backed text is shared through the page cache.
pub fn load_elf(
    space: &AddressSpace,
    data: &[u8],
    source: &dyn ImageSource,
    base: u64,
) -> Result<LoadInfo, Errno> {
    let image = ElfImage::parse(data).map_err(|_| Errno::ENOEXEC)?;
    if image.header().is_pie() != (base != 0) && base != 0 {
        // An ET_EXEC interpreter would ignore the bias; refuse.
        return Err(Errno::ENOEXEC);
    }

    let mut phdr_vaddr = 0u64;
    for phdr in image.program_headers() {
        if phdr.p_type == PT_PHDR {
            phdr_vaddr = base + phdr.p_vaddr;
        }
    }

    for seg in image.load_segments() {
        let vaddr = base + seg.vaddr;
        let page_start = vaddr & !(PAGE_SIZE - 1);
        let head_pad = vaddr - page_start;
        let mem_len = head_pad + seg.memsz;
        let file_len = head_pad + seg.data.len() as u64;
        let page_count = mem_len.div_ceil(PAGE_SIZE);
        let full_file_pages = file_len / PAGE_SIZE;

        // File offset of the first byte of the first page.
        let file_page_off = seg.offset - head_pad;

        let writable = seg.flags & PF_W != 0;
        let mut pages: PageList = Vec::with_capacity(page_count as usize);
        for i in 0..page_count {
            let off = file_page_off + i * PAGE_SIZE;
            if i < full_file_pages && !writable {
                // Fully file-backed read-only page: share the cache page.
                pages.push(source.cached_page(off)?);
            } else {
                // Writable, partial, or BSS page: private copy.
                let file_bytes = file_len
                    .saturating_sub(i * PAGE_SIZE)
                    .min(PAGE_SIZE) as usize;
                pages.push(source.private_page(off, file_bytes)?);
            }
        }

        let mut flags = VmFlags::READ | VmFlags::FIXED | VmFlags::USER;
        if writable {
            flags |= VmFlags::WRITE;
        }
        if seg.flags & PF_X != 0 {
            flags |= VmFlags::EXEC;
        }

        space
            .vmap_pages(VirtAddr::new_truncate(page_start), pages, flags, "elf_segment")
            .map_err(|e| e.to_errno())?;
    }

    let interp = image.interpreter().map_err(|_| Errno::ENOEXEC)?.map(ToString::to_string);

    Ok(LoadInfo {
        entry: base + image.entry_point(),
        phdr_vaddr,
        phnum: image.header().e_phnum,
        phent: image.header().e_phentsize,
        interp,
    })
}

// ---------------------------------------------------------------------------
// Initial user stack
// ---------------------------------------------------------------------------

/// Size of the initial user stack.
pub const USER_STACK_SIZE: u64 = 64 * PAGE_SIZE;
/// Top of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_0000;

/// Builds the SysV process entry stack inside `buf`.
///
/// `buf` represents the top `buf.len()` bytes of the stack ending at
/// `stack_top`. Layout (growing down): strings, then padding to 16 bytes,
/// then `auxv` (terminated by `AT_NULL`), `envp` (NULL-terminated),
/// `argv` (NULL-terminated), and `argc` at the final stack pointer.
///
/// Returns the initial stack pointer.
pub fn build_user_stack(
    buf: &mut [u8],
    stack_top: u64,
    argv: &[&str],
    envp: &[&str],
    auxv: &[(u64, u64)],
) -> Result<u64, Errno> {
    let base = stack_top - buf.len() as u64;
    let mut cursor = buf.len();

    let mut push_str = |buf: &mut [u8], cursor: &mut usize, s: &str| -> Result<u64, Errno> {
        let bytes = s.as_bytes();
        if *cursor < bytes.len() + 1 {
            return Err(Errno::E2BIG);
        }
        *cursor -= bytes.len() + 1;
        buf[*cursor..*cursor + bytes.len()].copy_from_slice(bytes);
        buf[*cursor + bytes.len()] = 0;
        Ok(base + *cursor as u64)
    };

    // Strings first, from the top down.
    let mut env_ptrs = Vec::with_capacity(envp.len());
    for env in envp.iter().rev() {
        env_ptrs.push(push_str(buf, &mut cursor, env)?);
    }
    env_ptrs.reverse();
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        arg_ptrs.push(push_str(buf, &mut cursor, arg)?);
    }
    arg_ptrs.reverse();

    // Word-sized vectors below the strings.
    let words = 1                       // argc
        + arg_ptrs.len() + 1            // argv + NULL
        + env_ptrs.len() + 1            // envp + NULL
        + (auxv.len() + 1) * 2; // auxv pairs + AT_NULL
    let vec_bytes = words * 8;

    // Align the final stack pointer to 16 bytes.
    cursor &= !0xF;
    let mut sp = cursor
        .checked_sub(vec_bytes)
        .ok_or(Errno::E2BIG)?;
    sp &= !0xF;

    let mut write = |buf: &mut [u8], at: &mut usize, value: u64| {
        buf[*at..*at + 8].copy_from_slice(&value.to_le_bytes());
        *at += 8;
    };

    let mut at = sp;
    write(buf, &mut at, argv.len() as u64);
    for ptr in &arg_ptrs {
        write(buf, &mut at, *ptr);
    }
    write(buf, &mut at, 0);
    for ptr in &env_ptrs {
        write(buf, &mut at, *ptr);
    }
    write(buf, &mut at, 0);
    for (key, value) in auxv {
        write(buf, &mut at, *key);
        write(buf, &mut at, *value);
    }
    write(buf, &mut at, AT_NULL);
    write(buf, &mut at, 0);

    Ok(base + sp as u64)
}

/// The auxiliary vector for a loaded image.
#[must_use]
pub fn build_auxv(info: &LoadInfo) -> [(u64, u64); 4] {
    [
        (AT_PHDR, info.phdr_vaddr),
        (AT_PHENT, u64::from(info.phent)),
        (AT_PHNUM, u64::from(info.phnum)),
        (AT_ENTRY, info.entry),
    ]
}

// ---------------------------------------------------------------------------
// The exec operation proper
// ---------------------------------------------------------------------------

/// The pieces `exec` hands to the return-to-user path.
pub struct ExecImage {
    /// The fresh address space.
    pub space: Arc<AddressSpace>,
    /// Where execution starts (the interpreter's entry when present).
    pub entry: u64,
    /// Initial user stack pointer.
    pub stack_pointer: u64,
}

/// Replaces the current process image with the file at `path`.
///
/// Reads the image through the VFS, builds a new address space (main
/// image + optional interpreter at the fixed linker base), pushes the
/// entry stack, resets caught signal actions, and swaps the space into
/// the process. The caller (the syscall layer) never returns to the old
/// image.
pub fn exec_current(path: &str, argv: &[&str], envp: &[&str]) -> Result<ExecImage, Errno> {
    let proc = crate::sched::current_process().ok_or(Errno::ESRCH)?;

    let file = crate::fs::kopen(path, orion_syscall::flags::OpenFlags::O_RDONLY)?;
    let data = crate::fs::read_whole(&file)?;

    let space = Arc::new(super::new_user_space()?);
    let source = crate::fs::FileImageSource::new(&file);
    let info = load_elf(&space, &data, &source, 0)?;

    // The dynamic linker loads at the fixed high base.
    let entry = if let Some(interp_path) = &info.interp {
        let interp_file = crate::fs::kopen(interp_path, orion_syscall::flags::OpenFlags::O_RDONLY)?;
        let interp_data = crate::fs::read_whole(&interp_file)?;
        let interp_source = crate::fs::FileImageSource::new(&interp_file);
        let interp_info = load_elf(
            &space,
            &interp_data,
            &interp_source,
            crate::config::LIBC_BASE_ADDR,
        )?;
        interp_info.entry
    } else {
        info.entry
    };

    // Fresh stack: anon zero pages with a guard page below.
    let stack_pages = frames::with_pmm(|pmm| {
        pmm.alloc_pages_size(USER_STACK_SIZE / PAGE_SIZE, crate::mm::PageSize::Size4K)
    })
    .map_err(|_| Errno::ENOMEM)?;

    let mut stack_buf = alloc::vec![0u8; 0x4000];
    let auxv = build_auxv(&info);
    let sp = build_user_stack(&mut stack_buf, USER_STACK_TOP, argv, envp, &auxv)?;
    write_to_pages(&stack_pages, USER_STACK_SIZE - stack_buf.len() as u64, &stack_buf);

    space
        .vmap_pages(
            VirtAddr::new_truncate(USER_STACK_TOP - USER_STACK_SIZE),
            stack_pages,
            VmFlags::READ | VmFlags::WRITE | VmFlags::FIXED | VmFlags::STACK | VmFlags::USER,
            "stack",
        )
        .map_err(|e| e.to_errno())?;

    // The old image is gone: reset caught handlers, drop the old space.
    proc.signals.reset_caught_actions();
    let space_arc = space.clone();
    let _old = proc.set_space(Some(space_arc));
    proc.knotes.activate(orion_syscall::kevent::NOTE_EXEC);

    Ok(ExecImage { space, entry, stack_pointer: sp })
}

/// Copies `buf` into a page list at byte offset `off`.
#[cfg(target_os = "none")]
fn write_to_pages(pages: &PageList, off: u64, buf: &[u8]) {
    let mut remaining = buf;
    let mut cursor = off;
    for page in pages {
        let len = page.byte_len();
        if cursor >= len {
            cursor -= len;
            continue;
        }
        let take = remaining.len().min((len - cursor) as usize);
        // SAFETY: The pages were just allocated and are not yet mapped
        // anywhere else.
        let dst = unsafe {
            crate::mm::highmem::phys_slice_mut(page.address(), len as usize)
        };
        dst[cursor as usize..cursor as usize + take].copy_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        cursor = 0;
        if remaining.is_empty() {
            break;
        }
    }
}

/// Host builds have no physical window; the stack bytes are only used on
/// the target.
#[cfg(not(target_os = "none"))]
fn write_to_pages(_pages: &PageList, _off: u64, _buf: &[u8]) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;
    use crate::mm::PageSize;
    use crate::mm::frames::PhysAllocator;

    struct FakeSource;

    impl ImageSource for FakeSource {
        fn cached_page(&self, off: u64) -> Result<Arc<Page>, Errno> {
            // Distinct fake frames per offset so tests can tell them apart.
            Ok(PhysAllocator::new()
                .alloc_nonowned_pages_at(PhysAddr::new(0x100_0000 + off), 1, PageSize::Size4K)
                .unwrap()
                .pop()
                .unwrap())
        }

        fn private_page(&self, off: u64, _file_bytes: usize) -> Result<Arc<Page>, Errno> {
            Ok(PhysAllocator::new()
                .alloc_nonowned_pages_at(PhysAddr::new(0x200_0000 + off), 1, PageSize::Size4K)
                .unwrap()
                .pop()
                .unwrap())
        }
    }

    /// Builds an ELF with one RX text segment and one RW data+BSS segment.
    fn make_test_elf() -> Vec<u8> {
        use orion_elf::{PF_R, PT_LOAD};
        // Reuse the orion-elf test builder shape by hand: 64-byte header,
        // two phdrs, then segment data.
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // little-endian
        buf[6] = 1;
        buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        buf[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        buf[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        buf[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        buf[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        buf[56..58].copy_from_slice(&2u16.to_le_bytes()); // phnum

        let data_off = 64 + 2 * 56;
        let mut phdr = |p_type: u32, flags: u32, off: u64, vaddr: u64, filesz: u64, memsz: u64| {
            let mut e = vec![0u8; 56];
            e[0..4].copy_from_slice(&p_type.to_le_bytes());
            e[4..8].copy_from_slice(&flags.to_le_bytes());
            e[8..16].copy_from_slice(&off.to_le_bytes());
            e[16..24].copy_from_slice(&vaddr.to_le_bytes());
            e[32..40].copy_from_slice(&filesz.to_le_bytes());
            e[40..48].copy_from_slice(&memsz.to_le_bytes());
            e[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
            e
        };
        buf.extend_from_slice(&phdr(PT_LOAD, PF_R | PF_X, data_off as u64, 0x40_1000, 0x100, 0x100));
        buf.extend_from_slice(&phdr(
            PT_LOAD,
            PF_R | PF_W,
            data_off as u64 + 0x100,
            0x60_0000,
            0x80,
            0x2000, // BSS tail
        ));
        buf.resize(data_off + 0x180, 0xAA);
        buf
    }

    fn shadow_space() -> AddressSpace {
        crate::mm::vmm::test_support::user_space_with_shadow().0
    }

    #[test]
    fn load_elf_maps_segments() {
        let space = shadow_space();
        let info = load_elf(&space, &make_test_elf(), &FakeSource, 0).expect("load");
        assert_eq!(info.entry, 0x40_1000);
        assert!(info.interp.is_none());

        // Text mapped read-exec at its page base.
        let (name, start, _, _, flags) =
            space.get_mapping(VirtAddr::new(0x40_1000)).expect("text mapping");
        assert_eq!(name, "elf_segment");
        assert_eq!(start.as_u64(), 0x40_1000);
        assert!(flags.contains(VmFlags::EXEC));
        assert!(!flags.contains(VmFlags::WRITE));

        // Data+BSS mapped writable and spanning the zero tail.
        let (_, dstart, dsize, _, dflags) =
            space.get_mapping(VirtAddr::new(0x60_0000)).expect("data mapping");
        assert_eq!(dstart.as_u64(), 0x60_0000);
        assert!(dflags.contains(VmFlags::WRITE));
        assert_eq!(dsize, 0x2000);
    }

    #[test]
    fn writable_segments_use_private_pages() {
        let space = shadow_space();
        load_elf(&space, &make_test_elf(), &FakeSource, 0).expect("load");
        // The data page came from private_page (0x200_xxxx fake frames).
        let page = space.get_page(VirtAddr::new(0x60_0000)).expect("page");
        assert!(page.address().as_u64() >= 0x200_0000);
        // The text page came from the cache (0x100_xxxx fake frames).
        let page = space.get_page(VirtAddr::new(0x40_1000)).expect("page");
        assert!(page.address().as_u64() < 0x200_0000);
    }

    #[test]
    fn stack_layout_sysv() {
        let mut buf = vec![0u8; 0x1000];
        let top = 0x7FFF_0000u64;
        let sp = build_user_stack(
            &mut buf,
            top,
            &["/bin/init", "-v"],
            &["TERM=orion"],
            &[(AT_ENTRY, 0x40_1000)],
        )
        .expect("stack");

        assert_eq!(sp % 16, 0);
        let base = top - buf.len() as u64;
        let at = (sp - base) as usize;
        let word = |i: usize| {
            u64::from_le_bytes(buf[at + i * 8..at + (i + 1) * 8].try_into().unwrap())
        };

        // argc, argv[0], argv[1], NULL.
        assert_eq!(word(0), 2);
        assert_ne!(word(1), 0);
        assert_ne!(word(2), 0);
        assert_eq!(word(3), 0);
        // envp[0], NULL.
        assert_ne!(word(4), 0);
        assert_eq!(word(5), 0);
        // auxv: AT_ENTRY pair then AT_NULL.
        assert_eq!(word(6), AT_ENTRY);
        assert_eq!(word(7), 0x40_1000);
        assert_eq!(word(8), AT_NULL);

        // argv[0] string content is reachable through its pointer.
        let argv0_off = (word(1) - base) as usize;
        assert_eq!(&buf[argv0_off..argv0_off + 9], b"/bin/init");
        assert_eq!(buf[argv0_off + 9], 0);
    }

    #[test]
    fn stack_overflow_is_e2big() {
        let mut buf = vec![0u8; 64];
        let result = build_user_stack(&mut buf, 0x7FFF_0000, &["x".repeat(100).as_str()], &[], &[]);
        assert_eq!(result.err(), Some(Errno::E2BIG));
    }
}
