//! ELF64 file and program header parsing.

use core::fmt;

/// ELF magic bytes: `\x7fELF`.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// ELF class: 64-bit.
const ELFCLASS64: u8 = 2;
/// ELF data encoding: little-endian.
const ELFDATA2LSB: u8 = 1;
/// ELF OS/ABI: System V.
const ELFOSABI_SYSV: u8 = 0;
/// ELF type: executable.
const ET_EXEC: u16 = 2;
/// ELF type: shared object (PIE / interpreter).
const ET_DYN: u16 = 3;
/// ELF machine: x86-64.
const EM_X86_64: u16 = 62;

/// Size of an ELF64 file header.
const ELF64_EHDR_SIZE: usize = 64;
/// Size of an ELF64 program header entry.
pub(crate) const ELF64_PHDR_SIZE: usize = 56;

pub(crate) fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(*data[off..].first_chunk().unwrap())
}

pub(crate) fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(*data[off..].first_chunk().unwrap())
}

pub(crate) fn le_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(*data[off..].first_chunk().unwrap())
}

/// Errors that can occur while parsing an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The file does not start with the ELF magic bytes.
    BadMagic,
    /// Not a 64-bit little-endian SYSV image for x86-64.
    UnsupportedFormat,
    /// The ELF type is not `ET_EXEC` or `ET_DYN`.
    UnsupportedType,
    /// The input data is too short for the declared structure.
    Truncated,
    /// A header offset or size is out of bounds.
    InvalidOffset,
    /// A `PT_INTERP` segment exists but holds no NUL-terminated path.
    BadInterpreter,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "invalid ELF magic bytes"),
            Self::UnsupportedFormat => write!(f, "not an ELF64 LE SYSV x86-64 image"),
            Self::UnsupportedType => write!(f, "unsupported ELF type (expected ET_EXEC or ET_DYN)"),
            Self::Truncated => write!(f, "input data truncated"),
            Self::InvalidOffset => write!(f, "invalid header offset or size"),
            Self::BadInterpreter => write!(f, "malformed PT_INTERP segment"),
        }
    }
}

/// Parsed ELF64 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// ELF type (`ET_EXEC` or `ET_DYN`).
    pub e_type: u16,
    /// Virtual address of the entry point.
    pub e_entry: u64,
    /// File offset of the program header table.
    pub e_phoff: u64,
    /// Size of each program header entry.
    pub e_phentsize: u16,
    /// Number of program header entries.
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Whether the image is position-independent.
    #[must_use]
    pub fn is_pie(&self) -> bool {
        self.e_type == ET_DYN
    }

    /// Parses and validates an ELF64 file header.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if the image is not an ELF64 little-endian SYSV
    /// x86-64 executable, or the program header table is out of bounds.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < ELF64_EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB || data[7] != ELFOSABI_SYSV {
            return Err(ElfError::UnsupportedFormat);
        }

        let e_type = le_u16(data, 16);
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(ElfError::UnsupportedType);
        }
        if le_u16(data, 18) != EM_X86_64 {
            return Err(ElfError::UnsupportedFormat);
        }

        let e_entry = le_u64(data, 24);
        let e_phoff = le_u64(data, 32);
        let e_phentsize = le_u16(data, 54);
        let e_phnum = le_u16(data, 56);

        if e_phnum > 0 && (e_phentsize as usize) < ELF64_PHDR_SIZE {
            return Err(ElfError::InvalidOffset);
        }
        let ph_end = e_phoff
            .checked_add(u64::from(e_phnum) * u64::from(e_phentsize))
            .ok_or(ElfError::InvalidOffset)?;
        if ph_end > data.len() as u64 {
            return Err(ElfError::InvalidOffset);
        }

        Ok(Self { e_type, e_entry, e_phoff, e_phentsize, e_phnum })
    }
}

/// Parsed ELF64 program header entry.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment type (`PT_*`).
    pub p_type: u32,
    /// Segment permission flags (`PF_*`).
    pub p_flags: u32,
    /// File offset of the segment data.
    pub p_offset: u64,
    /// Virtual address of the segment.
    pub p_vaddr: u64,
    /// Size of the segment data in the file.
    pub p_filesz: u64,
    /// Size of the segment in memory (≥ `p_filesz`; the tail is zero-filled).
    pub p_memsz: u64,
    /// Required alignment.
    pub p_align: u64,
}

impl ProgramHeader {
    /// Parses a program header entry at `file_offset`.
    ///
    /// The caller must ensure `file_offset + ELF64_PHDR_SIZE <= data.len()`.
    pub(crate) fn parse(data: &[u8], file_offset: usize) -> Self {
        let b = &data[file_offset..];
        Self {
            p_type: le_u32(b, 0),
            p_flags: le_u32(b, 4),
            p_offset: le_u64(b, 8),
            p_vaddr: le_u64(b, 16),
            // p_paddr at 24..32 is ignored
            p_filesz: le_u64(b, 32),
            p_memsz: le_u64(b, 40),
            p_align: le_u64(b, 48),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal valid ELF64 header: ET_EXEC, x86-64, entry 0x401000,
    /// phoff right after the header, no program headers.
    pub(crate) fn make_elf_header() -> Vec<u8> {
        let mut buf = vec![0u8; ELF64_EHDR_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1; // EV_CURRENT
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..32].copy_from_slice(&0x0040_1000u64.to_le_bytes());
        buf[32..40].copy_from_slice(&(ELF64_EHDR_SIZE as u64).to_le_bytes());
        buf[52..54].copy_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes());
        buf[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
        buf
    }

    /// Appends a program header and bumps `e_phnum`.
    pub(crate) fn append_phdr(
        buf: &mut Vec<u8>,
        p_type: u32,
        p_flags: u32,
        p_offset: u64,
        p_vaddr: u64,
        p_filesz: u64,
        p_memsz: u64,
    ) {
        let start = buf.len();
        buf.resize(start + ELF64_PHDR_SIZE, 0);
        let b = &mut buf[start..];
        b[0..4].copy_from_slice(&p_type.to_le_bytes());
        b[4..8].copy_from_slice(&p_flags.to_le_bytes());
        b[8..16].copy_from_slice(&p_offset.to_le_bytes());
        b[16..24].copy_from_slice(&p_vaddr.to_le_bytes());
        b[32..40].copy_from_slice(&p_filesz.to_le_bytes());
        b[40..48].copy_from_slice(&p_memsz.to_le_bytes());
        b[48..56].copy_from_slice(&0x1000u64.to_le_bytes());

        let phnum = le_u16(buf, 56) + 1;
        buf[56..58].copy_from_slice(&phnum.to_le_bytes());
    }

    #[test]
    fn parse_valid_header() {
        let buf = make_elf_header();
        let hdr = Elf64Header::parse(&buf).expect("valid header");
        assert_eq!(hdr.e_type, ET_EXEC);
        assert_eq!(hdr.e_entry, 0x0040_1000);
        assert_eq!(hdr.e_phnum, 0);
        assert!(!hdr.is_pie());
    }

    #[test]
    fn pie_detection() {
        let mut buf = make_elf_header();
        buf[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
        assert!(Elf64Header::parse(&buf).unwrap().is_pie());
    }

    #[test]
    fn reject_bad_magic() {
        let mut buf = make_elf_header();
        buf[0] = 0;
        assert_eq!(Elf64Header::parse(&buf), Err(ElfError::BadMagic));
    }

    #[test]
    fn reject_wrong_class_or_encoding() {
        let mut buf = make_elf_header();
        buf[4] = 1; // ELFCLASS32
        assert_eq!(Elf64Header::parse(&buf), Err(ElfError::UnsupportedFormat));

        let mut buf = make_elf_header();
        buf[5] = 2; // big-endian
        assert_eq!(Elf64Header::parse(&buf), Err(ElfError::UnsupportedFormat));
    }

    #[test]
    fn reject_relocatable_type() {
        let mut buf = make_elf_header();
        buf[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        assert_eq!(Elf64Header::parse(&buf), Err(ElfError::UnsupportedType));
    }

    #[test]
    fn reject_truncated() {
        assert_eq!(Elf64Header::parse(&[]), Err(ElfError::Truncated));
        assert_eq!(Elf64Header::parse(&[0u8; 32]), Err(ElfError::Truncated));
    }

    #[test]
    fn reject_phdr_table_out_of_bounds() {
        let mut buf = make_elf_header();
        buf[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum=1, no data
        assert_eq!(Elf64Header::parse(&buf), Err(ElfError::InvalidOffset));
    }
}
