//! ELF image access: segment iteration and the interpreter path.

use crate::header::{ELF64_PHDR_SIZE, Elf64Header, ElfError, ProgramHeader};
use crate::{PT_INTERP, PT_LOAD};

/// A parsed ELF64 image borrowing the raw file data.
#[derive(Debug, Clone, Copy)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

/// A loadable segment extracted from an ELF image.
#[derive(Debug)]
pub struct LoadSegment<'a> {
    /// Virtual address the segment maps at.
    pub vaddr: u64,
    /// File offset of the segment's first byte.
    pub offset: u64,
    /// File-backed content; the `memsz - filesz` tail is zero-filled.
    pub data: &'a [u8],
    /// Total in-memory size.
    pub memsz: u64,
    /// Permission flags (`PF_R` / `PF_W` / `PF_X`).
    pub flags: u32,
}

impl<'a> ElfImage<'a> {
    /// Parses an ELF64 image from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if the header is invalid or the data too short.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        Ok(Self { data, header })
    }

    /// Returns the entry point virtual address.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// Returns the parsed file header.
    #[must_use]
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// Iterates all program headers.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "table bounds were validated against the file length"
    )]
    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        let data = self.data;
        let phoff = self.header.e_phoff as usize;
        let phentsize = self.header.e_phentsize as usize;
        let phnum = self.header.e_phnum as usize;

        (0..phnum).filter_map(move |i| {
            let offset = phoff + i * phentsize;
            if offset + ELF64_PHDR_SIZE > data.len() {
                return None;
            }
            Some(ProgramHeader::parse(data, offset))
        })
    }

    /// Iterates `PT_LOAD` segments with their file-backed data resolved.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "segment fields fit the target width on x86-64"
    )]
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> {
        let data = self.data;
        self.program_headers().filter_map(move |phdr| {
            if phdr.p_type != PT_LOAD {
                return None;
            }
            let file_offset = phdr.p_offset as usize;
            let file_size = phdr.p_filesz as usize;
            let seg_data = if file_size == 0 {
                &[] as &[u8]
            } else if file_offset + file_size <= data.len() {
                &data[file_offset..file_offset + file_size]
            } else {
                // Truncated image; surface what exists.
                &data[file_offset.min(data.len())..]
            };
            Some(LoadSegment {
                vaddr: phdr.p_vaddr,
                offset: phdr.p_offset,
                data: seg_data,
                memsz: phdr.p_memsz,
                flags: phdr.p_flags,
            })
        })
    }

    /// Returns the `PT_INTERP` path, if the image requests an interpreter.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError::BadInterpreter`] when the segment exists but does
    /// not hold a NUL-terminated UTF-8 path.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "segment fields fit the target width on x86-64"
    )]
    pub fn interpreter(&self) -> Result<Option<&'a str>, ElfError> {
        let Some(phdr) = self.program_headers().find(|p| p.p_type == PT_INTERP) else {
            return Ok(None);
        };
        let start = phdr.p_offset as usize;
        let len = phdr.p_filesz as usize;
        if start + len > self.data.len() || len == 0 {
            return Err(ElfError::BadInterpreter);
        }
        let raw = &self.data[start..start + len];
        // The path is NUL-terminated inside the segment.
        let nul = raw.iter().position(|&b| b == 0).ok_or(ElfError::BadInterpreter)?;
        core::str::from_utf8(&raw[..nul]).map(Some).map_err(|_| ElfError::BadInterpreter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::{append_phdr, make_elf_header};
    use crate::{PF_R, PF_W, PF_X};

    fn make_elf_with_load_segment(payload: &[u8]) -> Vec<u8> {
        let mut buf = make_elf_header();
        let data_offset = 64 + 56;
        append_phdr(
            &mut buf,
            PT_LOAD,
            PF_R | PF_X,
            data_offset as u64,
            0x0040_0000,
            payload.len() as u64,
            payload.len() as u64 + 0x100,
        );
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn one_load_segment() {
        let payload = b"text bytes";
        let buf = make_elf_with_load_segment(payload);
        let elf = ElfImage::parse(&buf).expect("valid ELF");
        let segs: Vec<_> = elf.load_segments().collect();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].vaddr, 0x0040_0000);
        assert_eq!(segs[0].data, payload);
        assert_eq!(segs[0].memsz, payload.len() as u64 + 0x100);
        assert_eq!(segs[0].flags, PF_R | PF_X);
    }

    #[test]
    fn non_load_segments_are_filtered() {
        let mut buf = make_elf_header();
        let data_offset = (64 + 56 * 2) as u64;
        append_phdr(&mut buf, PT_LOAD, PF_R, data_offset, 0x40_0000, 4, 4);
        append_phdr(&mut buf, 4, 0, 0, 0, 0, 0); // PT_NOTE
        buf.extend_from_slice(&[0xAA; 4]);

        let elf = ElfImage::parse(&buf).expect("valid ELF");
        assert_eq!(elf.load_segments().count(), 1);
        assert_eq!(elf.program_headers().count(), 2);
    }

    #[test]
    fn bss_only_segment() {
        let mut buf = make_elf_header();
        append_phdr(&mut buf, PT_LOAD, PF_R | PF_W, 0, 0x60_0000, 0, 0x4000);
        let elf = ElfImage::parse(&buf).expect("valid ELF");
        let segs: Vec<_> = elf.load_segments().collect();
        assert!(segs[0].data.is_empty());
        assert_eq!(segs[0].memsz, 0x4000);
    }

    #[test]
    fn no_interpreter() {
        let buf = make_elf_header();
        let elf = ElfImage::parse(&buf).expect("valid ELF");
        assert_eq!(elf.interpreter().unwrap(), None);
    }

    #[test]
    fn interpreter_path() {
        let mut buf = make_elf_header();
        let path = b"/lib/ld.so\0";
        let data_offset = (64 + 56) as u64;
        append_phdr(&mut buf, PT_INTERP, PF_R, data_offset, 0, path.len() as u64, path.len() as u64);
        buf.extend_from_slice(path);

        let elf = ElfImage::parse(&buf).expect("valid ELF");
        assert_eq!(elf.interpreter().unwrap(), Some("/lib/ld.so"));
    }

    #[test]
    fn interpreter_without_nul_is_rejected() {
        let mut buf = make_elf_header();
        let path = b"/lib/ld.so"; // no terminator
        let data_offset = (64 + 56) as u64;
        append_phdr(&mut buf, PT_INTERP, PF_R, data_offset, 0, path.len() as u64, path.len() as u64);
        buf.extend_from_slice(path);

        let elf = ElfImage::parse(&buf).expect("valid ELF");
        assert_eq!(elf.interpreter(), Err(ElfError::BadInterpreter));
    }
}
