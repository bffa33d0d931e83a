//! DWARF v4 line program unit header parsing.

use crate::leb128::decode_uleb128;
use crate::program::LineRows;

/// Errors produced while parsing a line program unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfError {
    /// The unit is shorter than its declared sizes.
    Truncated,
    /// The unit's DWARF version is not 4.
    UnsupportedVersion,
    /// A table in the header is malformed.
    BadHeader,
}

/// Maximum standard opcodes tracked (DWARF defines 12; room for vendors).
const MAX_STD_OPCODES: usize = 24;

/// Parsed line program unit header (DWARF v4, 32-bit format).
#[derive(Clone, Copy)]
pub struct UnitHeader<'a> {
    /// DWARF version (always 4 once parsed).
    pub version: u16,
    /// Offset of the program bytecode within the unit.
    pub(crate) program_offset: usize,
    /// Size of a minimum-length instruction.
    pub minimum_instruction_length: u8,
    /// VLIW operations per instruction (1 on x86-64).
    pub maximum_operations_per_instruction: u8,
    /// Initial value of the `is_stmt` register.
    pub default_is_stmt: bool,
    /// Smallest line advance a special opcode can encode.
    pub line_base: i8,
    /// Number of line advances a special opcode can encode.
    pub line_range: u8,
    /// First special opcode number.
    pub opcode_base: u8,
    /// Argument counts for standard opcodes (index `opcode - 1`).
    pub standard_opcode_lengths: [u8; MAX_STD_OPCODES],
    /// Raw bytes of the file name table.
    file_table: &'a [u8],
}

impl<'a> UnitHeader<'a> {
    /// Parses a unit header from a full unit (starting at `unit_length`).
    ///
    /// # Errors
    ///
    /// Returns [`DwarfError`] on truncation, a non-v4 version, or malformed
    /// directory/file tables.
    pub fn parse(unit: &'a [u8]) -> Result<Self, DwarfError> {
        if unit.len() < 16 {
            return Err(DwarfError::Truncated);
        }
        let version = u16::from_le_bytes([unit[4], unit[5]]);
        if version != 4 {
            return Err(DwarfError::UnsupportedVersion);
        }
        let header_length = u32::from_le_bytes([unit[6], unit[7], unit[8], unit[9]]) as usize;
        let program_offset = 10 + header_length;
        if program_offset > unit.len() {
            return Err(DwarfError::Truncated);
        }

        let minimum_instruction_length = unit[10];
        let maximum_operations_per_instruction = unit[11];
        let default_is_stmt = unit[12] != 0;
        let line_base = unit[13] as i8;
        let line_range = unit[14];
        let opcode_base = unit[15];
        if line_range == 0 || opcode_base == 0 {
            return Err(DwarfError::BadHeader);
        }

        let mut standard_opcode_lengths = [0u8; MAX_STD_OPCODES];
        let std_count = (opcode_base - 1) as usize;
        if std_count > MAX_STD_OPCODES || 16 + std_count > unit.len() {
            return Err(DwarfError::BadHeader);
        }
        standard_opcode_lengths[..std_count].copy_from_slice(&unit[16..16 + std_count]);

        // Skip the include-directory table (NUL-terminated strings, empty
        // string terminates the table).
        let mut pos = 16 + std_count;
        loop {
            let s = cstr_at(unit, pos).ok_or(DwarfError::BadHeader)?;
            pos += s.len() + 1;
            if s.is_empty() {
                break;
            }
        }

        let file_table = unit.get(pos..program_offset).ok_or(DwarfError::BadHeader)?;

        Ok(Self {
            version,
            program_offset,
            minimum_instruction_length,
            maximum_operations_per_instruction,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            standard_opcode_lengths,
            file_table,
        })
    }

    /// Returns the name of file `index` (1-based in DWARF v4).
    #[must_use]
    pub fn file_name(&self, index: u64) -> Option<&'a str> {
        if index == 0 {
            return None;
        }
        let mut pos = 0usize;
        let mut current: u64 = 0;
        loop {
            let name = cstr_at(self.file_table, pos)?;
            if name.is_empty() {
                return None; // table terminator
            }
            pos += name.len() + 1;
            // Skip directory index, mtime, and length.
            for _ in 0..3 {
                let (_, used) = decode_uleb128(self.file_table.get(pos..)?)?;
                pos += used;
            }
            current += 1;
            if current == index {
                return core::str::from_utf8(name).ok();
            }
        }
    }

    /// Creates a row iterator over the unit's bytecode.
    #[must_use]
    pub fn rows(&self, unit: &'a [u8]) -> LineRows<'a> {
        let bytecode = unit.get(self.program_offset..).unwrap_or(&[]);
        LineRows::new(self, bytecode)
    }
}

/// Returns the bytes of the NUL-terminated string at `pos` (without the NUL).
fn cstr_at(data: &[u8], pos: usize) -> Option<&[u8]> {
    let rest = data.get(pos..)?;
    let nul = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..nul])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a DWARF v4 unit with the given bytecode and file names.
    pub(crate) fn make_unit(bytecode: &[u8], files: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0u8; 4]); // unit_length placeholder
        buf.extend_from_slice(&4u16.to_le_bytes()); // version
        let header_length_pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]); // header_length placeholder
        let header_start = buf.len();

        buf.push(1); // minimum_instruction_length
        buf.push(1); // maximum_operations_per_instruction
        buf.push(1); // default_is_stmt
        buf.push((-5i8) as u8); // line_base
        buf.push(14); // line_range
        buf.push(13); // opcode_base
        buf.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);

        buf.push(0); // empty include-directory table
        for f in files {
            buf.extend_from_slice(f.as_bytes());
            buf.push(0);
            buf.extend_from_slice(&[0, 0, 0]); // dir, mtime, length ULEBs
        }
        buf.push(0); // file table terminator

        let header_length = (buf.len() - header_start) as u32;
        buf[header_length_pos..header_length_pos + 4]
            .copy_from_slice(&header_length.to_le_bytes());

        buf.extend_from_slice(bytecode);

        let unit_length = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&unit_length.to_le_bytes());
        buf
    }

    #[test]
    fn parse_header_fields() {
        let buf = make_unit(&[], &["a.rs", "b.rs"]);
        let hdr = UnitHeader::parse(&buf).expect("valid header");
        assert_eq!(hdr.version, 4);
        assert_eq!(hdr.line_base, -5);
        assert_eq!(hdr.line_range, 14);
        assert_eq!(hdr.opcode_base, 13);
        assert!(hdr.default_is_stmt);
    }

    #[test]
    fn file_names_are_one_based() {
        let buf = make_unit(&[], &["a.rs", "b.rs"]);
        let hdr = UnitHeader::parse(&buf).expect("valid header");
        assert_eq!(hdr.file_name(1), Some("a.rs"));
        assert_eq!(hdr.file_name(2), Some("b.rs"));
        assert_eq!(hdr.file_name(0), None);
        assert_eq!(hdr.file_name(3), None);
    }

    #[test]
    fn reject_wrong_version() {
        let mut buf = make_unit(&[], &[]);
        buf[4] = 5;
        assert!(matches!(
            UnitHeader::parse(&buf).map(|_| ()),
            Err(DwarfError::UnsupportedVersion)
        ));
    }

    #[test]
    fn reject_truncated() {
        assert!(UnitHeader::parse(&[0u8; 8]).is_err());
    }
}
