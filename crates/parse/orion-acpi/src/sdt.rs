//! System Description Table header and checksum utilities.

use crate::{AcpiError, AcpiHandler};

pub(crate) fn le_u16(data: &[u8], off: usize) -> Option<u16> {
    data.get(off..off + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn le_u32(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn le_u64(data: &[u8], off: usize) -> Option<u64> {
    data.get(off..off + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

/// The 36-byte header at the start of every ACPI table.
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: [u8; 4],
    /// Total length of the table, header included, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Reads an `SdtHeader` from a byte slice.
    #[must_use]
    pub fn read_from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: [data[0], data[1], data[2], data[3]],
            length: le_u32(data, 4)?,
            revision: data[8],
        })
    }
}

/// Mapped ACPI table data with a validated header.
pub struct ValidatedTable {
    /// The validated SDT header.
    pub header: SdtHeader,
    /// The full table bytes (header included), checksum-validated.
    pub data: &'static [u8],
}

/// Maps and validates an ACPI table at the given physical address.
///
/// The standard four-step sequence: map the header to learn the length,
/// verify the signature, map the full table, validate the checksum.
///
/// # Errors
///
/// Returns [`AcpiError::TruncatedData`] if the header cannot be read,
/// [`AcpiError::InvalidSignature`] on a signature mismatch, or
/// [`AcpiError::InvalidChecksum`] if the byte sum is nonzero.
pub fn load_table(
    handler: &impl AcpiHandler,
    phys: u64,
    expected_signature: &[u8; 4],
) -> Result<ValidatedTable, AcpiError> {
    // SAFETY: The caller provides a valid table physical address.
    let header_data = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
    let header = SdtHeader::read_from_bytes(header_data).ok_or(AcpiError::TruncatedData)?;

    if &header.signature != expected_signature {
        return Err(AcpiError::InvalidSignature);
    }

    let total_len = header.length as usize;
    if total_len < SdtHeader::SIZE {
        return Err(AcpiError::TruncatedData);
    }

    // SAFETY: phys is valid and total_len comes from the validated header.
    let data = unsafe { handler.map_physical_region(phys, total_len) };
    if data.len() < total_len {
        return Err(AcpiError::TruncatedData);
    }

    if !validate_checksum(&data[..total_len]) {
        return Err(AcpiError::InvalidChecksum);
    }

    Ok(ValidatedTable { header, data })
}

/// Validates an ACPI checksum: the sum of all bytes must be zero (mod 256).
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) == 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal table with the given signature and payload, with a
    /// correct length and checksum.
    pub(crate) fn make_table(signature: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; SdtHeader::SIZE];
        buf[0..4].copy_from_slice(signature);
        buf.extend_from_slice(payload);
        let len = buf.len() as u32;
        buf[4..8].copy_from_slice(&len.to_le_bytes());
        buf[8] = 1; // revision
        fix_checksum(&mut buf);
        buf
    }

    /// Rewrites byte 9 so the whole table sums to zero.
    pub(crate) fn fix_checksum(table: &mut [u8]) {
        table[9] = 0;
        let sum = table.iter().fold(0u8, |s, &b| s.wrapping_add(b));
        table[9] = 0u8.wrapping_sub(sum);
    }

    /// A test handler serving tables out of leaked buffers placed at fake
    /// physical addresses.
    pub(crate) struct SliceHandler {
        pub regions: Vec<(u64, &'static [u8])>,
    }

    // SAFETY: Slices are leaked for 'static and cover the claimed ranges.
    unsafe impl AcpiHandler for SliceHandler {
        unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
            for (base, data) in &self.regions {
                if phys >= *base && (phys - base) as usize + size <= data.len() {
                    let off = (phys - base) as usize;
                    return &data[off..];
                }
            }
            &[]
        }
    }

    #[test]
    fn checksum_validation() {
        let table = make_table(b"TEST", &[1, 2, 3]);
        assert!(validate_checksum(&table));
        let mut bad = table.clone();
        bad[10] ^= 0xFF;
        assert!(!validate_checksum(&bad));
    }

    #[test]
    fn load_table_happy_path() {
        let table = make_table(b"APIC", &[0u8; 8]);
        let handler = SliceHandler { regions: vec![(0x1000, table.leak())] };
        let loaded = load_table(&handler, 0x1000, b"APIC").expect("valid table");
        assert_eq!(&loaded.header.signature, b"APIC");
    }

    #[test]
    fn load_table_rejects_wrong_signature() {
        let table = make_table(b"APIC", &[]);
        let handler = SliceHandler { regions: vec![(0x1000, table.leak())] };
        assert_eq!(load_table(&handler, 0x1000, b"HPET").err(), Some(AcpiError::InvalidSignature));
    }

    #[test]
    fn load_table_rejects_bad_checksum() {
        let mut table = make_table(b"APIC", &[0u8; 4]);
        table[12] ^= 0x5A; // corrupt without fixing the checksum
        let handler = SliceHandler { regions: vec![(0x1000, table.leak())] };
        assert_eq!(load_table(&handler, 0x1000, b"APIC").err(), Some(AcpiError::InvalidChecksum));
    }
}
