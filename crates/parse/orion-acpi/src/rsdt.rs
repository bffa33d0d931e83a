//! RSDT/XSDT walking.

use crate::sdt::{SdtHeader, le_u32, le_u64, load_table};
use crate::AcpiHandler;

/// Searches the RSDT (32-bit entries) or XSDT (64-bit entries) for a table
/// whose SDT signature matches, returning its physical address.
#[must_use]
pub fn find_table(
    handler: &impl AcpiHandler,
    root_phys: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
) -> Option<u64> {
    let expected_sig: &[u8; 4] = if is_xsdt { b"XSDT" } else { b"RSDT" };
    let root = load_table(handler, root_phys, expected_sig).ok()?;

    let entry_size = if is_xsdt { 8 } else { 4 };
    let entries = &root.data[SdtHeader::SIZE..root.header.length as usize];

    for chunk_off in (0..entries.len() / entry_size).map(|i| i * entry_size) {
        let phys = if is_xsdt {
            le_u64(entries, chunk_off)?
        } else {
            u64::from(le_u32(entries, chunk_off)?)
        };
        if phys == 0 {
            continue;
        }
        // SAFETY: phys came from a checksum-validated root table.
        let header_data = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        if let Some(header) = SdtHeader::read_from_bytes(header_data)
            && &header.signature == signature
        {
            return Some(phys);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdt::tests::{SliceHandler, make_table};

    #[test]
    fn finds_table_via_xsdt() {
        let madt = make_table(b"APIC", &[0u8; 8]);
        let mut xsdt_payload = Vec::new();
        xsdt_payload.extend_from_slice(&0x2000u64.to_le_bytes());
        let xsdt = make_table(b"XSDT", &xsdt_payload);

        let handler = SliceHandler {
            regions: vec![(0x1000, xsdt.leak()), (0x2000, madt.leak())],
        };
        assert_eq!(find_table(&handler, 0x1000, true, b"APIC"), Some(0x2000));
        assert_eq!(find_table(&handler, 0x1000, true, b"HPET"), None);
    }

    #[test]
    fn finds_table_via_rsdt() {
        let madt = make_table(b"APIC", &[0u8; 8]);
        let mut rsdt_payload = Vec::new();
        rsdt_payload.extend_from_slice(&0x2000u32.to_le_bytes());
        let rsdt = make_table(b"RSDT", &rsdt_payload);

        let handler = SliceHandler {
            regions: vec![(0x1000, rsdt.leak()), (0x2000, madt.leak())],
        };
        assert_eq!(find_table(&handler, 0x1000, false, b"APIC"), Some(0x2000));
    }

    #[test]
    fn skips_null_entries() {
        let madt = make_table(b"APIC", &[0u8; 8]);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&0x2000u64.to_le_bytes());
        let xsdt = make_table(b"XSDT", &payload);

        let handler = SliceHandler {
            regions: vec![(0x1000, xsdt.leak()), (0x2000, madt.leak())],
        };
        assert_eq!(find_table(&handler, 0x1000, true, b"APIC"), Some(0x2000));
    }
}
