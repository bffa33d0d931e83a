//! Multiple APIC Description Table parsing.
//!
//! The MADT describes the interrupt controller topology: local APICs,
//! I/O APICs, and the interrupt source overrides that remap ISA IRQs onto
//! global system interrupts.

use crate::sdt::{SdtHeader, le_u16, le_u32};
use crate::{AcpiError, AcpiHandler};

/// MADT table signature.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// MADT flag bit 0: dual 8259 PICs are installed and must be masked.
pub const MADT_PCAT_COMPAT: u32 = 1 << 0;

/// Parsed MADT table.
pub struct Madt {
    /// Physical address of the local APIC.
    pub local_apic_address: u32,
    /// MADT flags ([`MADT_PCAT_COMPAT`]).
    pub flags: u32,
    entries_data: &'static [u8],
}

impl Madt {
    /// Fixed fields after the SDT header: local APIC address + flags.
    const FIELDS_SIZE: usize = 8;

    /// Parses a MADT at the given physical address.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidSignature`] / [`AcpiError::InvalidChecksum`]
    /// from table loading, or [`AcpiError::TruncatedData`].
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, MADT_SIGNATURE)?;
        let local_apic_address =
            le_u32(table.data, SdtHeader::SIZE).ok_or(AcpiError::TruncatedData)?;
        let flags = le_u32(table.data, SdtHeader::SIZE + 4).ok_or(AcpiError::TruncatedData)?;
        let entries_offset = SdtHeader::SIZE + Self::FIELDS_SIZE;
        let entries_data = table
            .data
            .get(entries_offset..table.header.length as usize)
            .unwrap_or(&[]);
        Ok(Self { local_apic_address, flags, entries_data })
    }

    /// Iterates the interrupt controller structure entries.
    #[must_use]
    pub fn entries(&self) -> MadtEntryIter {
        MadtEntryIter { data: self.entries_data, offset: 0 }
    }
}

/// A single MADT interrupt controller structure entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0: processor local APIC.
    LocalApic {
        /// ACPI processor UID.
        acpi_processor_id: u8,
        /// The processor's local APIC ID.
        apic_id: u8,
        /// Bit 0: enabled; bit 1: online capable.
        flags: u32,
    },
    /// Type 1: I/O APIC.
    IoApic {
        /// The I/O APIC ID.
        io_apic_id: u8,
        /// Physical address of the I/O APIC registers.
        io_apic_address: u32,
        /// Global system interrupt base for this I/O APIC.
        gsi_base: u32,
    },
    /// Type 2: interrupt source override (ISA IRQ → GSI).
    InterruptSourceOverride {
        /// ISA source IRQ number.
        source: u8,
        /// Global system interrupt it maps to.
        gsi: u32,
        /// MPS INTI flags (polarity and trigger mode).
        flags: u16,
    },
    /// Type 4: NMI source.
    NmiSource {
        /// MPS INTI flags.
        flags: u16,
        /// Global system interrupt of the NMI source.
        gsi: u32,
    },
    /// An entry type this parser does not interpret.
    Unknown {
        /// The entry type byte.
        entry_type: u8,
        /// The entry length including the 2-byte header.
        length: u8,
    },
}

/// Iterator over MADT entries.
pub struct MadtEntryIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Iterator for MadtEntryIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.data.get(self.offset..)?;
            if rest.len() < 2 {
                return None;
            }
            let entry_type = rest[0];
            let length = rest[1];
            if length < 2 || (length as usize) > rest.len() {
                return None; // malformed entry terminates the walk
            }
            let entry = &rest[..length as usize];
            self.offset += length as usize;

            let parsed = match entry_type {
                0 if entry.len() >= 8 => MadtEntry::LocalApic {
                    acpi_processor_id: entry[2],
                    apic_id: entry[3],
                    flags: le_u32(entry, 4)?,
                },
                1 if entry.len() >= 12 => MadtEntry::IoApic {
                    io_apic_id: entry[2],
                    io_apic_address: le_u32(entry, 4)?,
                    gsi_base: le_u32(entry, 8)?,
                },
                2 if entry.len() >= 10 => MadtEntry::InterruptSourceOverride {
                    source: entry[3],
                    gsi: le_u32(entry, 4)?,
                    flags: le_u16(entry, 8)?,
                },
                4 if entry.len() >= 8 => MadtEntry::NmiSource {
                    flags: le_u16(entry, 2)?,
                    gsi: le_u32(entry, 4)?,
                },
                _ => MadtEntry::Unknown { entry_type, length },
            };
            return Some(parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdt::tests::{SliceHandler, make_table};

    fn make_madt(entries: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0xFEE0_0000u32.to_le_bytes()); // LAPIC base
        payload.extend_from_slice(&MADT_PCAT_COMPAT.to_le_bytes());
        payload.extend_from_slice(entries);
        make_table(MADT_SIGNATURE, &payload)
    }

    #[test]
    fn parses_lapic_and_ioapic_entries() {
        let mut entries = Vec::new();
        // Local APIC: type 0, len 8, uid 0, apic 0, enabled.
        entries.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        // I/O APIC: type 1, len 12, id 1, addr 0xFEC00000, gsi base 0.
        entries.extend_from_slice(&[1, 12, 1, 0]);
        entries.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        entries.extend_from_slice(&0u32.to_le_bytes());

        let madt = make_madt(&entries);
        let handler = SliceHandler { regions: vec![(0x1000, madt.leak())] };
        let madt = Madt::parse(&handler, 0x1000).expect("valid MADT");

        assert_eq!(madt.local_apic_address, 0xFEE0_0000);
        assert!(madt.flags & MADT_PCAT_COMPAT != 0);

        let parsed: Vec<_> = madt.entries().collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[0],
            MadtEntry::LocalApic { acpi_processor_id: 0, apic_id: 0, flags: 1 }
        );
        assert_eq!(
            parsed[1],
            MadtEntry::IoApic { io_apic_id: 1, io_apic_address: 0xFEC0_0000, gsi_base: 0 }
        );
    }

    #[test]
    fn parses_interrupt_source_override() {
        // ISO: type 2, len 10, bus 0, source 0 (PIT), gsi 2, flags 0.
        let mut entries = vec![2, 10, 0, 0];
        entries.extend_from_slice(&2u32.to_le_bytes());
        entries.extend_from_slice(&0u16.to_le_bytes());

        let madt = make_madt(&entries);
        let handler = SliceHandler { regions: vec![(0x1000, madt.leak())] };
        let madt = Madt::parse(&handler, 0x1000).expect("valid MADT");
        let parsed: Vec<_> = madt.entries().collect();
        assert_eq!(
            parsed[0],
            MadtEntry::InterruptSourceOverride { source: 0, gsi: 2, flags: 0 }
        );
    }

    #[test]
    fn unknown_entries_are_surfaced() {
        let entries = [9u8, 4, 0xAA, 0xBB]; // type 9 (x2APIC), len 4
        let madt = make_madt(&entries);
        let handler = SliceHandler { regions: vec![(0x1000, madt.leak())] };
        let madt = Madt::parse(&handler, 0x1000).expect("valid MADT");
        let parsed: Vec<_> = madt.entries().collect();
        assert_eq!(parsed[0], MadtEntry::Unknown { entry_type: 9, length: 4 });
    }

    #[test]
    fn malformed_length_terminates() {
        let entries = [0u8, 1]; // length < 2
        let madt = make_madt(&entries);
        let handler = SliceHandler { regions: vec![(0x1000, madt.leak())] };
        let madt = Madt::parse(&handler, 0x1000).expect("valid MADT");
        assert_eq!(madt.entries().count(), 0);
    }
}
