//! HPET description table parsing.

use crate::sdt::{SdtHeader, le_u64};
use crate::{AcpiError, AcpiHandler};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Parsed HPET table.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Physical base of the HPET register block.
    pub base_address: u64,
    /// HPET number (for systems with several blocks).
    pub hpet_number: u8,
    /// Minimum tick in periodic mode.
    pub minimum_tick: u16,
}

impl HpetTable {
    /// Parses an HPET table at the given physical address.
    ///
    /// # Errors
    ///
    /// Returns the usual table-loading errors or
    /// [`AcpiError::TruncatedData`].
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, HPET_SIGNATURE)?;
        let data = table.data;

        // The GAS block starts 4 bytes after the SDT header (event timer
        // block ID); the 64-bit address lives at GAS offset 4.
        let base_address =
            le_u64(data, SdtHeader::SIZE + 8).ok_or(AcpiError::TruncatedData)?;
        let hpet_number = data.get(SdtHeader::SIZE + 16).copied().ok_or(AcpiError::TruncatedData)?;
        let minimum_tick = data
            .get(SdtHeader::SIZE + 17..SdtHeader::SIZE + 19)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or(AcpiError::TruncatedData)?;

        Ok(Self { base_address, hpet_number, minimum_tick })
    }
}
