//! Root System Description Pointer validation.

use crate::sdt::{le_u32, le_u64, validate_checksum};
use crate::{AcpiError, AcpiHandler};

/// Length of the ACPI 1.0 RSDP structure.
const RSDP_V1_SIZE: usize = 20;
/// Length of the ACPI 2.0+ RSDP structure.
const RSDP_V2_SIZE: usize = 36;

/// Validates the RSDP and returns `(root_table_phys, is_xsdt)`.
///
/// Revision ≥ 2 RSDPs carry a 64-bit XSDT address validated by the extended
/// checksum; revision 0 carries only the 32-bit RSDT address.
///
/// # Errors
///
/// Returns [`AcpiError::InvalidRsdp`] on a bad signature or checksum.
pub fn parse_rsdp(handler: &impl AcpiHandler, phys: u64) -> Result<(u64, bool), AcpiError> {
    // SAFETY: The caller provides the RSDP physical address from boot info.
    let data = unsafe { handler.map_physical_region(phys, RSDP_V2_SIZE) };
    if data.len() < RSDP_V1_SIZE || &data[..8] != b"RSD PTR " {
        return Err(AcpiError::InvalidRsdp);
    }
    if !validate_checksum(&data[..RSDP_V1_SIZE]) {
        return Err(AcpiError::InvalidRsdp);
    }

    let revision = data[15];
    if revision >= 2 && data.len() >= RSDP_V2_SIZE {
        // The extended checksum covers the whole 36-byte structure.
        if !validate_checksum(&data[..RSDP_V2_SIZE]) {
            return Err(AcpiError::InvalidRsdp);
        }
        let xsdt = le_u64(data, 24).ok_or(AcpiError::InvalidRsdp)?;
        if xsdt != 0 {
            return Ok((xsdt, true));
        }
    }

    let rsdt = le_u32(data, 16).ok_or(AcpiError::InvalidRsdp)?;
    Ok((u64::from(rsdt), false))
}
