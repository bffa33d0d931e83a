//! Fixed ACPI Description Table parsing.
//!
//! Orion reads two things from the FADT: the CMOS century register index
//! (for the RTC boot-epoch read) and the PM timer I/O block (a 3.579545 MHz
//! free-running counter usable as a clock source).

use crate::sdt::{le_u32, le_u16};
use crate::{AcpiError, AcpiHandler};

/// FADT table signature.
pub const FADT_SIGNATURE: &[u8; 4] = b"FACP";

/// PM timer frequency in Hz (fixed by the ACPI specification).
pub const PM_TIMER_FREQUENCY_HZ: u64 = 3_579_545;

/// Parsed FADT fields.
#[derive(Debug, Clone, Copy)]
pub struct Fadt {
    /// CMOS index of the century register, or 0 when not implemented.
    pub century: u8,
    /// I/O port of the PM timer block, or `None` when absent.
    pub pm_timer_block: Option<u16>,
    /// Whether the PM timer counter is 32 bits wide (24 otherwise).
    pub pm_timer_32bit: bool,
}

impl Fadt {
    /// Byte offset of `PM_TMR_BLK` within the FADT.
    const PM_TMR_BLK_OFFSET: usize = 76;
    /// Byte offset of `PM_TMR_LEN`.
    const PM_TMR_LEN_OFFSET: usize = 91;
    /// Byte offset of the century register index.
    const CENTURY_OFFSET: usize = 108;
    /// Byte offset of the fixed feature flags.
    const FLAGS_OFFSET: usize = 112;
    /// `TMR_VAL_EXT` flag: the PM timer is 32 bits wide.
    const TMR_VAL_EXT: u32 = 1 << 8;

    /// Parses a FADT at the given physical address.
    ///
    /// # Errors
    ///
    /// Returns the usual table-loading errors; fields beyond the table's
    /// actual length read as absent rather than failing.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, FADT_SIGNATURE)?;
        let data = table.data;

        let century = data.get(Self::CENTURY_OFFSET).copied().unwrap_or(0);

        let pm_timer_block = match (
            le_u32(data, Self::PM_TMR_BLK_OFFSET),
            data.get(Self::PM_TMR_LEN_OFFSET).copied(),
        ) {
            (Some(port), Some(len)) if port != 0 && len >= 4 => {
                u16::try_from(port).ok()
            }
            _ => None,
        };

        let flags = le_u32(data, Self::FLAGS_OFFSET).unwrap_or(0);
        let pm_timer_32bit = flags & Self::TMR_VAL_EXT != 0;

        // The SCI interrupt field sits at offset 46; read it to keep the
        // offset math honest even though Orion does not route SCI yet.
        let _sci_int = le_u16(data, 46);

        Ok(Self { century, pm_timer_block, pm_timer_32bit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdt::tests::{SliceHandler, fix_checksum, make_table};

    fn make_fadt(century: u8, pm_port: u32, pm_len: u8, flags: u32) -> Vec<u8> {
        // Payload covering offsets up to 116 (flags end).
        let mut table = make_table(FADT_SIGNATURE, &vec![0u8; 116 - 36]);
        table[Fadt::PM_TMR_BLK_OFFSET..Fadt::PM_TMR_BLK_OFFSET + 4]
            .copy_from_slice(&pm_port.to_le_bytes());
        table[Fadt::PM_TMR_LEN_OFFSET] = pm_len;
        table[Fadt::CENTURY_OFFSET] = century;
        table[Fadt::FLAGS_OFFSET..Fadt::FLAGS_OFFSET + 4].copy_from_slice(&flags.to_le_bytes());
        fix_checksum(&mut table);
        table
    }

    #[test]
    fn parses_century_and_pm_timer() {
        let fadt = make_fadt(0x32, 0x608, 4, Fadt::TMR_VAL_EXT);
        let handler = SliceHandler { regions: vec![(0x1000, fadt.leak())] };
        let fadt = Fadt::parse(&handler, 0x1000).expect("valid FADT");
        assert_eq!(fadt.century, 0x32);
        assert_eq!(fadt.pm_timer_block, Some(0x608));
        assert!(fadt.pm_timer_32bit);
    }

    #[test]
    fn absent_pm_timer() {
        let fadt = make_fadt(0, 0, 0, 0);
        let handler = SliceHandler { regions: vec![(0x1000, fadt.leak())] };
        let fadt = Fadt::parse(&handler, 0x1000).expect("valid FADT");
        assert_eq!(fadt.pm_timer_block, None);
        assert!(!fadt.pm_timer_32bit);
    }
}
