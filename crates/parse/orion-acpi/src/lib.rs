//! A standalone, `no_std` ACPI table parser.
//!
//! Parses the tables the kernel needs during early boot: RSDP, RSDT/XSDT,
//! MADT (interrupt topology), FADT (century register, PM timer block), and
//! HPET. Table iteration is done through safe byte-slice readers backed by
//! an [`AcpiHandler`] that maps physical memory on demand; the crate never
//! allocates.
//!
//! # Usage
//!
//! ```ignore
//! let tables = AcpiTables::new(rsdp_physical_address, my_handler)?;
//! for entry in tables.madt()?.entries() {
//!     // LocalApic / IoApic / InterruptSourceOverride / ...
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod fadt;
pub mod hpet;
pub mod madt;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

pub use fadt::Fadt;
pub use hpet::HpetTable;
pub use madt::{Madt, MadtEntry};
pub use sdt::{SdtHeader, ValidatedTable};

/// Errors that can occur during ACPI table parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// A table or the RSDP failed its checksum (byte sum != 0).
    InvalidChecksum,
    /// A table signature did not match the expected value.
    InvalidSignature,
    /// The RSDP structure was invalid (bad signature or checksum).
    InvalidRsdp,
    /// No table with the requested signature exists in the RSDT/XSDT.
    TableNotFound,
    /// A table was too short to contain the expected data.
    TruncatedData,
}

/// Maps physical memory regions so ACPI tables can be read.
///
/// An implementation must return a byte slice covering at least `size` bytes
/// starting at physical address `phys`. The mapping strategy (identity map,
/// higher-half direct map, temporary window) is the implementor's choice.
///
/// # Safety
///
/// Implementors must ensure the returned slice is valid and readable for the
/// requested `size` bytes, and remains valid for `'static`.
pub unsafe trait AcpiHandler {
    /// Maps a physical memory region and returns a byte slice over it.
    ///
    /// # Safety
    ///
    /// The caller guarantees `phys` is a valid ACPI-related physical address
    /// and `size` does not extend beyond the actual table.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8];
}

/// The discovered ACPI table hierarchy.
pub struct AcpiTables<H: AcpiHandler> {
    handler: H,
    /// Physical address of the RSDT or XSDT.
    rsdt_addr: u64,
    /// `true` when `rsdt_addr` points at an XSDT (64-bit entries).
    is_xsdt: bool,
}

impl<H: AcpiHandler> AcpiTables<H> {
    /// Validates the RSDP at `rsdp_phys` and records the root table address.
    ///
    /// Individual tables are parsed lazily when requested.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidRsdp`] if the RSDP fails validation.
    pub fn new(rsdp_phys: u64, handler: H) -> Result<Self, AcpiError> {
        let (rsdt_addr, is_xsdt) = rsdp::parse_rsdp(&handler, rsdp_phys)?;
        Ok(Self { handler, rsdt_addr, is_xsdt })
    }

    /// Searches the RSDT/XSDT for a table with the given signature.
    #[must_use]
    pub fn find_table(&self, signature: &[u8; 4]) -> Option<u64> {
        rsdt::find_table(&self.handler, self.rsdt_addr, self.is_xsdt, signature)
    }

    /// Parses the MADT (interrupt controller topology).
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TableNotFound`] when absent, or another variant
    /// when the table is malformed.
    pub fn madt(&self) -> Result<Madt, AcpiError> {
        let phys = self.find_table(madt::MADT_SIGNATURE).ok_or(AcpiError::TableNotFound)?;
        Madt::parse(&self.handler, phys)
    }

    /// Parses the FADT (fixed hardware description).
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TableNotFound`] when absent, or another variant
    /// when the table is malformed.
    pub fn fadt(&self) -> Result<Fadt, AcpiError> {
        let phys = self.find_table(fadt::FADT_SIGNATURE).ok_or(AcpiError::TableNotFound)?;
        Fadt::parse(&self.handler, phys)
    }

    /// Parses the HPET table.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TableNotFound`] when absent, or another variant
    /// when the table is malformed.
    pub fn hpet(&self) -> Result<HpetTable, AcpiError> {
        let phys = self.find_table(hpet::HPET_SIGNATURE).ok_or(AcpiError::TableNotFound)?;
        HpetTable::parse(&self.handler, phys)
    }

    /// Returns the underlying handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }
}
