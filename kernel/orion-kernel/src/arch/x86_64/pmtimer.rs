//! ACPI PM timer: a fixed-rate 3.579545 MHz clock source.

use orion_acpi::fadt::PM_TIMER_FREQUENCY_HZ;

use super::port::Port;

/// The PM timer as a [`ClockSource`](crate::time::clock::ClockSource).
pub struct PmTimer {
    port: Port<u32>,
    mask: u64,
}

impl PmTimer {
    /// Wraps the FADT-described timer block.
    #[must_use]
    pub fn new(port: u16, extended_32bit: bool) -> Self {
        Self {
            port: Port::new(port),
            mask: if extended_32bit { 0xFFFF_FFFF } else { 0x00FF_FFFF },
        }
    }
}

impl crate::time::clock::ClockSource for PmTimer {
    fn name(&self) -> &'static str {
        "acpi-pm"
    }

    fn scale_ns(&self) -> u64 {
        // 3.579545 MHz → about 279 ns per tick.
        1_000_000_000 / PM_TIMER_FREQUENCY_HZ
    }

    fn value_mask(&self) -> u64 {
        self.mask
    }

    fn read(&self) -> u64 {
        // SAFETY: The port came from the FADT's PM timer block.
        u64::from(unsafe { self.port.read() })
    }

    fn enable(&self) {}

    fn disable(&self) {}
}
