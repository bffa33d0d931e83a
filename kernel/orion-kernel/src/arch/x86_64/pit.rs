//! 8254 PIT: only used as a calibration reference.

use super::port::Port;

const CHANNEL0: Port<u8> = Port::new(0x40);
const COMMAND: Port<u8> = Port::new(0x43);

/// PIT input frequency in Hz.
pub const PIT_FREQUENCY_HZ: u64 = 1_193_182;

/// Busy-waits for `ms` milliseconds using channel 0 in one-shot mode.
///
/// Only used during bring-up (LAPIC timer calibration), before any
/// scheduler exists.
pub fn spin_wait_ms(ms: u64) {
    let ticks = (PIT_FREQUENCY_HZ * ms / 1000).min(0xFFFF) as u16;
    // SAFETY: Channel 0, mode 0 (interrupt on terminal count), lo/hi byte.
    unsafe {
        COMMAND.write(0x30);
        CHANNEL0.write(ticks as u8);
        CHANNEL0.write((ticks >> 8) as u8);
        loop {
            // Latch and read the count; OUT goes high at terminal count,
            // observed as the count wrapping past the programmed value.
            COMMAND.write(0x00);
            let lo = CHANNEL0.read();
            let hi = CHANNEL0.read();
            let current = u16::from(lo) | (u16::from(hi) << 8);
            if current == 0 || current > ticks {
                break;
            }
            core::hint::spin_loop();
        }
    }
}
