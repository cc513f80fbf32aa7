//! 8254 Programmable Interval Timer
//!
//! Programmed once at boot as a rate generator on channel 0; every
//! expiry raises IRQ0, which is the periodic tick the scheduler and the
//! wall clock consume.

use super::io::outb;

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator)
const MODE_RATE_GENERATOR: u8 = 0x34;

/// Input clock of the 8254, in Hz
const PIT_FREQUENCY: u32 = 1_193_182;

/// Tick rate the kernel runs at
pub const TICK_HZ: u32 = 100;

/// Program channel 0 to fire `TICK_HZ` times per second.
pub fn init() {
    let divisor = PIT_FREQUENCY / TICK_HZ;
    unsafe {
        outb(COMMAND, MODE_RATE_GENERATOR);
        outb(CHANNEL0, (divisor & 0xFF) as u8);
        outb(CHANNEL0, (divisor >> 8) as u8);
    }
    log::debug!(target: "trap", "pit programmed at {} Hz", TICK_HZ);
}
