//! x86_64 Port I/O Operations
//!
//! Low-level port access for the PIC, PIT, CMOS and UART drivers.

use x86_64::instructions::port::{PortReadOnly, PortWriteOnly};

/// Read a byte from an I/O port
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut port = PortReadOnly::new(port);
    port.read()
}

/// Write a byte to an I/O port
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    let mut port = PortWriteOnly::new(port);
    port.write(value);
}

/// Short delay between PIC configuration writes.
///
/// Writes to an unused diagnostic port; takes roughly a microsecond on
/// everything that still has an 8259.
#[inline]
pub unsafe fn io_wait() {
    outb(0x80, 0);
}
