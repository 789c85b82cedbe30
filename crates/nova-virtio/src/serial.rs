//! Serial debug output
//!
//! Bring-up progress and protocol errors go to the standard COM1 port,
//! which QEMU forwards to the host console. Output is dropped silently
//! until [`init`] runs, so unit tests and early boot stay quiet.

use core::fmt::{self, Write};
use spin::Mutex;
use uart_16550::SerialPort;

/// COM1 serial port base address
const COM1_PORT: u16 = 0x3F8;

/// Global serial port writer
static SERIAL: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Initialize the serial port.
///
/// # Safety
/// Must be called only once, during early platform initialization.
pub fn init() {
    let mut serial = unsafe { SerialPort::new(COM1_PORT) };
    serial.init();
    *SERIAL.lock() = Some(serial);
}

/// Serial port writer for formatting
pub struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(ref mut serial) = *SERIAL.lock() {
            for byte in s.bytes() {
                serial.send(byte);
            }
        }
        Ok(())
    }
}

/// Write a formatted string to serial output
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::serial::SerialWriter, $($arg)*);
    }};
}

/// Write a formatted string with newline to serial output
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {{
        $crate::serial_print!($($arg)*);
        $crate::serial_print!("\n");
    }};
}
