//! COM1, the kernel's only output device.

use core::fmt::Write;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use crate::{constants::ports::SERIAL_PORT, sync::critical::with_locked};

lazy_static! {
    /// Initialized on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    // the port lock is also taken from panics and interrupt handlers
    with_locked(&SERIAL1, |port| {
        port.write_fmt(args).expect("Printing to serial failed");
    });
}

/// Prints formatted text to COM1.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to COM1, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
