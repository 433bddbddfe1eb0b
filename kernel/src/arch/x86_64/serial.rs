//! COM1 serial output, the kernel's diagnostic sink.

use core::fmt;
use spin::Mutex;
use uart_16550::SerialPort;

static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x3F8) });

/// Initialize the serial port. Call before any logging.
pub fn init() {
    COM1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // The console is loss-tolerant: if the port is busy (e.g. we faulted
    // while holding the lock), drop the message instead of deadlocking.
    if let Some(mut port) = COM1.try_lock() {
        let _ = port.write_fmt(args);
    }
}

/// Print to the serial console.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::_print(format_args!($($arg)*))
    };
}

/// Print a line to the serial console.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
