//! Diagnostic console: a loss-tolerant byte sink over serial.
//!
//! This is what `write(1, ...)` and `putchar` talk to. There is no
//! input device wired yet, so reads come back empty.

/// Write one character.
pub fn putchar(byte: u8) {
    crate::serial_print!("{}", byte as char);
}

/// Write a run of bytes.
pub fn write_bytes(bytes: &[u8]) {
    for &byte in bytes {
        putchar(byte);
    }
}

/// Read one character; `None` until a keyboard driver exists.
pub fn getchar() -> Option<u8> {
    None
}
