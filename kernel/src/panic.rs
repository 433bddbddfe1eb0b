//! Kernel panic path: mask interrupts, report on serial, halt.

use core::panic::PanicInfo;

pub fn panic_handler(info: &PanicInfo) -> ! {
    crate::arch::x86_64::cli();

    crate::serial_println!("=== KERNEL PANIC ===");
    if let Some(location) = info.location() {
        crate::serial_println!(
            "at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    crate::serial_println!("{}", info.message());
    crate::serial_println!("====================");

    crate::arch::x86_64::halt_forever();
}
