//! Kernel binary entry points.
//!
//! A multiboot-compatible loader calls `kernel_main` with a `BootInfo`
//! pointer; `_start` exists so the image also links and boots under
//! loaders that jump straight to the ELF entry with no arguments.

#![no_std]
#![no_main]

use ferrite_kernel::boot::BootInfo;

/// C-callable entry used by the loader.
///
/// # Safety
/// `boot_info` must be null or point to a valid `BootInfo`.
#[no_mangle]
pub unsafe extern "C" fn kernel_main(boot_info: *const BootInfo) -> ! {
    unsafe { ferrite_kernel::kernel_entry(boot_info) }
}

/// Bare ELF entry: no handoff information, defaults apply.
#[no_mangle]
pub extern "C" fn _start() -> ! {
    // SAFETY: a null pointer selects the built-in defaults.
    unsafe { ferrite_kernel::kernel_entry(core::ptr::null()) }
}
