//! Global Descriptor Table.
//!
//! Selector layout (the trap path and task construction bake these in):
//!
//! ```text
//! 0x00  null
//! 0x08  kernel code
//! 0x10  kernel data
//! 0x18  user code    (0x1B with RPL 3)
//! 0x20  user data    (0x23 with RPL 3)
//! 0x28  TSS          (16-byte descriptor, two slots)
//! ```

use core::mem::MaybeUninit;

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};

/// Kernel code selector.
pub const KERNEL_CODE: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DATA: u16 = 0x10;
/// User code selector with RPL 3.
pub const USER_CODE: u16 = 0x18 | 3;
/// User data selector with RPL 3.
pub const USER_DATA: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

static mut GDT: MaybeUninit<GlobalDescriptorTable> = MaybeUninit::uninit();

/// Build and load the GDT, reload every segment register, and load the
/// task register.
///
/// `tss::init` must have run first.
pub fn init() {
    // SAFETY: single-threaded init; the GDT storage is 'static and the
    // selectors below are exactly the ones append() hands back for this
    // insertion order.
    unsafe {
        let gdt_ptr = (&raw mut GDT).cast::<GlobalDescriptorTable>();
        gdt_ptr.write(GlobalDescriptorTable::new());
        let gdt = &mut *gdt_ptr;

        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let tss_sel = gdt.append(Descriptor::tss_segment(super::tss::tss()));

        debug_assert_eq!(kernel_code.0, KERNEL_CODE);
        debug_assert_eq!(kernel_data.0, KERNEL_DATA);
        debug_assert_eq!(user_code.0 | 3, USER_CODE);
        debug_assert_eq!(user_data.0 | 3, USER_DATA);
        debug_assert_eq!(tss_sel.0, TSS_SELECTOR);

        gdt.load_unsafe();

        // Reload all segment registers against the new table; CS is
        // reloaded with a far return inside set_reg.
        CS::set_reg(kernel_code);
        DS::set_reg(kernel_data);
        ES::set_reg(kernel_data);
        FS::set_reg(kernel_data);
        GS::set_reg(kernel_data);
        SS::set_reg(kernel_data);

        load_tss(tss_sel);
    }

    log::info!(
        "GDT loaded: kernel {:#04x}/{:#04x}, user {:#04x}/{:#04x}, TSS {:#04x}",
        KERNEL_CODE,
        KERNEL_DATA,
        USER_CODE,
        USER_DATA,
        TSS_SELECTOR,
    );
}
