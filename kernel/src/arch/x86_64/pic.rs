//! 8259 programmable interrupt controller.
//!
//! Hardware IRQs power up mapped onto the CPU exception vectors; the
//! cascaded pair is remapped so IRQ 0-7 arrive at `offset_master` and
//! IRQ 8-15 at `offset_slave`.

use super::io::{inb, io_wait, outb};

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
/// Slave wired to the master's IRQ2 line.
const ICW3_SLAVE_ON_IRQ2: u8 = 0x04;
const ICW3_CASCADE_ID: u8 = 0x02;
const ICW4_8086_MODE: u8 = 0x01;

const COMMAND_EOI: u8 = 0x20;

/// Vector base for IRQ 0-7 after remapping.
pub const MASTER_OFFSET: u8 = 0x20;
/// Vector base for IRQ 8-15 after remapping.
pub const SLAVE_OFFSET: u8 = 0x28;

/// Remap both controllers to the given vector bases, preserving the
/// current IRQ masks across the init sequence.
pub fn init(offset_master: u8, offset_slave: u8) {
    // SAFETY: the ICW sequence below is the documented 8259 init dance.
    unsafe {
        let mask_master = inb(MASTER_DATA);
        let mask_slave = inb(SLAVE_DATA);

        outb(MASTER_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(SLAVE_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();

        outb(MASTER_DATA, offset_master);
        io_wait();
        outb(SLAVE_DATA, offset_slave);
        io_wait();

        outb(MASTER_DATA, ICW3_SLAVE_ON_IRQ2);
        io_wait();
        outb(SLAVE_DATA, ICW3_CASCADE_ID);
        io_wait();

        outb(MASTER_DATA, ICW4_8086_MODE);
        io_wait();
        outb(SLAVE_DATA, ICW4_8086_MODE);
        io_wait();

        outb(MASTER_DATA, mask_master);
        outb(SLAVE_DATA, mask_slave);
    }

    log::info!(
        "PIC remapped: IRQ0-7 -> {:#04x}..{:#04x}, IRQ8-15 -> {:#04x}..{:#04x}",
        offset_master,
        offset_master + 7,
        offset_slave,
        offset_slave + 7,
    );
}

/// Acknowledge `irq` so the controller will deliver the next one. The
/// slave needs its own EOI for IRQ 8-15.
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: writing EOI to the command ports only acknowledges.
    unsafe {
        if irq >= 8 {
            outb(SLAVE_COMMAND, COMMAND_EOI);
        }
        outb(MASTER_COMMAND, COMMAND_EOI);
    }
}

/// Mask (disable) a single IRQ line.
pub fn mask_irq(mut irq: u8) {
    let port = if irq < 8 {
        MASTER_DATA
    } else {
        irq -= 8;
        SLAVE_DATA
    };
    // SAFETY: read-modify-write of the interrupt mask register.
    unsafe {
        outb(port, inb(port) | (1 << irq));
    }
}

/// Unmask (enable) a single IRQ line.
pub fn unmask_irq(mut irq: u8) {
    let port = if irq < 8 {
        MASTER_DATA
    } else {
        irq -= 8;
        SLAVE_DATA
    };
    // SAFETY: read-modify-write of the interrupt mask register.
    unsafe {
        outb(port, inb(port) & !(1 << irq));
    }
}

/// Mask every IRQ on both controllers.
pub fn mask_all() {
    // SAFETY: an all-ones mask only disables delivery.
    unsafe {
        outb(MASTER_DATA, 0xFF);
        outb(SLAVE_DATA, 0xFF);
    }
}
