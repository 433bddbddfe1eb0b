//! Device drivers: the block-device registry, the PIO ATA driver, and
//! the diagnostic console.

pub mod ata;
pub mod block;
pub mod console;
