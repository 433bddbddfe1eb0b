//! Legacy ATA disk driver, PIO mode.
//!
//! Probes the four master/slave slots on the primary (0x1F0/0x3F6) and
//! secondary (0x170/0x376) buses with IDENTIFY and registers everything
//! that answers as a block device named `hd{a,b,c,d}`. Transfers are
//! one-sector polled PIO: LBA28 addressing, 256 words over the data
//! port, cache flush after every write.

use alloc::string::String;
use alloc::sync::Arc;

use flatfs::{BlockDevice, BlockError};

use crate::arch::x86_64::io::{inb, inw, outb, outw};
use crate::sync::SpinLock;

const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CONTROL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CONTROL: u16 = 0x376;

const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRIVE_SELECT: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_COMMAND: u16 = 7;

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_RDY: u8 = 0x40;
const STATUS_BSY: u8 = 0x80;

const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

/// Sector size; equals the filesystem block size.
const SECTOR_SIZE: usize = flatfs::BLOCK_SIZE;

/// Polling budget per wait, in ~1 µs spins.
const WAIT_BUDGET: u32 = 100_000;

/// One detected drive on one bus.
pub struct AtaDevice {
    name: String,
    io_base: u16,
    #[allow(dead_code)]
    control_base: u16,
    /// 0 = master, 1 = slave.
    drive: u8,
    sectors: u64,
    model: String,
    /// Serializes access to the channel's register file; a transfer must
    /// not interleave with another task's.
    lock: SpinLock<()>,
}

// SAFETY: all register access happens under `lock`.
unsafe impl Send for AtaDevice {}
unsafe impl Sync for AtaDevice {}

/// Spin until BSY clears and RDY sets, within the microsecond budget.
fn wait_ready(io_base: u16) -> Result<(), BlockError> {
    for _ in 0..WAIT_BUDGET {
        // SAFETY: status register read has no side effects.
        let status = unsafe { inb(io_base + REG_STATUS) };
        if status & STATUS_BSY == 0 && status & STATUS_RDY != 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(BlockError::Timeout)
}

/// Spin until the drive requests data; the error bit aborts.
fn wait_drq(io_base: u16) -> Result<(), BlockError> {
    for _ in 0..WAIT_BUDGET {
        // SAFETY: status register read has no side effects.
        let status = unsafe { inb(io_base + REG_STATUS) };
        if status & STATUS_ERR != 0 {
            return Err(BlockError::DriveFault);
        }
        if status & STATUS_DRQ != 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(BlockError::Timeout)
}

/// Model string as stored by IDENTIFY: byte-swapped words, space padded.
fn decode_model(words: &[u16; 256]) -> String {
    let mut model = String::with_capacity(40);
    for &word in &words[27..47] {
        model.push((word >> 8) as u8 as char);
        model.push((word & 0xFF) as u8 as char);
    }
    String::from(model.trim_end())
}

impl AtaDevice {
    /// Fingerprint the `drive` slot on the bus at `io_base`; `None` when
    /// nothing answers.
    fn identify(io_base: u16, drive: u8) -> Option<(u64, String)> {
        // SAFETY: documented IDENTIFY sequence against standard ports.
        unsafe {
            outb(io_base + REG_DRIVE_SELECT, 0xA0 | (drive << 4));
            for _ in 0..1000 {
                core::hint::spin_loop();
            }
            outb(io_base + REG_SECTOR_COUNT, 0);
            outb(io_base + REG_LBA_LOW, 0);
            outb(io_base + REG_LBA_MID, 0);
            outb(io_base + REG_LBA_HIGH, 0);
            outb(io_base + REG_COMMAND, CMD_IDENTIFY);

            if inb(io_base + REG_STATUS) == 0 {
                return None; // empty slot
            }
        }

        wait_ready(io_base).ok()?;
        wait_drq(io_base).ok()?;

        let mut words = [0u16; 256];
        for word in words.iter_mut() {
            // SAFETY: IDENTIFY leaves exactly 256 words in the data port.
            *word = unsafe { inw(io_base + REG_DATA) };
        }

        // LBA48 sector count when supported, LBA28 otherwise.
        let sectors = if words[83] & (1 << 10) != 0 {
            (words[100] as u64)
                | ((words[101] as u64) << 16)
                | ((words[102] as u64) << 32)
                | ((words[103] as u64) << 48)
        } else {
            (words[60] as u64) | ((words[61] as u64) << 16)
        };
        if sectors == 0 {
            return None;
        }

        Some((sectors, decode_model(&words)))
    }

    /// The model string reported by IDENTIFY.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Program drive select, sector count 1 and the LBA28 address bytes.
    fn select(&self, lba: u64) {
        // SAFETY: register writes under the channel lock.
        unsafe {
            outb(
                self.io_base + REG_DRIVE_SELECT,
                0xE0 | (self.drive << 4) | ((lba >> 24) & 0x0F) as u8,
            );
            outb(self.io_base + REG_SECTOR_COUNT, 1);
            outb(self.io_base + REG_LBA_LOW, lba as u8);
            outb(self.io_base + REG_LBA_MID, (lba >> 8) as u8);
            outb(self.io_base + REG_LBA_HIGH, (lba >> 16) as u8);
        }
    }

    fn read_one(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let _guard = self.lock.lock();
        wait_ready(self.io_base)?;
        self.select(lba);
        // SAFETY: command write under the channel lock.
        unsafe {
            outb(self.io_base + REG_COMMAND, CMD_READ_PIO);
        }
        wait_drq(self.io_base)?;

        for chunk in buf[..SECTOR_SIZE].chunks_exact_mut(2) {
            // SAFETY: DRQ is set; the drive serves 256 words.
            let word = unsafe { inw(self.io_base + REG_DATA) };
            chunk[0] = word as u8;
            chunk[1] = (word >> 8) as u8;
        }
        Ok(())
    }

    fn write_one(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        let _guard = self.lock.lock();
        wait_ready(self.io_base)?;
        self.select(lba);
        // SAFETY: command write under the channel lock.
        unsafe {
            outb(self.io_base + REG_COMMAND, CMD_WRITE_PIO);
        }
        wait_drq(self.io_base)?;

        for chunk in buf[..SECTOR_SIZE].chunks_exact(2) {
            let word = (chunk[0] as u16) | ((chunk[1] as u16) << 8);
            // SAFETY: DRQ is set; the drive expects 256 words.
            unsafe {
                outw(self.io_base + REG_DATA, word);
            }
        }

        // Push the write out of the drive cache before reporting success.
        // SAFETY: flush command under the channel lock.
        unsafe {
            outb(self.io_base + REG_COMMAND, CMD_CACHE_FLUSH);
        }
        wait_ready(self.io_base)
    }
}

impl BlockDevice for AtaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u64 {
        self.sectors
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if index >= self.sectors {
            return Err(BlockError::OutOfRange);
        }
        if buf.len() < SECTOR_SIZE {
            return Err(BlockError::BufferTooSmall);
        }
        self.read_one(index, buf)
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> Result<(), BlockError> {
        if index >= self.sectors {
            return Err(BlockError::OutOfRange);
        }
        if buf.len() < SECTOR_SIZE {
            return Err(BlockError::BufferTooSmall);
        }
        self.write_one(index, buf)
    }
}

/// Probe all four bus/drive slots and register what answers.
pub fn init() {
    let slots: [(u16, u16, u8); 4] = [
        (PRIMARY_IO, PRIMARY_CONTROL, 0),
        (PRIMARY_IO, PRIMARY_CONTROL, 1),
        (SECONDARY_IO, SECONDARY_CONTROL, 0),
        (SECONDARY_IO, SECONDARY_CONTROL, 1),
    ];

    let mut found = 0usize;
    for (slot, (io_base, control_base, drive)) in slots.iter().enumerate() {
        let Some((sectors, model)) = AtaDevice::identify(*io_base, *drive) else {
            continue;
        };

        let mut name = String::from("hd");
        name.push((b'a' + slot as u8) as char);
        log::info!(
            "ATA: {} is '{}' ({} sectors, {} MiB)",
            name,
            model,
            sectors,
            sectors * SECTOR_SIZE as u64 / (1024 * 1024),
        );

        super::block::register_device(Arc::new(AtaDevice {
            name,
            io_base: *io_base,
            control_base: *control_base,
            drive: *drive,
            sectors,
            model,
            lock: SpinLock::new(()),
        }));
        found += 1;
    }

    log::info!("ATA: {} drive(s) detected", found);
}
