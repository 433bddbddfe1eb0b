//! flatfs core logic: format, mount, inode and block accounting, file
//! and directory I/O.
//!
//! Allocation policy is eager allocate-on-write: every block a write
//! touches is allocated up front, and growth stops hard at the
//! direct-block fan-out. Block and inode usage is tracked in in-memory
//! bitmaps rebuilt from the inode table at mount; only the free counters
//! are persisted in the superblock.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use zerocopy::{FromBytes, IntoBytes};

use crate::block::BlockDevice;
use crate::error::FsError;
use crate::layout::{
    Dirent, Inode, InodeKind, Superblock, BLOCK_SIZE, DIRECT_BLOCKS, DIRENTS_PER_BLOCK,
    FLATFS_MAGIC, FLATFS_VERSION, INODES_PER_BLOCK, INODE_COUNT, INODE_SIZE,
    INODE_TABLE_BLOCKS, MAX_FILE_SIZE, ROOT_INODE,
};

#[inline]
fn bitmap_set(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

#[inline]
fn bitmap_clear(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

#[inline]
fn bitmap_test(bitmap: &[u8], bit: usize) -> bool {
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

/// A mounted flatfs volume.
pub struct FlatFs {
    device: Arc<dyn BlockDevice>,
    superblock: Superblock,
    block_bitmap: Vec<u8>,
    inode_bitmap: Vec<u8>,
}

impl FlatFs {
    /// Write a fresh filesystem onto `device`: superblock, zeroed inode
    /// table, and a root directory (inode 0) with one data block.
    pub fn format(device: &dyn BlockDevice) -> Result<(), FsError> {
        if device.block_size() != BLOCK_SIZE {
            return Err(FsError::Corrupted);
        }
        let block_count = device.block_count() as u32;
        let first_data_block = 1 + INODE_TABLE_BLOCKS;
        if block_count <= first_data_block + 1 {
            return Err(FsError::OutOfBlocks);
        }

        let mut sb = Superblock {
            magic: FLATFS_MAGIC,
            version: FLATFS_VERSION,
            block_size: BLOCK_SIZE as u32,
            block_count,
            inode_count: INODE_COUNT,
            first_inode_block: 1,
            first_data_block,
            free_blocks: block_count - first_data_block,
            free_inodes: INODE_COUNT,
            reserved: [0; BLOCK_SIZE - 9 * 4],
        };
        device.write_block(0, sb.as_bytes())?;

        // Zero the whole inode table.
        let zero = [0u8; BLOCK_SIZE];
        for i in 0..INODE_TABLE_BLOCKS {
            device.write_block((sb.first_inode_block + i) as u64, &zero)?;
        }

        // Root directory: inode 0, one empty data block.
        let mut root = Inode::empty();
        root.number = ROOT_INODE;
        root.kind = InodeKind::Directory as u32;
        root.blocks = 1;
        root.direct[0] = first_data_block;

        let mut table_block = [0u8; BLOCK_SIZE];
        table_block[..INODE_SIZE].copy_from_slice(root.as_bytes());
        device.write_block(sb.first_inode_block as u64, &table_block)?;
        device.write_block(first_data_block as u64, &zero)?;

        // Account for the root inode and its directory block.
        sb.free_inodes -= 1;
        sb.free_blocks -= 1;
        device.write_block(0, sb.as_bytes())?;

        Ok(())
    }

    /// Mount an already-formatted device: validate the superblock and
    /// rebuild the block/inode bitmaps from the inode table.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<FlatFs, FsError> {
        let mut buf = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buf)?;
        let superblock = Superblock::parse(&buf)?;

        let block_count = superblock.block_count as usize;
        let mut fs = FlatFs {
            device,
            superblock,
            block_bitmap: vec![0u8; block_count.div_ceil(8)],
            inode_bitmap: vec![0u8; (INODE_COUNT as usize).div_ceil(8)],
        };

        // Superblock and inode table are always in use.
        for b in 0..fs.superblock.first_data_block as usize {
            bitmap_set(&mut fs.block_bitmap, b);
        }
        // Walk the inode table and mark live inodes and their data blocks.
        for num in 0..INODE_COUNT {
            let inode = fs.read_inode(num)?;
            if inode.is_free() && num != ROOT_INODE {
                continue;
            }
            bitmap_set(&mut fs.inode_bitmap, num as usize);
            for &block in inode.direct.iter() {
                if block != 0 && (block as usize) < block_count {
                    bitmap_set(&mut fs.block_bitmap, block as usize);
                }
            }
        }

        Ok(fs)
    }

    /// The cached superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// The backing device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Persist the superblock counters.
    pub fn flush_superblock(&self) -> Result<(), FsError> {
        self.device.write_block(0, self.superblock.as_bytes())?;
        Ok(())
    }

    fn inode_location(&self, num: u32) -> Result<(u64, usize), FsError> {
        if num >= self.superblock.inode_count {
            return Err(FsError::BadInode);
        }
        let block = self.superblock.first_inode_block as u64 + (num as usize / INODES_PER_BLOCK) as u64;
        let offset = (num as usize % INODES_PER_BLOCK) * INODE_SIZE;
        Ok((block, offset))
    }

    /// Read inode `num` from the table.
    pub fn read_inode(&self, num: u32) -> Result<Inode, FsError> {
        let (block, offset) = self.inode_location(num)?;
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(block, &mut buf)?;
        Inode::read_from_bytes(&buf[offset..offset + INODE_SIZE]).map_err(|_| FsError::Corrupted)
    }

    /// Write inode `num` back to the table (read-modify-write of its block).
    pub fn write_inode(&self, num: u32, inode: &Inode) -> Result<(), FsError> {
        let (block, offset) = self.inode_location(num)?;
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(block, &mut buf)?;
        buf[offset..offset + INODE_SIZE].copy_from_slice(inode.as_bytes());
        self.device.write_block(block, &buf)?;
        Ok(())
    }

    /// Allocate a data block; first-fit over the in-memory bitmap.
    pub fn alloc_block(&mut self) -> Result<u32, FsError> {
        let start = self.superblock.first_data_block as usize;
        let end = self.superblock.block_count as usize;
        for b in start..end {
            if !bitmap_test(&self.block_bitmap, b) {
                bitmap_set(&mut self.block_bitmap, b);
                self.superblock.free_blocks -= 1;
                return Ok(b as u32);
            }
        }
        Err(FsError::OutOfBlocks)
    }

    /// Return a data block to the free pool. Freeing a free block is
    /// reported as corruption rather than double-counted.
    pub fn free_block(&mut self, block: u32) -> Result<(), FsError> {
        let b = block as usize;
        if block < self.superblock.first_data_block || block >= self.superblock.block_count {
            return Err(FsError::Corrupted);
        }
        if !bitmap_test(&self.block_bitmap, b) {
            return Err(FsError::Corrupted);
        }
        bitmap_clear(&mut self.block_bitmap, b);
        self.superblock.free_blocks += 1;
        Ok(())
    }

    /// Allocate an inode number.
    pub fn alloc_inode(&mut self) -> Result<u32, FsError> {
        for num in 0..self.superblock.inode_count as usize {
            if !bitmap_test(&self.inode_bitmap, num) {
                bitmap_set(&mut self.inode_bitmap, num);
                self.superblock.free_inodes -= 1;
                return Ok(num as u32);
            }
        }
        Err(FsError::OutOfInodes)
    }

    /// Return an inode number to the free pool and clear it on disk.
    pub fn free_inode(&mut self, num: u32) -> Result<(), FsError> {
        if num == ROOT_INODE || num >= self.superblock.inode_count {
            return Err(FsError::BadInode);
        }
        if !bitmap_test(&self.inode_bitmap, num as usize) {
            return Err(FsError::Corrupted);
        }
        bitmap_clear(&mut self.inode_bitmap, num as usize);
        self.superblock.free_inodes += 1;
        self.write_inode(num, &Inode::empty())
    }

    /// Read from a regular file. The request is clamped to the file size;
    /// reads at or past EOF return 0.
    pub fn read_file(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if inode.kind() != Some(InodeKind::File) {
            return Err(FsError::WrongKind);
        }
        let size = inode.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let to_read = core::cmp::min(buf.len() as u64, size - offset) as usize;

        let mut done = 0usize;
        let mut block_buf = [0u8; BLOCK_SIZE];
        while done < to_read {
            let pos = offset as usize + done;
            let index = pos / BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let chunk = core::cmp::min(to_read - done, BLOCK_SIZE - in_block);

            if index >= DIRECT_BLOCKS {
                break;
            }
            let physical = inode.direct[index];
            if physical == 0 {
                break; // sparse hole at EOF
            }
            self.device.read_block(physical as u64, &mut block_buf)?;
            buf[done..done + chunk].copy_from_slice(&block_buf[in_block..in_block + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Write to a regular file, allocating blocks eagerly. The write is
    /// clamped to the direct-block fan-out; a write entirely past it
    /// fails with `FileTooBig`.
    pub fn write_file(
        &mut self,
        inode_num: u32,
        offset: u64,
        data: &[u8],
        now: u32,
    ) -> Result<usize, FsError> {
        let mut inode = self.read_inode(inode_num)?;
        if inode.kind() != Some(InodeKind::File) {
            return Err(FsError::WrongKind);
        }
        if offset >= MAX_FILE_SIZE as u64 {
            return Err(FsError::FileTooBig);
        }
        let to_write = core::cmp::min(data.len() as u64, MAX_FILE_SIZE as u64 - offset) as usize;

        let mut done = 0usize;
        let mut block_buf = [0u8; BLOCK_SIZE];
        while done < to_write {
            let pos = offset as usize + done;
            let index = pos / BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let chunk = core::cmp::min(to_write - done, BLOCK_SIZE - in_block);

            if inode.direct[index] == 0 {
                inode.direct[index] = self.alloc_block()?;
                inode.blocks += 1;
                // Fresh block: no need to read garbage back first.
                block_buf.fill(0);
            } else if chunk < BLOCK_SIZE {
                self.device
                    .read_block(inode.direct[index] as u64, &mut block_buf)?;
            }
            block_buf[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);
            self.device.write_block(inode.direct[index] as u64, &block_buf)?;
            done += chunk;
        }

        let end = (offset as usize + done) as u32;
        if end > inode.size {
            inode.size = end;
        }
        inode.mtime = now;
        self.write_inode(inode_num, &inode)?;
        self.flush_superblock()?;
        Ok(done)
    }

    /// Read the directory entry at `index` in `dir`'s first data block.
    /// Returns `None` for a free slot or an index past the block.
    pub fn read_dir_entry(&self, dir: &Inode, index: usize) -> Result<Option<Dirent>, FsError> {
        if dir.kind() != Some(InodeKind::Directory) {
            return Err(FsError::WrongKind);
        }
        if index >= DIRENTS_PER_BLOCK || dir.direct[0] == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(dir.direct[0] as u64, &mut buf)?;
        let start = index * core::mem::size_of::<Dirent>();
        let entry = Dirent::read_from_bytes(&buf[start..start + core::mem::size_of::<Dirent>()])
            .map_err(|_| FsError::Corrupted)?;
        if entry.is_free() {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    /// Find a child of `dir` by name, scanning every slot (free slots in
    /// the middle do not terminate the search).
    pub fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<Dirent>, FsError> {
        if dir.kind() != Some(InodeKind::Directory) {
            return Err(FsError::WrongKind);
        }
        if dir.direct[0] == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(dir.direct[0] as u64, &mut buf)?;
        for index in 0..DIRENTS_PER_BLOCK {
            let start = index * core::mem::size_of::<Dirent>();
            let entry =
                Dirent::read_from_bytes(&buf[start..start + core::mem::size_of::<Dirent>()])
                    .map_err(|_| FsError::Corrupted)?;
            if !entry.is_free() && entry.name_str() == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Create a file or directory under `parent`. Directories get one
    /// zeroed data block up front. Returns the new inode number.
    pub fn create(
        &mut self,
        parent_num: u32,
        name: &str,
        kind: InodeKind,
        now: u32,
    ) -> Result<u32, FsError> {
        if kind == InodeKind::Free {
            return Err(FsError::WrongKind);
        }
        let mut parent = self.read_inode(parent_num)?;
        if parent.kind() != Some(InodeKind::Directory) {
            return Err(FsError::WrongKind);
        }
        if self.lookup(&parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        // Find a free dirent slot before committing any allocation.
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(parent.direct[0] as u64, &mut buf)?;
        let mut slot = None;
        for index in 0..DIRENTS_PER_BLOCK {
            let start = index * core::mem::size_of::<Dirent>();
            let entry =
                Dirent::read_from_bytes(&buf[start..start + core::mem::size_of::<Dirent>()])
                    .map_err(|_| FsError::Corrupted)?;
            if entry.is_free() {
                slot = Some(start);
                break;
            }
        }
        let slot = slot.ok_or(FsError::DirectoryFull)?;

        let num = self.alloc_inode()?;
        let mut inode = Inode::empty();
        inode.number = num;
        inode.kind = kind as u32;
        inode.ctime = now;
        inode.mtime = now;
        if kind == InodeKind::Directory {
            match self.alloc_block() {
                Ok(block) => {
                    inode.direct[0] = block;
                    inode.blocks = 1;
                    let zero = [0u8; BLOCK_SIZE];
                    self.device.write_block(block as u64, &zero)?;
                }
                Err(e) => {
                    // Roll the inode back so a failed create leaves the
                    // volume unchanged.
                    self.free_inode(num)?;
                    return Err(e);
                }
            }
        }
        self.write_inode(num, &inode)?;

        let entry = Dirent::new(num, name, kind)?;
        buf[slot..slot + core::mem::size_of::<Dirent>()].copy_from_slice(entry.as_bytes());
        self.device.write_block(parent.direct[0] as u64, &buf)?;

        parent.size += core::mem::size_of::<Dirent>() as u32;
        parent.mtime = now;
        self.write_inode(parent_num, &parent)?;
        self.flush_superblock()?;
        Ok(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;

    fn fresh_fs(blocks: u64) -> FlatFs {
        let disk = Arc::new(MemDisk::new(BLOCK_SIZE, blocks));
        FlatFs::format(disk.as_ref()).unwrap();
        FlatFs::mount(disk).unwrap()
    }

    #[test]
    fn format_writes_a_mountable_volume() {
        let fs = fresh_fs(1024);
        let sb = fs.superblock();
        assert_eq!(sb.magic, FLATFS_MAGIC);
        assert_eq!(sb.first_inode_block, 1);
        assert_eq!(sb.first_data_block, 1 + INODE_TABLE_BLOCKS);
        // Root inode and its directory block are already accounted for.
        assert_eq!(sb.free_inodes, INODE_COUNT - 1);
        assert_eq!(sb.free_blocks, sb.block_count - sb.first_data_block - 1);

        let root = fs.read_inode(ROOT_INODE).unwrap();
        assert_eq!(root.kind(), Some(InodeKind::Directory));
        assert_eq!(root.size, 0);
        assert_eq!(root.blocks, 1);
    }

    #[test]
    fn mount_rejects_unformatted_device() {
        let disk = Arc::new(MemDisk::new(BLOCK_SIZE, 64));
        assert!(matches!(FlatFs::mount(disk), Err(FsError::InvalidMagic)));
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut fs = fresh_fs(1024);
        let num = fs.create(ROOT_INODE, "hello.txt", InodeKind::File, 1).unwrap();

        let payload = b"Hello, flatfs!";
        assert_eq!(fs.write_file(num, 0, payload, 2).unwrap(), payload.len());

        let inode = fs.read_inode(num).unwrap();
        assert_eq!(inode.size as usize, payload.len());
        assert_eq!(inode.mtime, 2);

        let mut back = [0u8; 64];
        let n = fs.read_file(&inode, 0, &mut back).unwrap();
        assert_eq!(&back[..n], payload);
    }

    #[test]
    fn read_after_seek_matches_single_read() {
        let mut fs = fresh_fs(1024);
        let num = fs.create(ROOT_INODE, "span.bin", InodeKind::File, 0).unwrap();

        // Payload crossing a block boundary.
        let mut payload = [0u8; 700];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        assert_eq!(fs.write_file(num, 0, &payload, 0).unwrap(), payload.len());

        let inode = fs.read_inode(num).unwrap();
        let mut all = [0u8; 700];
        assert_eq!(fs.read_file(&inode, 0, &mut all).unwrap(), 700);

        // read(seek(SET, k), n) == single read from k.
        let k = 300usize;
        let mut tail = [0u8; 300];
        assert_eq!(fs.read_file(&inode, k as u64, &mut tail).unwrap(), 300);
        assert_eq!(&tail[..], &all[k..k + 300]);
    }

    #[test]
    fn read_at_and_past_eof_is_clamped() {
        let mut fs = fresh_fs(1024);
        let num = fs.create(ROOT_INODE, "short", InodeKind::File, 0).unwrap();
        fs.write_file(num, 0, b"abcdef", 0).unwrap();
        let inode = fs.read_inode(num).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(fs.read_file(&inode, 6, &mut buf).unwrap(), 0);
        assert_eq!(fs.read_file(&inode, 100, &mut buf).unwrap(), 0);
        assert_eq!(fs.read_file(&inode, 4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn growth_stops_at_the_direct_fanout() {
        let mut fs = fresh_fs(1024);
        let num = fs.create(ROOT_INODE, "big", InodeKind::File, 0).unwrap();

        let chunk = [0x5Au8; MAX_FILE_SIZE];
        assert_eq!(fs.write_file(num, 0, &chunk, 0).unwrap(), MAX_FILE_SIZE);

        let inode = fs.read_inode(num).unwrap();
        assert_eq!(inode.size as usize, MAX_FILE_SIZE);
        assert_eq!(inode.blocks as usize, DIRECT_BLOCKS);

        // Entirely past the fan-out: hard error.
        assert!(matches!(
            fs.write_file(num, MAX_FILE_SIZE as u64, b"x", 0),
            Err(FsError::FileTooBig)
        ));
        // Straddling it: clamped.
        assert_eq!(
            fs.write_file(num, MAX_FILE_SIZE as u64 - 2, b"abcd", 0).unwrap(),
            2
        );
    }

    #[test]
    fn alloc_free_accounting_balances() {
        let mut fs = fresh_fs(1024);
        let free_blocks = fs.superblock().free_blocks;
        let free_inodes = fs.superblock().free_inodes;

        let b = fs.alloc_block().unwrap();
        let i = fs.alloc_inode().unwrap();
        assert_eq!(fs.superblock().free_blocks, free_blocks - 1);
        assert_eq!(fs.superblock().free_inodes, free_inodes - 1);

        fs.free_block(b).unwrap();
        fs.free_inode(i).unwrap();
        assert_eq!(fs.superblock().free_blocks, free_blocks);
        assert_eq!(fs.superblock().free_inodes, free_inodes);

        // Double free is corruption, not a counter bump.
        assert!(matches!(fs.free_block(b), Err(FsError::Corrupted)));
    }

    #[test]
    fn directory_listing_and_lookup() {
        let mut fs = fresh_fs(1024);
        fs.create(ROOT_INODE, "a", InodeKind::File, 0).unwrap();
        fs.create(ROOT_INODE, "b", InodeKind::Directory, 0).unwrap();
        fs.create(ROOT_INODE, "c", InodeKind::File, 0).unwrap();

        let root = fs.read_inode(ROOT_INODE).unwrap();
        let names: Vec<_> = (0..DIRENTS_PER_BLOCK)
            .filter_map(|i| fs.read_dir_entry(&root, i).unwrap())
            .map(|e| alloc::string::String::from(e.name_str()))
            .collect();
        assert_eq!(names, ["a", "b", "c"]);

        let b = fs.lookup(&root, "b").unwrap().unwrap();
        assert_eq!(b.kind, InodeKind::Directory as u32);
        assert!(fs.lookup(&root, "nope").unwrap().is_none());

        assert!(matches!(
            fs.create(ROOT_INODE, "a", InodeKind::File, 0),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn state_survives_remount() {
        let disk = Arc::new(MemDisk::new(BLOCK_SIZE, 1024));
        FlatFs::format(disk.as_ref()).unwrap();

        let (num, free_blocks) = {
            let mut fs = FlatFs::mount(disk.clone()).unwrap();
            let num = fs.create(ROOT_INODE, "persist", InodeKind::File, 7).unwrap();
            fs.write_file(num, 0, b"durable bytes", 8).unwrap();
            (num, fs.superblock().free_blocks)
        };

        let fs = FlatFs::mount(disk).unwrap();
        assert_eq!(fs.superblock().free_blocks, free_blocks);
        let root = fs.read_inode(ROOT_INODE).unwrap();
        let entry = fs.lookup(&root, "persist").unwrap().unwrap();
        assert_eq!(entry.inode, num);

        let inode = fs.read_inode(num).unwrap();
        let mut buf = [0u8; 32];
        let n = fs.read_file(&inode, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"durable bytes");
    }
}
