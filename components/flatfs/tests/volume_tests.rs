//! End-to-end volume scenarios against an in-memory disk.

use std::sync::Arc;

use flatfs::{
    read_bytes, write_bytes, BlockDevice, BlockError, FlatFs, InodeKind, MemDisk, BLOCK_SIZE,
    FLATFS_MAGIC, ROOT_INODE,
};

/// A 10 MiB volume: format, mount, and check the root directory,
/// mirroring the kernel's mount-at-boot path.
#[test]
fn format_and_mount_ten_mib_volume() {
    let blocks = (10 * 1024 * 1024 / BLOCK_SIZE) as u64;
    let disk = Arc::new(MemDisk::new(BLOCK_SIZE, blocks));

    FlatFs::format(disk.as_ref()).unwrap();
    let fs = FlatFs::mount(disk).unwrap();

    assert_eq!(fs.superblock().magic, FLATFS_MAGIC);
    assert_eq!(fs.superblock().block_count as u64, blocks);

    let root = fs.read_inode(ROOT_INODE).unwrap();
    assert_eq!(root.kind(), Some(InodeKind::Directory));
    // The freshly formatted root is empty: its size is exactly what
    // format wrote.
    assert_eq!(root.size, 0);
    assert!(fs.read_dir_entry(&root, 0).unwrap().is_none());
}

/// format → mount → write(x) at 0 → read back the same bytes.
#[test]
fn write_read_round_trip_through_full_stack() {
    let disk = Arc::new(MemDisk::new(BLOCK_SIZE, 4096));
    FlatFs::format(disk.as_ref()).unwrap();
    let mut fs = FlatFs::mount(disk).unwrap();

    let num = fs
        .create(ROOT_INODE, "motd", InodeKind::File, 0)
        .unwrap();
    let text = b"The quick brown fox jumps over the lazy dog";
    assert_eq!(fs.write_file(num, 0, text, 1).unwrap(), text.len());

    let inode = fs.read_inode(num).unwrap();
    let mut buf = vec![0u8; text.len()];
    assert_eq!(fs.read_file(&inode, 0, &mut buf).unwrap(), text.len());
    assert_eq!(&buf[..], &text[..]);
}

/// The block-layer byte helpers reject partial-block accesses and move
/// aligned spans faithfully.
#[test]
fn byte_helpers_are_block_aligned_only() {
    let disk = MemDisk::new(BLOCK_SIZE, 64);

    let mut span = vec![0u8; BLOCK_SIZE * 2];
    for (i, b) in span.iter_mut().enumerate() {
        *b = (i % 13) as u8;
    }
    assert_eq!(
        write_bytes(&disk, BLOCK_SIZE as u64, &span).unwrap(),
        span.len()
    );

    let mut back = vec![0u8; BLOCK_SIZE * 2];
    assert_eq!(
        read_bytes(&disk, BLOCK_SIZE as u64, &mut back).unwrap(),
        back.len()
    );
    assert_eq!(back, span);

    assert_eq!(
        write_bytes(&disk, 7, &span),
        Err(BlockError::Misaligned)
    );
    assert_eq!(
        read_bytes(&disk, 0, &mut back[..BLOCK_SIZE - 1]),
        Err(BlockError::Misaligned)
    );
    assert_eq!(
        write_bytes(&disk, (disk.block_count() - 1) * BLOCK_SIZE as u64, &span),
        Err(BlockError::OutOfRange)
    );
}
