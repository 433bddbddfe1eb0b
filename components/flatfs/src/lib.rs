//! flatfs, the Ferrite-OS in-tree filesystem.
//!
//! A flat-table filesystem: one superblock, a fixed inode table, and a
//! data region addressed through direct block pointers only (no indirect
//! blocks, no journal). This crate holds everything that does not need a
//! kernel: the on-disk layout, the block-device abstraction, and the
//! filesystem logic itself, so the format can be exercised with plain
//! `cargo test` against an in-memory disk.
//!
//! The kernel wraps [`FlatFs`] behind its VFS node model and plugs real
//! block devices into the [`BlockDevice`] trait.

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod block;
pub mod error;
pub mod fs;
pub mod layout;

pub use block::{read_bytes, write_bytes, BlockDevice, BlockError, MemDisk};
pub use error::FsError;
pub use fs::FlatFs;
pub use layout::{
    Dirent, Inode, InodeKind, Superblock, BLOCK_SIZE, DIRECT_BLOCKS, FLATFS_MAGIC,
    FLATFS_VERSION, INODES_PER_BLOCK, INODE_COUNT, INODE_SIZE, INODE_TABLE_BLOCKS,
    MAX_FILENAME, MAX_FILE_SIZE, ROOT_INODE,
};
