//! Filesystem error type.

use crate::block::BlockError;

/// Errors surfaced by flatfs operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("buffer too small for on-disk structure")]
    BufferTooSmall,
    #[error("bad superblock magic")]
    InvalidMagic,
    #[error("unsupported layout version")]
    UnsupportedVersion,
    #[error("inode number out of range")]
    BadInode,
    #[error("name not found")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("operation not valid for this node kind")]
    WrongKind,
    #[error("file name too long")]
    NameTooLong,
    #[error("no free inodes")]
    OutOfInodes,
    #[error("no free blocks")]
    OutOfBlocks,
    #[error("file would exceed the direct-block fan-out")]
    FileTooBig,
    #[error("directory is full")]
    DirectoryFull,
    #[error("on-disk structure is corrupted")]
    Corrupted,
    #[error("block device error: {0}")]
    Block(#[from] BlockError),
}
