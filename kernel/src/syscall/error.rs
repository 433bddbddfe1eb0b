//! Kernel error taxonomy.
//!
//! Errors travel as values through `Result` inside the kernel and are
//! collapsed to −1 at the syscall boundary; nothing unwinds.

use num_enum::IntoPrimitive;

/// Every recoverable failure the kernel surfaces. Fatal conditions
/// (unhandled exceptions, corrupted heap) never reach this type; they
/// report and halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, thiserror::Error)]
#[repr(i64)]
pub enum KernelError {
    #[error("out of frames, heap space or table slots")]
    OutOfResources = 1,
    #[error("invalid argument")]
    InvalidArgument = 2,
    #[error("no such path, device or inode")]
    NotFound = 3,
    #[error("operation not permitted on this object")]
    PermissionOrMode = 4,
    #[error("hardware reported an error")]
    Hardware = 5,
}

/// Value returned to user mode for any error.
pub const SYSCALL_ERR: i64 = -1;

impl From<flatfs::BlockError> for KernelError {
    fn from(err: flatfs::BlockError) -> Self {
        use flatfs::BlockError;
        match err {
            BlockError::OutOfRange | BlockError::BufferTooSmall | BlockError::Misaligned => {
                KernelError::InvalidArgument
            }
            BlockError::Io | BlockError::Timeout | BlockError::DriveFault => KernelError::Hardware,
        }
    }
}

impl From<flatfs::FsError> for KernelError {
    fn from(err: flatfs::FsError) -> Self {
        use flatfs::FsError;
        match err {
            FsError::NotFound => KernelError::NotFound,
            FsError::OutOfInodes | FsError::OutOfBlocks | FsError::DirectoryFull => {
                KernelError::OutOfResources
            }
            FsError::WrongKind | FsError::AlreadyExists | FsError::FileTooBig => {
                KernelError::PermissionOrMode
            }
            FsError::NameTooLong | FsError::BufferTooSmall => KernelError::InvalidArgument,
            FsError::Block(block) => block.into(),
            FsError::InvalidMagic | FsError::UnsupportedVersion | FsError::BadInode
            | FsError::Corrupted => KernelError::Hardware,
        }
    }
}
