//! The VFS node model and the traits filesystems implement.

use alloc::string::String;
use alloc::sync::Arc;

use crate::syscall::KernelError;

bitflags::bitflags! {
    /// Open-mode flags carried by a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND   = 1 << 4;
    }
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Device,
    Symlink,
}

/// A resolved filesystem object plus its operation vector.
///
/// Nodes are detached values: metadata is a snapshot taken at resolution
/// time, while data operations always go back through `ops` to the
/// filesystem (which re-reads the authoritative on-disk state).
#[derive(Clone)]
pub struct VfsNode {
    pub name: String,
    pub inode: u32,
    pub kind: NodeKind,
    pub size: u64,
    pub perms: u16,
    pub uid: u32,
    pub gid: u32,
    pub created: u64,
    pub modified: u64,
    pub ops: Arc<dyn NodeOps>,
}

/// One directory entry as returned by `readdir`.
#[derive(Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    pub kind: NodeKind,
}

/// The per-node operation vector. Defaults reject what a node kind does
/// not support, so filesystems only implement what applies.
pub trait NodeOps: Send + Sync {
    fn read(&self, _node: &VfsNode, _offset: u64, _buf: &mut [u8]) -> Result<usize, KernelError> {
        Err(KernelError::PermissionOrMode)
    }

    fn write(&self, _node: &VfsNode, _offset: u64, _buf: &[u8]) -> Result<usize, KernelError> {
        Err(KernelError::PermissionOrMode)
    }

    fn open(&self, _node: &VfsNode, _flags: OpenFlags) -> Result<(), KernelError> {
        Ok(())
    }

    fn close(&self, _node: &VfsNode) {}

    /// Child at ordinal `index`; `None` past the end or on a hole.
    fn readdir(&self, _node: &VfsNode, _index: usize) -> Result<Option<VfsNode>, KernelError> {
        Err(KernelError::PermissionOrMode)
    }

    /// Child by name.
    fn finddir(&self, _node: &VfsNode, _name: &str) -> Result<Option<VfsNode>, KernelError> {
        Err(KernelError::PermissionOrMode)
    }
}

/// A mountable filesystem driver.
pub trait FileSystem: Send + Sync {
    /// Driver name, e.g. `flatfs`.
    fn fs_name(&self) -> &str;

    /// The root directory node.
    fn root(&self) -> Result<VfsNode, KernelError>;

    /// Create a regular file at an absolute path within this filesystem.
    fn create_file(&self, _path: &str, _perms: u16) -> Result<(), KernelError> {
        Err(KernelError::PermissionOrMode)
    }

    /// Create a directory at an absolute path within this filesystem.
    fn create_dir(&self, _path: &str, _perms: u16) -> Result<(), KernelError> {
        Err(KernelError::PermissionOrMode)
    }
}
