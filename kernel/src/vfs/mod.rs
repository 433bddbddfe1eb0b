//! Virtual filesystem.
//!
//! Nodes carry an operation vector (`Arc<dyn NodeOps>`) so filesystems
//! plug in behind a uniform surface; the mount table maps `/` onto one
//! of them; descriptors come from a single fixed table. Path resolution
//! walks `finddir` component by component from the root.

pub mod fd;
pub mod mount;
pub mod node;

pub use fd::MAX_OPEN_FILES;
pub use mount::{mount, register_filesystem, resolve, unmount};
pub use node::{DirEntry, FileSystem, NodeKind, NodeOps, OpenFlags, VfsNode};

use crate::syscall::KernelError;

/// Seek anchors for [`seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

/// Reset all VFS state (descriptor table, mounts, registry).
pub fn init() {
    fd::init();
    mount::init();
    log::info!("VFS ready ({} descriptor slots)", MAX_OPEN_FILES);
}

/// Open `path` (absolute) and return a descriptor.
pub fn open(path: &str, flags: OpenFlags) -> Result<i32, KernelError> {
    let node = resolve(path).ok_or(KernelError::NotFound)?;
    node.ops.open(&node, flags)?;
    fd::alloc_fd(node, flags).ok_or(KernelError::OutOfResources)
}

/// Close a descriptor, invoking the node's close hook.
pub fn close(fd: i32) -> Result<(), KernelError> {
    let file = fd::free_fd(fd).ok_or(KernelError::InvalidArgument)?;
    file.node.ops.close(&file.node);
    Ok(())
}

/// Read from the descriptor's current offset, advancing it by the number
/// of bytes actually transferred.
pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize, KernelError> {
    let (node, offset) = fd::node_and_offset(fd).ok_or(KernelError::InvalidArgument)?;
    let transferred = node.ops.read(&node, offset, buf)?;
    fd::advance(fd, transferred as u64);
    Ok(transferred)
}

/// Write at the descriptor's current offset, advancing it by the number
/// of bytes actually transferred.
pub fn write(fd: i32, buf: &[u8]) -> Result<usize, KernelError> {
    let (node, offset) = fd::node_and_offset(fd).ok_or(KernelError::InvalidArgument)?;
    let transferred = node.ops.write(&node, offset, buf)?;
    fd::advance(fd, transferred as u64);
    Ok(transferred)
}

/// Reposition a descriptor. Returns the new absolute offset.
pub fn seek(fd: i32, offset: i64, whence: SeekWhence) -> Result<u64, KernelError> {
    let (node, current) = fd::node_and_offset(fd).ok_or(KernelError::InvalidArgument)?;
    let base = match whence {
        SeekWhence::Set => 0i64,
        SeekWhence::Current => current as i64,
        SeekWhence::End => node.size as i64,
    };
    let target = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
    if target < 0 {
        return Err(KernelError::InvalidArgument);
    }
    fd::set_offset(fd, target as u64).ok_or(KernelError::InvalidArgument)?;
    Ok(target as u64)
}

/// Node metadata for `path`. The returned node is a detached copy.
pub fn stat(path: &str) -> Result<VfsNode, KernelError> {
    resolve(path).ok_or(KernelError::NotFound)
}

/// Create a directory. The path is resolved by the root filesystem.
pub fn mkdir(path: &str, perms: u16) -> Result<(), KernelError> {
    let fs = mount::root_filesystem().ok_or(KernelError::NotFound)?;
    fs.create_dir(path, perms)
}

/// Directory entry at ordinal `index` of the directory open on `fd`.
pub fn readdir(fd: i32, index: usize) -> Result<Option<DirEntry>, KernelError> {
    let (node, _) = fd::node_and_offset(fd).ok_or(KernelError::InvalidArgument)?;
    if node.kind != NodeKind::Directory {
        return Err(KernelError::PermissionOrMode);
    }
    let child = node.ops.readdir(&node, index)?;
    Ok(child.map(|entry| DirEntry {
        inode: entry.inode,
        name: entry.name,
        kind: entry.kind,
    }))
}
