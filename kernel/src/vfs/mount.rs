//! Filesystem registry, mount table and path resolution.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::node::{FileSystem, VfsNode};
use crate::sync::SpinLock;
use crate::syscall::KernelError;

/// Upper bound on simultaneous mounts.
pub const MAX_MOUNTS: usize = 8;

/// One active mount.
pub struct Mount {
    pub path: String,
    pub fs: Arc<dyn FileSystem>,
    pub root: VfsNode,
}

static REGISTERED: SpinLock<Vec<Arc<dyn FileSystem>>> = SpinLock::new(Vec::new());
static MOUNTS: SpinLock<Vec<Mount>> = SpinLock::new(Vec::new());

/// Clear registry and mount table.
pub fn init() {
    REGISTERED.lock().clear();
    MOUNTS.lock().clear();
}

/// Make a filesystem driver known by name.
pub fn register_filesystem(fs: Arc<dyn FileSystem>) {
    log::info!("VFS: registered filesystem '{}'", fs.fs_name());
    REGISTERED.lock().push(fs);
}

/// Look a registered filesystem up by name.
pub fn find_filesystem(name: &str) -> Option<Arc<dyn FileSystem>> {
    REGISTERED
        .lock()
        .iter()
        .find(|fs| fs.fs_name() == name)
        .cloned()
}

/// Mount `fs` at `path`. The mount at `/` becomes the resolution root;
/// other mount points are recorded but not yet traversed by `resolve`.
pub fn mount(path: &str, fs: Arc<dyn FileSystem>) -> Result<(), KernelError> {
    if !path.starts_with('/') {
        return Err(KernelError::InvalidArgument);
    }
    let root = fs.root()?;

    let mut mounts = MOUNTS.lock();
    if mounts.len() >= MAX_MOUNTS {
        return Err(KernelError::OutOfResources);
    }
    if mounts.iter().any(|m| m.path == path) {
        return Err(KernelError::InvalidArgument);
    }

    log::info!("VFS: mounted '{}' at '{}'", fs.fs_name(), path);
    mounts.push(Mount {
        path: String::from(path),
        fs,
        root,
    });
    Ok(())
}

/// Remove the mount at `path`.
pub fn unmount(path: &str) -> Result<(), KernelError> {
    let mut mounts = MOUNTS.lock();
    let index = mounts
        .iter()
        .position(|m| m.path == path)
        .ok_or(KernelError::NotFound)?;
    mounts.remove(index);
    log::info!("VFS: unmounted '{}'", path);
    Ok(())
}

/// The node mounted at `/`.
pub fn root_node() -> Option<VfsNode> {
    let mounts = MOUNTS.lock();
    mounts.iter().find(|m| m.path == "/").map(|m| m.root.clone())
}

/// The filesystem mounted at `/`.
pub fn root_filesystem() -> Option<Arc<dyn FileSystem>> {
    let mounts = MOUNTS.lock();
    mounts.iter().find(|m| m.path == "/").map(|m| m.fs.clone())
}

/// Resolve an absolute path to a node: split on `/` and ask each
/// directory for the next component. Any failure resolves to `None`.
pub fn resolve(path: &str) -> Option<VfsNode> {
    if !path.starts_with('/') {
        return None;
    }
    let mut current = root_node()?;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current = current
            .ops
            .clone()
            .finddir(&current, component)
            .ok()
            .flatten()?;
    }
    Some(current)
}
