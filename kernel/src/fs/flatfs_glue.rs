//! flatfs behind the VFS node model.
//!
//! The filesystem logic itself lives in the `flatfs` component; this
//! module adapts it to [`FileSystem`] and [`NodeOps`]. A volume is one
//! `FlatFs` behind a mutex (writes mutate the allocation bitmaps), and
//! every node handed to the VFS carries an op vector pointing back at
//! that volume.

use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;

use flatfs::{BlockDevice, Dirent, FlatFs, InodeKind, ROOT_INODE};

use crate::arch::x86_64::timer;
use crate::syscall::KernelError;
use crate::vfs::{FileSystem, NodeKind, NodeOps, VfsNode};

/// Timestamps are seconds of uptime; there is no wall clock yet.
fn now_secs() -> u32 {
    (timer::uptime_ms() / 1000) as u32
}

fn node_kind(kind: u32) -> NodeKind {
    match InodeKind::from_raw(kind) {
        Some(InodeKind::Directory) => NodeKind::Directory,
        _ => NodeKind::File,
    }
}

/// A mounted flatfs volume exposed to the VFS.
pub struct FlatFsFileSystem {
    volume: Arc<Mutex<FlatFs>>,
}

impl FlatFsFileSystem {
    /// Write a fresh filesystem onto `device`.
    pub fn format(device: &dyn BlockDevice) -> Result<(), KernelError> {
        FlatFs::format(device)?;
        Ok(())
    }

    /// Mount `device` and wrap the volume for the VFS.
    pub fn mount_device(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>, KernelError> {
        let volume = FlatFs::mount(device)?;
        log::info!(
            "flatfs: mounted volume, {} free blocks / {} free inodes",
            volume.superblock().free_blocks,
            volume.superblock().free_inodes,
        );
        Ok(Arc::new(FlatFsFileSystem {
            volume: Arc::new(Mutex::new(volume)),
        }))
    }

    fn make_node(&self, name: &str, inode_num: u32) -> Result<VfsNode, KernelError> {
        let volume = self.volume.lock();
        let inode = volume.read_inode(inode_num)?;
        Ok(VfsNode {
            name: String::from(name),
            inode: inode_num,
            kind: node_kind(inode.kind),
            size: inode.size as u64,
            perms: 0o755,
            uid: 0,
            gid: 0,
            created: inode.ctime as u64,
            modified: inode.mtime as u64,
            ops: Arc::new(FlatFsNodeOps {
                volume: self.volume.clone(),
            }),
        })
    }

    /// Walk `path` (absolute within this volume) to the inode of its
    /// parent directory plus the final component.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u32, &'p str), KernelError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let mut dir = ROOT_INODE;
        let volume = self.volume.lock();
        loop {
            let Some(component) = components.next() else {
                return Err(KernelError::InvalidArgument);
            };
            if components.peek().is_none() {
                return Ok((dir, component));
            }
            let dir_inode = volume.read_inode(dir)?;
            let entry = volume
                .lookup(&dir_inode, component)?
                .ok_or(KernelError::NotFound)?;
            dir = entry.inode;
        }
    }

    fn create(&self, path: &str, kind: InodeKind) -> Result<(), KernelError> {
        let (parent, name) = self.resolve_parent(path)?;
        self.volume.lock().create(parent, name, kind, now_secs())?;
        Ok(())
    }
}

impl FileSystem for FlatFsFileSystem {
    fn fs_name(&self) -> &str {
        "flatfs"
    }

    fn root(&self) -> Result<VfsNode, KernelError> {
        self.make_node("/", ROOT_INODE)
    }

    fn create_file(&self, path: &str, _perms: u16) -> Result<(), KernelError> {
        self.create(path, InodeKind::File)
    }

    fn create_dir(&self, path: &str, _perms: u16) -> Result<(), KernelError> {
        self.create(path, InodeKind::Directory)
    }
}

/// Op vector shared by every node of one mounted volume.
struct FlatFsNodeOps {
    volume: Arc<Mutex<FlatFs>>,
}

impl FlatFsNodeOps {
    fn child_node(&self, entry: &Dirent) -> Result<VfsNode, KernelError> {
        let volume = self.volume.lock();
        let inode = volume.read_inode(entry.inode)?;
        Ok(VfsNode {
            name: String::from(entry.name_str()),
            inode: entry.inode,
            kind: node_kind(entry.kind),
            size: inode.size as u64,
            perms: 0o755,
            uid: 0,
            gid: 0,
            created: inode.ctime as u64,
            modified: inode.mtime as u64,
            ops: Arc::new(FlatFsNodeOps {
                volume: self.volume.clone(),
            }),
        })
    }
}

impl NodeOps for FlatFsNodeOps {
    fn read(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let volume = self.volume.lock();
        let inode = volume.read_inode(node.inode)?;
        Ok(volume.read_file(&inode, offset, buf)?)
    }

    fn write(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        let mut volume = self.volume.lock();
        Ok(volume.write_file(node.inode, offset, buf, now_secs())?)
    }

    fn readdir(&self, node: &VfsNode, index: usize) -> Result<Option<VfsNode>, KernelError> {
        let entry = {
            let volume = self.volume.lock();
            let dir = volume.read_inode(node.inode)?;
            volume.read_dir_entry(&dir, index)?
        };
        match entry {
            Some(entry) => Ok(Some(self.child_node(&entry)?)),
            None => Ok(None),
        }
    }

    fn finddir(&self, node: &VfsNode, name: &str) -> Result<Option<VfsNode>, KernelError> {
        let entry = {
            let volume = self.volume.lock();
            let dir = volume.read_inode(node.inode)?;
            volume.lookup(&dir, name)?
        };
        match entry {
            Some(entry) => Ok(Some(self.child_node(&entry)?)),
            None => Ok(None),
        }
    }
}
