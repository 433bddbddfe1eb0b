//! File descriptor table.
//!
//! One fixed global table for the whole system; per-task tables are a
//! planned extension. A descriptor owns its offset and open flags and
//! holds the node alive through its `Arc<dyn NodeOps>`.

use super::node::{OpenFlags, VfsNode};
use crate::sync::SpinLock;

/// Size of the descriptor table.
pub const MAX_OPEN_FILES: usize = 32;

/// An open file: node, cursor, mode.
pub struct OpenFile {
    pub node: VfsNode,
    pub offset: u64,
    pub flags: OpenFlags,
    pub ref_count: u32,
}

static FILE_TABLE: SpinLock<[Option<OpenFile>; MAX_OPEN_FILES]> =
    SpinLock::new([const { None }; MAX_OPEN_FILES]);

/// Clear the table.
pub fn init() {
    let mut table = FILE_TABLE.lock();
    for slot in table.iter_mut() {
        *slot = None;
    }
}

/// Allocate the lowest free descriptor for `node`.
pub fn alloc_fd(node: VfsNode, flags: OpenFlags) -> Option<i32> {
    let mut table = FILE_TABLE.lock();
    let slot = table.iter().position(|slot| slot.is_none())?;
    table[slot] = Some(OpenFile {
        node,
        offset: 0,
        flags,
        ref_count: 1,
    });
    Some(slot as i32)
}

/// Release a descriptor, returning the open file it held.
pub fn free_fd(fd: i32) -> Option<OpenFile> {
    if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
        return None;
    }
    FILE_TABLE.lock()[fd as usize].take()
}

/// Snapshot a descriptor's node and offset for an I/O operation. The
/// node is cloned so the table lock is not held across device access.
pub fn node_and_offset(fd: i32) -> Option<(VfsNode, u64)> {
    if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
        return None;
    }
    let table = FILE_TABLE.lock();
    table[fd as usize]
        .as_ref()
        .map(|file| (file.node.clone(), file.offset))
}

/// Move a descriptor's offset forward by `delta` bytes.
pub fn advance(fd: i32, delta: u64) {
    if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
        return;
    }
    if let Some(file) = FILE_TABLE.lock()[fd as usize].as_mut() {
        file.offset += delta;
    }
}

/// Set a descriptor's absolute offset.
pub fn set_offset(fd: i32, offset: u64) -> Option<()> {
    if !(0..MAX_OPEN_FILES as i32).contains(&fd) {
        return None;
    }
    FILE_TABLE.lock()[fd as usize].as_mut().map(|file| {
        file.offset = offset;
    })
}

/// Number of descriptors currently in use.
pub fn open_count() -> usize {
    FILE_TABLE.lock().iter().filter(|slot| slot.is_some()).count()
}
