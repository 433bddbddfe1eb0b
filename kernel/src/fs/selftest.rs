//! Runtime filesystem checks against the mounted root volume: resolve
//! the root, then push a file through the whole stack (VFS → flatfs →
//! block registry → ATA) and read it back.

use crate::vfs::{self, NodeKind, OpenFlags, SeekWhence};

fn root_is_directory() -> bool {
    match vfs::resolve("/") {
        Some(node) => node.kind == NodeKind::Directory,
        None => false,
    }
}

fn write_read_round_trip() -> bool {
    let Some(fs) = vfs::mount::root_filesystem() else {
        return false;
    };
    let path = "/selftest.txt";
    let payload = b"flatfs end to end\n";

    if vfs::resolve(path).is_none() && fs.create_file(path, 0o644).is_err() {
        return false;
    }

    let Ok(fd) = vfs::open(path, OpenFlags::WRITE) else {
        return false;
    };
    let wrote = vfs::write(fd, payload);
    let _ = vfs::close(fd);
    if wrote != Ok(payload.len()) {
        return false;
    }

    let Ok(fd) = vfs::open(path, OpenFlags::READ) else {
        return false;
    };
    let mut buf = [0u8; 64];
    let read_all = vfs::read(fd, &mut buf);
    if read_all != Ok(payload.len()) || &buf[..payload.len()] != payload {
        let _ = vfs::close(fd);
        return false;
    }

    // read after seek(SET, k) must match the same span of the full read.
    let k = 7usize;
    if vfs::seek(fd, k as i64, SeekWhence::Set) != Ok(k as u64) {
        let _ = vfs::close(fd);
        return false;
    }
    let mut tail = [0u8; 64];
    let read_tail = vfs::read(fd, &mut tail);
    let _ = vfs::close(fd);

    read_tail == Ok(payload.len() - k) && tail[..payload.len() - k] == buf[k..payload.len()]
}

/// Run the filesystem scenarios; skipped quietly when no disk is
/// mounted at `/`.
pub fn run() {
    if vfs::mount::root_node().is_none() {
        log::warn!("selftest: no root filesystem, skipping storage scenarios");
        return;
    }

    log::info!(
        "selftest: root resolve [{}]",
        if root_is_directory() { "ok" } else { "FAILED" }
    );
    log::info!(
        "selftest: write/read round trip [{}]",
        if write_read_round_trip() { "ok" } else { "FAILED" }
    );
}
