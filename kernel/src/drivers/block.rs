//! Block-device registry.
//!
//! Drivers implement [`flatfs::BlockDevice`] and register here under a
//! name (`hda`, `mem0`, ...); filesystems look devices up by that name
//! at mount time. Byte-granular helpers live in the flatfs component
//! (`flatfs::read_bytes` / `flatfs::write_bytes`) and accept
//! block-aligned spans only.

use alloc::sync::Arc;
use alloc::vec::Vec;

use flatfs::BlockDevice;

use crate::sync::SpinLock;

static DEVICES: SpinLock<Vec<Arc<dyn BlockDevice>>> = SpinLock::new(Vec::new());

/// Add a device to the registry. Re-registering a name shadows the old
/// device for lookups by order of registration.
pub fn register_device(device: Arc<dyn BlockDevice>) {
    log::info!(
        "block: registered '{}' ({} blocks of {} bytes, {} MiB)",
        device.name(),
        device.block_count(),
        device.block_size(),
        device.total_bytes() / (1024 * 1024),
    );
    DEVICES.lock().push(device);
}

/// Look a device up by name.
pub fn get_device(name: &str) -> Option<Arc<dyn BlockDevice>> {
    DEVICES
        .lock()
        .iter()
        .find(|device| device.name() == name)
        .cloned()
}

/// Number of registered devices.
pub fn device_count() -> usize {
    DEVICES.lock().len()
}
