//! Boot handoff types and defaults.

pub mod entry;

pub use entry::{BootInfo, MemoryKind, MemoryRegion};
