//! Kernel synchronization primitives.

pub mod cell;
pub mod spinlock;

pub use cell::SyncUnsafeCell;
pub use spinlock::{SpinLock, SpinLockGuard};
