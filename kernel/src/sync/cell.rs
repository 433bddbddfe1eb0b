// UnsafeCell that can be placed in a static.
//
// Used for state whose synchronization is structural rather than lock
// based: fields owned by the scheduler lock, and tables written only
// with interrupts masked on this single CPU.

use core::cell::UnsafeCell;

pub struct SyncUnsafeCell<T> {
    inner: UnsafeCell<T>,
}

// SAFETY: callers uphold the access discipline documented at each use
// site (scheduler lock held, or interrupts masked on the only CPU).
unsafe impl<T> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    pub fn get(&self) -> *mut T {
        self.inner.get()
    }
}
