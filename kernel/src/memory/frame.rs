//! Physical frame allocator.
//!
//! One bit per 4 KiB frame, 0 = free. First-fit scan for single frames;
//! contiguous requests slide a window that jumps past any used bit it
//! meets. The bitmap is a fixed static sized for 4 GiB of managed RAM;
//! machines with more simply have the excess left unmanaged.

use x86_64::{PhysAddr, VirtAddr};

use super::{virt_to_phys, PAGE_SIZE};
use crate::sync::{SpinLock, SyncUnsafeCell};

/// Most physical memory the bitmap covers.
const MAX_MANAGED_MEMORY: u64 = 4 * 1024 * 1024 * 1024;
const MAX_FRAMES: usize = (MAX_MANAGED_MEMORY / PAGE_SIZE as u64) as usize;
const BITMAP_LEN: usize = MAX_FRAMES / 8;

/// Physical start of the kernel image.
const KERNEL_PHYS_START: u64 = 0x10_0000;

/// Backing storage for the bitmap, kept out of the allocator struct so
/// installing the allocator never moves 128 KiB across the boot stack.
static PAGE_BITMAP: SyncUnsafeCell<[u8; BITMAP_LEN]> = SyncUnsafeCell::new([0; BITMAP_LEN]);

/// The global frame allocator.
static FRAME_ALLOCATOR: SpinLock<Option<BitmapFrameAllocator>> = SpinLock::new(None);

/// Access the global allocator lock. Callers in interrupt context must
/// not take it while it may already be held.
pub fn frame_allocator() -> &'static SpinLock<Option<BitmapFrameAllocator>> {
    &FRAME_ALLOCATOR
}

pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u8; BITMAP_LEN],
    total_frames: usize,
    used_frames: usize,
    total_memory: u64,
}

impl BitmapFrameAllocator {
    #[inline]
    fn set(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    #[inline]
    fn clear(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    #[inline]
    fn test(&self, frame: usize) -> bool {
        self.bitmap[frame / 8] & (1 << (frame % 8)) != 0
    }

    /// Allocate one frame; first fit from the bottom.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        for frame in 0..self.total_frames {
            if !self.test(frame) {
                self.set(frame);
                self.used_frames += 1;
                return Some(PhysAddr::new(frame as u64 * PAGE_SIZE as u64));
            }
        }
        None
    }

    /// Allocate `count` physically contiguous frames.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || count > self.total_frames {
            return None;
        }
        let mut start = 0usize;
        while start + count <= self.total_frames {
            match (start..start + count).find(|&f| self.test(f)) {
                // Window is clean: take it.
                None => {
                    for f in start..start + count {
                        self.set(f);
                    }
                    self.used_frames += count;
                    return Some(PhysAddr::new(start as u64 * PAGE_SIZE as u64));
                }
                // Skip past the used bit that broke the window.
                Some(used) => start = used + 1,
            }
        }
        None
    }

    /// Release one frame. Freeing an already-free frame is a caller bug:
    /// report it and leave the bitmap untouched.
    pub fn free_frame(&mut self, addr: PhysAddr) {
        if addr.as_u64() == 0 {
            return;
        }
        let frame = (addr.as_u64() / PAGE_SIZE as u64) as usize;
        if frame >= self.total_frames {
            return;
        }
        if !self.test(frame) {
            log::warn!("double free of frame {:#x}", addr.as_u64());
            return;
        }
        self.clear(frame);
        self.used_frames -= 1;
    }

    /// Release `count` consecutive frames starting at `addr`.
    pub fn free_contiguous(&mut self, addr: PhysAddr, count: usize) {
        for i in 0..count {
            self.free_frame(addr + (i * PAGE_SIZE) as u64);
        }
    }

    /// Mark the frame containing `addr` as used (boot-time reservations).
    pub fn mark_used(&mut self, addr: PhysAddr) {
        let frame = (addr.as_u64() / PAGE_SIZE as u64) as usize;
        if frame >= self.total_frames {
            return;
        }
        if !self.test(frame) {
            self.set(frame);
            self.used_frames += 1;
        }
    }

    /// Mark `count` frames starting at `addr` as used.
    pub fn mark_used_range(&mut self, addr: PhysAddr, count: usize) {
        for i in 0..count {
            self.mark_used(addr + (i * PAGE_SIZE) as u64);
        }
    }

    /// Whether the frame containing `addr` is currently free.
    pub fn is_free(&self, addr: PhysAddr) -> bool {
        let frame = (addr.as_u64() / PAGE_SIZE as u64) as usize;
        frame < self.total_frames && !self.test(frame)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    pub fn free_memory(&self) -> u64 {
        self.free_frames() as u64 * PAGE_SIZE as u64
    }
}

/// Initialize the allocator over `[0, total_memory)` and pre-reserve
/// frame 0 (low-memory structures), the kernel image, and the bitmap.
pub fn init(total_memory: u64, kernel_end: u64) {
    let managed = total_memory.min(MAX_MANAGED_MEMORY);
    let total_frames = (managed / PAGE_SIZE as u64) as usize;

    // SAFETY: init runs once, single-threaded; the bitmap static is
    // only ever reachable through the allocator afterwards.
    let bitmap = unsafe { &mut *PAGE_BITMAP.get() };
    bitmap.fill(0);

    let mut allocator = BitmapFrameAllocator {
        bitmap,
        total_frames,
        used_frames: 0,
        total_memory: managed,
    };

    allocator.mark_used(PhysAddr::new(0));

    let kernel_size = kernel_end.saturating_sub(KERNEL_PHYS_START);
    let kernel_frames = super::bytes_to_pages(kernel_size);
    allocator.mark_used_range(PhysAddr::new(KERNEL_PHYS_START), kernel_frames);

    let bitmap_phys = virt_to_phys(VirtAddr::from_ptr(PAGE_BITMAP.get()));
    allocator.mark_used_range(bitmap_phys, super::bytes_to_pages(BITMAP_LEN as u64));

    log::info!(
        "PMM: managing {} MiB ({} frames), kernel occupies {} KiB ({} frames)",
        managed / (1024 * 1024),
        total_frames,
        kernel_size / 1024,
        kernel_frames,
    );
    log::info!(
        "PMM: {} frames used, {} frames free",
        allocator.used_frames(),
        allocator.free_frames(),
    );

    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

/// (total, used, total_memory) snapshot for [`super::stats`].
pub fn counters() -> (usize, usize, u64) {
    let guard = FRAME_ALLOCATOR.lock();
    match guard.as_ref() {
        Some(a) => (a.total_frames(), a.used_frames(), a.total_memory()),
        None => (0, 0, 0),
    }
}

/// Allocate one frame from the global allocator.
pub fn alloc_frame() -> Option<PhysAddr> {
    FRAME_ALLOCATOR.lock().as_mut()?.alloc_frame()
}

/// Allocate one frame and zero it through the direct map.
pub fn alloc_zeroed_frame() -> Option<PhysAddr> {
    let frame = alloc_frame()?;
    // SAFETY: a freshly allocated frame is exclusively ours and the
    // direct map covers all managed RAM.
    unsafe {
        core::ptr::write_bytes(
            super::phys_to_virt(frame).as_mut_ptr::<u8>(),
            0,
            PAGE_SIZE,
        );
    }
    Some(frame)
}

/// Return one frame to the global allocator.
pub fn free_frame(addr: PhysAddr) {
    if let Some(allocator) = FRAME_ALLOCATOR.lock().as_mut() {
        allocator.free_frame(addr);
    }
}
