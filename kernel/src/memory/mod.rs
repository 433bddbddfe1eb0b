//! Memory management: physical frames, paging, address spaces, heap.

pub mod address_space;
pub mod frame;
pub mod heap;
pub mod paging;
#[cfg(feature = "selftest")]
pub mod selftest;

use x86_64::{PhysAddr, VirtAddr};

use crate::boot::BootInfo;

/// Size of a page and of a frame.
pub const PAGE_SIZE: usize = 4096;

/// Base of the higher-half window through which the kernel sees all of
/// physical memory: `virt = phys + DIRECT_MAP_BASE`. The loader
/// establishes this mapping before handing over.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Virtual address a physical address is reachable at through the
/// direct map.
#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + DIRECT_MAP_BASE)
}

/// Inverse of [`phys_to_virt`] for direct-map addresses. Low addresses
/// are assumed identity-mapped boot leftovers and pass through.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    let raw = virt.as_u64();
    if raw >= DIRECT_MAP_BASE {
        PhysAddr::new(raw - DIRECT_MAP_BASE)
    } else {
        PhysAddr::new(raw)
    }
}

/// Round `addr` down to a page boundary.
#[inline]
pub fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round `addr` up to a page boundary.
#[inline]
pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub fn bytes_to_pages(bytes: u64) -> usize {
    bytes.div_ceil(PAGE_SIZE as u64) as usize
}

/// Point-in-time memory accounting across the allocators.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_memory: u64,
    pub free_memory: u64,
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub heap_total: usize,
    pub heap_used: usize,
}

/// Gather [`MemoryStats`] from the frame allocator and the heap.
pub fn stats() -> MemoryStats {
    let (total_frames, used_frames, total_memory) = frame::counters();
    let (heap_total, heap_used) = heap::counters();
    MemoryStats {
        total_memory,
        free_memory: (total_frames - used_frames) as u64 * PAGE_SIZE as u64,
        total_frames,
        used_frames,
        free_frames: total_frames - used_frames,
        heap_total,
        heap_used,
    }
}

/// Bring up physical memory management from the loader handoff.
pub fn init(boot_info: &BootInfo) {
    frame::init(boot_info.total_memory(), boot_info.kernel_end);
    paging::init();
}

pub use address_space::{kernel_address_space, AddressSpace};
pub use frame::{alloc_frame, alloc_zeroed_frame, frame_allocator, free_frame};
