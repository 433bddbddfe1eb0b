//! Kernel heap.
//!
//! A single doubly-linked list of header-prefixed blocks over a growable
//! arena in the higher half. Allocation is first fit with splitting;
//! free eagerly coalesces with each adjacent free neighbor; when nothing
//! fits, the arena grows by mapping fresh frames and appending the new
//! space as a free block.
//!
//! The heap also backs `#[global_allocator]`, so `alloc::*` collections
//! work everywhere in the kernel. All entry points mask interrupts
//! around the heap lock: the timer path may allocate (scheduler queue
//! growth) and must never find the lock held by the code it interrupted.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use super::{frame, page_align_up, paging, PAGE_SIZE};
use crate::sync::SpinLock;

/// Tag carried by every live block header.
const HEAP_MAGIC: u32 = 0x4845_4150;
/// Smallest block (header + minimum payload).
const MIN_BLOCK_SIZE: usize = 64;
/// Payload alignment guaranteed by plain allocation.
const PAYLOAD_ALIGN: usize = 8;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Virtual base of the heap arena.
pub const HEAP_BASE: u64 = 0xFFFF_8002_0000_0000;
/// Initial arena size mapped at init.
pub const HEAP_INITIAL_SIZE: usize = 16 * 1024 * 1024;

/// Header preceding every block's payload.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    /// Total block size including this header.
    size: u32,
    free: bool,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
}

pub struct KernelHeap {
    start: u64,
    end: u64,
    size: usize,
    first: *mut BlockHeader,
    allocations: u32,
}

// SAFETY: the raw block pointers all point into the heap arena, which is
// exclusively owned by the KernelHeap behind its lock.
unsafe impl Send for KernelHeap {}

static HEAP: SpinLock<Option<KernelHeap>> = SpinLock::new(None);

impl KernelHeap {
    /// Map `additional` bytes (page-rounded) at the end of the arena.
    fn expand(&mut self, additional: usize) -> Result<usize, &'static str> {
        let additional = page_align_up(additional as u64) as usize;
        let pages = additional / PAGE_SIZE;

        for i in 0..pages {
            let phys = frame::alloc_frame().ok_or("out of physical memory")?;
            let virt = VirtAddr::new(self.end + (i * PAGE_SIZE) as u64);
            if let Err(e) = paging::map_page(
                virt,
                phys,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            ) {
                frame::free_frame(phys);
                return Err(e);
            }
        }

        self.end += additional as u64;
        self.size += additional;
        Ok(additional)
    }

    /// Append a free block covering `[base, base + size)` to the list,
    /// then merge it into the previous tail when adjacent and free.
    ///
    /// # Safety
    /// The range must be mapped, inside the arena, and unused.
    unsafe fn append_free_block(&mut self, base: u64, size: usize) {
        let block = base as *mut BlockHeader;
        unsafe {
            (*block).magic = HEAP_MAGIC;
            (*block).size = size as u32;
            (*block).free = true;
            (*block).next = ptr::null_mut();
            (*block).prev = ptr::null_mut();

            if self.first.is_null() {
                self.first = block;
                return;
            }
            let mut tail = self.first;
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = block;
            (*block).prev = tail;
            self.merge_with_next(tail);
        }
    }

    /// First free block of at least `total` bytes.
    fn find_free_block(&self, total: usize) -> Option<*mut BlockHeader> {
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list nodes live in the arena; validated by magic.
            unsafe {
                if (*current).magic != HEAP_MAGIC {
                    log::error!("heap corruption at {:#x}", current as u64);
                    return None;
                }
                if (*current).free && (*current).size as usize >= total {
                    return Some(current);
                }
                current = (*current).next;
            }
        }
        None
    }

    /// Split `block` so it is exactly `total` bytes, when the remainder
    /// can still host a viable free block.
    ///
    /// # Safety
    /// `block` must be a live header with `size >= total`.
    unsafe fn split_block(&mut self, block: *mut BlockHeader, total: usize) {
        unsafe {
            let old_size = (*block).size as usize;
            if old_size < total + MIN_BLOCK_SIZE {
                return;
            }

            let remainder = (block as *mut u8).add(total) as *mut BlockHeader;
            (*remainder).magic = HEAP_MAGIC;
            (*remainder).size = (old_size - total) as u32;
            (*remainder).free = true;
            (*remainder).next = (*block).next;
            (*remainder).prev = block;

            if !(*block).next.is_null() {
                (*(*block).next).prev = remainder;
            }
            (*block).next = remainder;
            (*block).size = total as u32;
        }
    }

    /// Merge `block` with its immediate successor when both are free and
    /// physically adjacent.
    ///
    /// # Safety
    /// `block` must be a live header.
    unsafe fn merge_with_next(&mut self, block: *mut BlockHeader) {
        unsafe {
            let next = (*block).next;
            if next.is_null() || !(*block).free || !(*next).free {
                return;
            }
            let adjacent = (block as *mut u8).add((*block).size as usize) as *mut BlockHeader;
            if adjacent != next {
                // A gap from a separate arena growth; leave both alone.
                return;
            }
            (*block).size += (*next).size;
            (*block).next = (*next).next;
            if !(*next).next.is_null() {
                (*(*next).next).prev = block;
            }
        }
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let total = (HEADER_SIZE + size).max(MIN_BLOCK_SIZE);
        let total = (total + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1);

        let block = match self.find_free_block(total) {
            Some(block) => block,
            None => {
                // Grow by at least a page and at least twice the request
                // so a run of same-size allocations does not grow per call.
                let grow = (total * 2).max(PAGE_SIZE);
                let base = self.end;
                let grown = match self.expand(grow) {
                    Ok(grown) => grown,
                    Err(e) => {
                        log::warn!("heap exhausted and cannot grow: {}", e);
                        return ptr::null_mut();
                    }
                };
                // SAFETY: [base, base + grown) was just mapped for the heap.
                unsafe {
                    self.append_free_block(base, grown);
                }
                match self.find_free_block(total) {
                    Some(block) => block,
                    None => return ptr::null_mut(),
                }
            }
        };

        // SAFETY: find_free_block returned a live free header.
        unsafe {
            self.split_block(block, total);
            (*block).free = false;
            self.allocations += 1;
            (block as *mut u8).add(HEADER_SIZE)
        }
    }

    fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        // SAFETY: a valid payload pointer is preceded by its header; the
        // magic check rejects anything else before we trust the fields.
        unsafe {
            let block = payload.sub(HEADER_SIZE) as *mut BlockHeader;
            if (*block).magic != HEAP_MAGIC {
                log::error!("free of invalid pointer {:#x} (bad magic)", payload as u64);
                return;
            }
            if (*block).free {
                log::error!("double free at {:#x}", payload as u64);
                return;
            }
            (*block).free = true;
            self.allocations -= 1;

            // Eager coalescing with each adjacent free neighbor.
            self.merge_with_next(block);
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).free {
                self.merge_with_next(prev);
            }
        }
    }

    fn realloc(&mut self, payload: *mut u8, new_size: usize) -> *mut u8 {
        if payload.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(payload);
            return ptr::null_mut();
        }

        // SAFETY: as in free(), the header precedes the payload.
        unsafe {
            let block = payload.sub(HEADER_SIZE) as *mut BlockHeader;
            if (*block).magic != HEAP_MAGIC {
                log::error!("realloc of invalid pointer {:#x}", payload as u64);
                return ptr::null_mut();
            }
            let current_payload = (*block).size as usize - HEADER_SIZE;
            if new_size <= current_payload {
                return payload;
            }

            let new_payload = self.alloc(new_size);
            if new_payload.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(payload, new_payload, current_payload);
            self.free(payload);
            new_payload
        }
    }

    /// (total, used) in bytes. Used counts whole blocks, headers included.
    fn usage(&self) -> (usize, usize) {
        let mut used = 0usize;
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: walking the list under the heap lock.
            unsafe {
                if !(*current).free {
                    used += (*current).size as usize;
                }
                current = (*current).next;
            }
        }
        (self.size, used)
    }

    /// Walk the whole list checking magic tags, sibling links, and that
    /// block sizes sum to the arena size. Adjacent free pairs (missed
    /// coalescing) also fail the check.
    fn validate(&self) -> bool {
        let mut current = self.first;
        let mut count = 0usize;
        let mut accounted = 0usize;
        while !current.is_null() {
            // SAFETY: walking the list under the heap lock.
            unsafe {
                if (*current).magic != HEAP_MAGIC {
                    log::error!("heap validate: bad magic at block {}", count);
                    return false;
                }
                let next = (*current).next;
                if !next.is_null() {
                    if (*next).prev != current {
                        log::error!("heap validate: broken sibling link at block {}", count);
                        return false;
                    }
                    let adjacent =
                        (current as *mut u8).add((*current).size as usize) as *mut BlockHeader;
                    if adjacent == next && (*current).free && (*next).free {
                        log::error!("heap validate: uncoalesced free pair at block {}", count);
                        return false;
                    }
                }
                accounted += (*current).size as usize;
                count += 1;
                if count > 1_000_000 {
                    log::error!("heap validate: list does not terminate");
                    return false;
                }
                current = next;
            }
        }
        if accounted != self.size {
            log::error!(
                "heap validate: blocks cover {} bytes of a {} byte arena",
                accounted,
                self.size
            );
            return false;
        }
        true
    }
}

/// Map the initial arena and set up the single all-free block.
pub fn init(start: u64, initial_size: usize) {
    let mut heap = KernelHeap {
        start,
        end: start,
        size: 0,
        first: ptr::null_mut(),
        allocations: 0,
    };

    let grown = heap.expand(initial_size).expect("cannot map initial heap");
    // SAFETY: the freshly mapped range is exclusively the heap's.
    unsafe {
        heap.append_free_block(start, grown);
    }

    log::info!(
        "heap: {} KiB arena at {:#x}",
        heap.size / 1024,
        heap.start
    );

    x86_64::instructions::interrupts::without_interrupts(|| {
        *HEAP.lock() = Some(heap);
    });
}

fn with_heap<R>(f: impl FnOnce(&mut KernelHeap) -> R) -> Option<R> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut guard = HEAP.lock();
        guard.as_mut().map(f)
    })
}

/// Allocate `size` bytes with 8-byte alignment.
pub fn kmalloc(size: usize) -> *mut u8 {
    with_heap(|heap| heap.alloc(size)).unwrap_or(ptr::null_mut())
}

/// Allocate `size` zeroed bytes.
pub fn kzalloc(size: usize) -> *mut u8 {
    let payload = kmalloc(size);
    if !payload.is_null() {
        // SAFETY: kmalloc returned at least `size` usable bytes.
        unsafe {
            ptr::write_bytes(payload, 0, size);
        }
    }
    payload
}

/// Allocate with an arbitrary power-of-two alignment. The original
/// block pointer is stashed one word below the aligned payload so
/// [`kfree_aligned`] can recover it.
pub fn kmalloc_aligned(size: usize, align: usize) -> *mut u8 {
    if align <= PAYLOAD_ALIGN {
        return kmalloc(size);
    }
    let raw = kmalloc(size + align + PAYLOAD_ALIGN);
    if raw.is_null() {
        return ptr::null_mut();
    }
    let aligned = (raw as usize + PAYLOAD_ALIGN + align - 1) & !(align - 1);
    // SAFETY: aligned - 8 is inside the allocation (>= raw + 8 - 8).
    unsafe {
        *(aligned as *mut usize).sub(1) = raw as usize;
    }
    aligned as *mut u8
}

/// Free a [`kmalloc_aligned`] allocation.
pub fn kfree_aligned(payload: *mut u8, align: usize) {
    if align <= PAYLOAD_ALIGN {
        return kfree(payload);
    }
    if payload.is_null() {
        return;
    }
    // SAFETY: kmalloc_aligned stored the original pointer there.
    let raw = unsafe { *(payload as *mut usize).sub(1) } as *mut u8;
    kfree(raw);
}

/// Free a [`kmalloc`] allocation. `kfree(null)` is a no-op.
pub fn kfree(payload: *mut u8) {
    with_heap(|heap| heap.free(payload));
}

/// Resize an allocation. `krealloc(null, n)` allocates, `krealloc(p, 0)`
/// frees and returns null.
pub fn krealloc(payload: *mut u8, new_size: usize) -> *mut u8 {
    with_heap(|heap| heap.realloc(payload, new_size)).unwrap_or(ptr::null_mut())
}

/// (total, used) bytes for [`super::stats`].
pub fn counters() -> (usize, usize) {
    with_heap(|heap| heap.usage()).unwrap_or((0, 0))
}

/// Bytes currently allocated (headers included).
pub fn used() -> usize {
    counters().1
}

/// Number of live allocations.
pub fn allocation_count() -> u32 {
    with_heap(|heap| heap.allocations).unwrap_or(0)
}

/// Run the integrity check; true when the heap is well formed.
pub fn validate() -> bool {
    with_heap(|heap| heap.validate()).unwrap_or(false)
}

struct HeapAllocator;

// SAFETY: kmalloc/kfree provide valid, exclusive, sufficiently aligned
// allocations; alignment above 8 routes through the aligned variants.
unsafe impl GlobalAlloc for HeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= PAYLOAD_ALIGN {
            kmalloc(layout.size())
        } else {
            kmalloc_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= PAYLOAD_ALIGN {
            kfree(ptr);
        } else {
            kfree_aligned(ptr, layout.align());
        }
    }
}

#[global_allocator]
static GLOBAL_ALLOCATOR: HeapAllocator = HeapAllocator;
