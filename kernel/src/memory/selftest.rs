//! Runtime checks for the memory subsystem: frame round trip, heap
//! stress, map/translate. Runs once during bring-up, before tasking.

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use super::{frame, heap, paging};

fn check(name: &str, ok: bool) -> bool {
    if ok {
        log::info!("selftest: {} [ok]", name);
    } else {
        log::error!("selftest: {} [FAILED]", name);
    }
    ok
}

/// Allocate three frames, free the middle one, and confirm first-fit
/// hands it back; counters must return to their starting point.
fn frame_round_trip() -> bool {
    let initial_free = {
        let guard = frame::frame_allocator().lock();
        match guard.as_ref() {
            Some(a) => a.free_frames(),
            None => return false,
        }
    };

    let (Some(a), Some(b), Some(c)) = (frame::alloc_frame(), frame::alloc_frame(), frame::alloc_frame())
    else {
        return false;
    };

    frame::free_frame(b);
    {
        let guard = frame::frame_allocator().lock();
        let allocator = guard.as_ref().unwrap_or_else(|| unreachable!());
        if allocator.free_frames() != initial_free - 2 {
            return false;
        }
    }

    // First fit must return the hole we just punched.
    let Some(again) = frame::alloc_frame() else {
        return false;
    };
    if again != b {
        log::error!(
            "selftest: first fit returned {:#x}, expected {:#x}",
            again.as_u64(),
            b.as_u64()
        );
        return false;
    }

    frame::free_frame(a);
    frame::free_frame(again);
    frame::free_frame(c);

    let guard = frame::frame_allocator().lock();
    guard
        .as_ref()
        .map(|alloc| alloc.free_frames() == initial_free)
        .unwrap_or(false)
}

/// A burst of small allocations with live data, then release everything
/// and confirm usage returns to the baseline and the list validates.
fn heap_stress() -> bool {
    let used_before = heap::used();

    let p1 = heap::kmalloc(64);
    let p2 = heap::kmalloc(128);
    let p3 = heap::kmalloc(10 * core::mem::size_of::<u32>());
    if p1.is_null() || p2.is_null() || p3.is_null() {
        return false;
    }

    // SAFETY: each pointer owns at least the written length.
    unsafe {
        core::ptr::copy_nonoverlapping(b"Hello".as_ptr(), p1, 5);
        core::ptr::copy_nonoverlapping(b"World".as_ptr(), p2, 5);
        let ints = p3 as *mut u32;
        for i in 0..10u32 {
            ints.add(i as usize).write(i);
        }
        if core::slice::from_raw_parts(p1, 5) != b"Hello"
            || core::slice::from_raw_parts(p2, 5) != b"World"
            || ints.add(5).read() != 5
        {
            return false;
        }
    }

    heap::kfree(p1);
    heap::kfree(p2);
    heap::kfree(p3);

    heap::used() == used_before && heap::validate()
}

/// Map a scratch page, translate it back, exercise the mapping, unmap.
fn map_translate() -> bool {
    let virt = VirtAddr::new(0x40_0000);
    let Some(phys) = frame::alloc_frame() else {
        return false;
    };

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if paging::map_page(virt, phys, flags).is_err() {
        frame::free_frame(phys);
        return false;
    }

    let mut ok = paging::translate(virt) == Some(phys) && paging::is_mapped(virt);

    if ok {
        // The page must be user-inaccessible with these flags.
        ok = paging::flags_in(paging::kernel_pml4(), virt)
            .map(|f| !f.contains(PageTableFlags::USER_ACCESSIBLE))
            .unwrap_or(false);
    }

    if ok {
        // SAFETY: we just mapped this page read-write.
        unsafe {
            let p = virt.as_mut_ptr::<u64>();
            p.write_volatile(0xFE44_0C15);
            ok = p.read_volatile() == 0xFE44_0C15;
        }
    }

    paging::unmap_page(virt);
    frame::free_frame(phys);
    ok && !paging::is_mapped(virt)
}

/// Run all memory scenarios; failures are logged, not fatal.
pub fn run() {
    let mut all = true;
    all &= check("frame round trip", frame_round_trip());
    all &= check("heap stress", heap_stress());
    all &= check("map/translate", map_translate());
    if all {
        log::info!("selftest: memory suite passed");
    }
}
