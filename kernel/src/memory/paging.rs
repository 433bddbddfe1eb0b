//! 4-level page-table walk.
//!
//! Translation splits a canonical virtual address into four 9-bit table
//! indices and a 12-bit offset. The walk runs top table to leaf through
//! the direct map, so any address space can be edited without loading
//! its CR3. Missing intermediate tables are allocated, zeroed and
//! installed on the way down; after a leaf write exactly that page is
//! invalidated in the TLB.

use spin::Once;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use super::{frame, page_align_down, phys_to_virt, PAGE_SIZE};

/// Physical address of the kernel's top-level table, captured at init.
static KERNEL_PML4: Once<PhysAddr> = Once::new();

/// Flag bits an intermediate table may inherit from the leaf request.
const PARENT_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Capture the boot page tables as the kernel address space.
pub fn init() {
    let (frame, _) = Cr3::read();
    let pml4_phys = frame.start_address();
    KERNEL_PML4.call_once(|| pml4_phys);

    log::info!(
        "VMM: kernel PML4 at {:#x}, direct map at {:#x}",
        pml4_phys.as_u64(),
        super::DIRECT_MAP_BASE,
    );
}

/// Physical address of the kernel top-level table.
pub fn kernel_pml4() -> PhysAddr {
    *KERNEL_PML4.get().expect("paging not initialized")
}

/// Physical address of the currently loaded top-level table.
pub fn current_pml4() -> PhysAddr {
    let (frame, _) = Cr3::read();
    frame.start_address()
}

/// View a table frame as a `PageTable` through the direct map.
///
/// # Safety
/// `phys` must point at a live page-table frame, and the caller must
/// hold whatever exclusivity the edit needs.
unsafe fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

/// Return the table the entry at `index` points to, allocating, zeroing
/// and installing a fresh frame when the entry is not present.
fn get_or_create_table(
    table: &mut PageTable,
    index: usize,
    flags: PageTableFlags,
) -> Option<PhysAddr> {
    let entry = &mut table[index];
    if entry.flags().contains(PageTableFlags::PRESENT) {
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            // A large boot mapping sits here; we do not split those.
            return None;
        }
        return Some(entry.addr());
    }

    let frame = frame::alloc_zeroed_frame()?;
    entry.set_addr(frame, flags & PARENT_FLAGS);
    Some(frame)
}

/// Map `virt` to `phys` with `flags` in the address space rooted at
/// `pml4_phys`. Unaligned addresses round down; re-mapping an existing
/// page overwrites it.
pub fn map_page_in(
    pml4_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let virt = VirtAddr::new(page_align_down(virt.as_u64()));
    let phys = PhysAddr::new(page_align_down(phys.as_u64()));

    let (p4_idx, p3_idx, p2_idx, p1_idx) = table_indices(virt);

    // SAFETY: pml4_phys roots a live page-table tree; intermediate
    // frames come fresh from the frame allocator.
    unsafe {
        let p4 = table_mut(pml4_phys);
        let p3_phys =
            get_or_create_table(p4, p4_idx, flags).ok_or("out of frames for page table")?;
        let p3 = table_mut(p3_phys);
        let p2_phys =
            get_or_create_table(p3, p3_idx, flags).ok_or("out of frames for page table")?;
        let p2 = table_mut(p2_phys);
        let p1_phys =
            get_or_create_table(p2, p2_idx, flags).ok_or("out of frames for page table")?;
        let p1 = table_mut(p1_phys);

        p1[p1_idx].set_addr(phys, flags | PageTableFlags::PRESENT);
    }

    x86_64::instructions::tlb::flush(virt);
    Ok(())
}

/// Remove the mapping of `virt` from the space rooted at `pml4_phys`.
/// Unmapping an unmapped page is a no-op. Intermediate tables are left
/// in place even when they become empty.
pub fn unmap_page_in(pml4_phys: PhysAddr, virt: VirtAddr) {
    let virt = VirtAddr::new(page_align_down(virt.as_u64()));
    let (p4_idx, p3_idx, p2_idx, p1_idx) = table_indices(virt);

    // SAFETY: read-then-clear of a live page-table tree.
    unsafe {
        let p4 = table_mut(pml4_phys);
        if !p4[p4_idx].flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        let p3 = table_mut(p4[p4_idx].addr());
        if !p3[p3_idx].flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        if p3[p3_idx].flags().contains(PageTableFlags::HUGE_PAGE) {
            log::warn!("unmap of {:#x} inside a 1 GiB mapping ignored", virt.as_u64());
            return;
        }
        let p2 = table_mut(p3[p3_idx].addr());
        if !p2[p2_idx].flags().contains(PageTableFlags::PRESENT) {
            return;
        }
        if p2[p2_idx].flags().contains(PageTableFlags::HUGE_PAGE) {
            log::warn!("unmap of {:#x} inside a 2 MiB mapping ignored", virt.as_u64());
            return;
        }
        let p1 = table_mut(p2[p2_idx].addr());
        p1[p1_idx].set_unused();
    }

    x86_64::instructions::tlb::flush(virt);
}

/// Translate `virt` in the space rooted at `pml4_phys`.
pub fn translate_in(pml4_phys: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let offset = virt.as_u64() & (PAGE_SIZE as u64 - 1);
    let aligned = VirtAddr::new(page_align_down(virt.as_u64()));
    let (p4_idx, p3_idx, p2_idx, p1_idx) = table_indices(aligned);

    // SAFETY: read-only walk of a live page-table tree.
    unsafe {
        let p4 = table_mut(pml4_phys);
        if !p4[p4_idx].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let p3 = table_mut(p4[p4_idx].addr());
        if !p3[p3_idx].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if p3[p3_idx].flags().contains(PageTableFlags::HUGE_PAGE) {
            let huge_offset = virt.as_u64() & 0x3FFF_FFFF;
            return Some(p3[p3_idx].addr() + huge_offset);
        }
        let p2 = table_mut(p3[p3_idx].addr());
        if !p2[p2_idx].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if p2[p2_idx].flags().contains(PageTableFlags::HUGE_PAGE) {
            let huge_offset = virt.as_u64() & 0x1F_FFFF;
            return Some(p2[p2_idx].addr() + huge_offset);
        }
        let p1 = table_mut(p2[p2_idx].addr());
        let entry = &p1[p1_idx];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.addr() + offset)
    }
}

/// Leaf flags of the mapping covering `virt`, if present.
pub fn flags_in(pml4_phys: PhysAddr, virt: VirtAddr) -> Option<PageTableFlags> {
    let aligned = VirtAddr::new(page_align_down(virt.as_u64()));
    let (p4_idx, p3_idx, p2_idx, p1_idx) = table_indices(aligned);

    // SAFETY: read-only walk of a live page-table tree.
    unsafe {
        let p4 = table_mut(pml4_phys);
        if !p4[p4_idx].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let p3 = table_mut(p4[p4_idx].addr());
        if !p3[p3_idx].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if p3[p3_idx].flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(p3[p3_idx].flags());
        }
        let p2 = table_mut(p3[p3_idx].addr());
        if !p2[p2_idx].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if p2[p2_idx].flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(p2[p2_idx].flags());
        }
        let p1 = table_mut(p2[p2_idx].addr());
        let entry = &p1[p1_idx];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.flags())
    }
}

#[inline]
fn table_indices(virt: VirtAddr) -> (usize, usize, usize, usize) {
    let addr = virt.as_u64();
    (
        ((addr >> 39) & 0x1FF) as usize,
        ((addr >> 30) & 0x1FF) as usize,
        ((addr >> 21) & 0x1FF) as usize,
        ((addr >> 12) & 0x1FF) as usize,
    )
}

// Kernel-space wrappers over the current kernel table.

/// Map one page in the kernel address space.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), &'static str> {
    map_page_in(kernel_pml4(), virt, phys, flags)
}

/// Map `count` consecutive pages starting at (`virt`, `phys`).
pub fn map_range(
    virt: VirtAddr,
    phys: PhysAddr,
    count: usize,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    for i in 0..count {
        map_page(
            virt + (i * PAGE_SIZE) as u64,
            phys + (i * PAGE_SIZE) as u64,
            flags,
        )?;
    }
    Ok(())
}

/// Unmap one page from the kernel address space.
pub fn unmap_page(virt: VirtAddr) {
    unmap_page_in(kernel_pml4(), virt);
}

/// Translate a kernel virtual address.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    translate_in(kernel_pml4(), virt)
}

/// Whether `virt` is mapped in the kernel address space.
pub fn is_mapped(virt: VirtAddr) -> bool {
    translate(virt).is_some()
}
