//! Per-task address spaces.
//!
//! Every address space shares the kernel's upper half: on creation the
//! top-level entries 256..512 are copied entry-by-entry from the kernel
//! table, so the kernel is mapped no matter which space is loaded. The
//! lower half is private to the owning task.

use alloc::sync::Arc;
use spin::Once;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use super::{frame, paging, phys_to_virt};

/// A handle to a top-level page table.
pub struct AddressSpace {
    pml4_phys: PhysAddr,
    is_kernel: bool,
}

// SAFETY: page-table edits go through the direct map and are serialized
// by task ownership (a space is only edited by its constructor or owner).
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    /// Wrap the boot page tables as the kernel address space.
    ///
    /// # Safety
    /// Call exactly once, after `paging::init`.
    unsafe fn new_kernel() -> Self {
        AddressSpace {
            pml4_phys: paging::kernel_pml4(),
            is_kernel: true,
        }
    }

    /// Create a fresh address space: zeroed lower half, kernel upper
    /// half cloned from the kernel table.
    pub fn new_user() -> Option<Self> {
        let pml4_phys = frame::alloc_zeroed_frame()?;

        // SAFETY: both tables are live and reachable via the direct map;
        // the new one is exclusively ours until this function returns.
        unsafe {
            let kernel = &*phys_to_virt(paging::kernel_pml4()).as_ptr::<PageTable>();
            let new = &mut *phys_to_virt(pml4_phys).as_mut_ptr::<PageTable>();
            for i in 256..512 {
                new[i] = kernel[i].clone();
            }
        }

        log::debug!(
            "created address space, PML4 {:#x} (kernel half shared)",
            pml4_phys.as_u64()
        );
        Some(AddressSpace {
            pml4_phys,
            is_kernel: false,
        })
    }

    /// Physical address of the top-level table (the CR3 value).
    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4_phys
    }

    /// Whether this is the shared kernel address space.
    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Map one page in this space.
    pub fn map_page(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), &'static str> {
        paging::map_page_in(self.pml4_phys, virt, phys, flags)
    }

    /// Map `count` consecutive pages in this space.
    pub fn map_range(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: PageTableFlags,
    ) -> Result<(), &'static str> {
        for i in 0..count {
            self.map_page(
                virt + (i * super::PAGE_SIZE) as u64,
                phys + (i * super::PAGE_SIZE) as u64,
                flags,
            )?;
        }
        Ok(())
    }

    /// Unmap one page from this space (no-op when absent).
    pub fn unmap_page(&self, virt: VirtAddr) {
        paging::unmap_page_in(self.pml4_phys, virt);
    }

    /// Translate a virtual address through this space.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        paging::translate_in(self.pml4_phys, virt)
    }

    /// Load this space's top table into CR3 unless it is already active.
    /// The write implicitly flushes all non-global TLB entries.
    pub fn switch_to(&self) {
        let (current, _) = Cr3::read();
        if current.start_address() == self.pml4_phys {
            return;
        }
        // SAFETY: pml4_phys roots a valid tree whose upper half mirrors
        // the kernel mapping, so kernel execution continues unbroken.
        unsafe {
            let frame = x86_64::structures::paging::PhysFrame::from_start_address(self.pml4_phys)
                .expect("PML4 address not page aligned");
            Cr3::write(frame, Cr3Flags::empty());
        }
    }
}

impl Drop for AddressSpace {
    /// Tear down the private lower half: every intermediate table frame
    /// under entries 0..256 and the top table itself. Data frames mapped
    /// at the leaves belong to the task's regions and are freed by their
    /// owners, not here. The shared upper half is never touched.
    fn drop(&mut self) {
        if self.is_kernel {
            return;
        }

        // SAFETY: the space is dead: no CPU has it loaded (the scheduler
        // never frees the running task) and no mapping into it remains
        // reachable.
        unsafe {
            let pml4 = &mut *phys_to_virt(self.pml4_phys).as_mut_ptr::<PageTable>();
            for p4_entry in pml4.iter_mut().take(256) {
                if !p4_entry.flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let p3 = &mut *phys_to_virt(p4_entry.addr()).as_mut_ptr::<PageTable>();
                for p3_entry in p3.iter_mut() {
                    if !p3_entry.flags().contains(PageTableFlags::PRESENT)
                        || p3_entry.flags().contains(PageTableFlags::HUGE_PAGE)
                    {
                        continue;
                    }
                    let p2 = &mut *phys_to_virt(p3_entry.addr()).as_mut_ptr::<PageTable>();
                    for p2_entry in p2.iter_mut() {
                        if p2_entry.flags().contains(PageTableFlags::PRESENT)
                            && !p2_entry.flags().contains(PageTableFlags::HUGE_PAGE)
                        {
                            frame::free_frame(p2_entry.addr());
                        }
                    }
                    frame::free_frame(p3_entry.addr());
                }
                frame::free_frame(p4_entry.addr());
            }
        }
        frame::free_frame(self.pml4_phys);

        log::debug!("destroyed address space, PML4 {:#x}", self.pml4_phys.as_u64());
    }
}

static KERNEL_SPACE: Once<Arc<AddressSpace>> = Once::new();

/// Publish the kernel address space singleton. Must run after
/// `paging::init`, before the first task is built.
pub fn init() {
    KERNEL_SPACE.call_once(|| {
        // SAFETY: single init call ordering is enforced by kmain.
        Arc::new(unsafe { AddressSpace::new_kernel() })
    });
}

/// The kernel address space shared by all kernel tasks.
pub fn kernel_address_space() -> &'static Arc<AddressSpace> {
    KERNEL_SPACE.get().expect("kernel address space not initialized")
}
