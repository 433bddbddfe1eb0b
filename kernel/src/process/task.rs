//! Task control blocks and task construction.
//!
//! A task owns its kernel stack, its address space handle, and (for
//! ring-3 tasks) its user stack and code regions. Everything is released
//! by dropping the `Arc<Task>` once the scheduler reaps it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

use crate::arch::x86_64::gdt;
use crate::arch::x86_64::trap::TrapFrame;
use crate::memory::{self, frame, AddressSpace, PAGE_SIZE};
use crate::sync::SyncUnsafeCell;

/// Kernel stack size: four contiguous frames.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
/// User stack size.
pub const USER_STACK_SIZE: usize = 16 * 1024;
/// User code region size (the whole image is copied, loader-less).
pub const USER_CODE_SIZE: usize = 16 * 1024;

/// Virtual base of a user task's code image: the 4 GiB mark.
pub const USER_CODE_BASE: u64 = 0x0000_0001_0000_0000;
/// Virtual top of a user task's stack, one page below the lower-half
/// ceiling. The stack occupies the pages directly below this address.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// RFLAGS with the interrupt flag set (bit 9) plus the always-one bit 1.
const RFLAGS_IF: u64 = 0x202;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Id 0: "no task", used as the parent of tasks created at boot.
    pub const NONE: TaskId = TaskId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states; transitions are driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
    Dead,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Blocked => "blocked",
            TaskState::Sleeping => "sleeping",
            TaskState::Zombie => "zombie",
            TaskState::Dead => "dead",
        }
    }
}

/// A task's kernel stack: four contiguous frames, addressed through the
/// direct map, freed when the task is reaped.
pub struct KernelStack {
    phys_base: PhysAddr,
    size: usize,
}

impl KernelStack {
    fn allocate() -> Result<Self, &'static str> {
        let frames = KERNEL_STACK_SIZE / PAGE_SIZE;
        let phys_base = frame::frame_allocator()
            .lock()
            .as_mut()
            .ok_or("frame allocator not initialized")?
            .alloc_contiguous(frames)
            .ok_or("out of frames for kernel stack")?;

        // SAFETY: freshly allocated frames, reachable via the direct map.
        unsafe {
            core::ptr::write_bytes(
                memory::phys_to_virt(phys_base).as_mut_ptr::<u8>(),
                0,
                KERNEL_STACK_SIZE,
            );
        }
        Ok(KernelStack {
            phys_base,
            size: KERNEL_STACK_SIZE,
        })
    }

    /// Address the stack pointer starts at (stacks grow down).
    pub fn top(&self) -> VirtAddr {
        memory::phys_to_virt(self.phys_base) + self.size as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        if let Some(allocator) = frame::frame_allocator().lock().as_mut() {
            allocator.free_contiguous(self.phys_base, self.size / PAGE_SIZE);
        }
    }
}

/// A contiguous physical region mapped into a user address space.
pub struct UserRegion {
    phys_base: PhysAddr,
    pages: usize,
}

impl UserRegion {
    fn allocate(pages: usize) -> Result<Self, &'static str> {
        let phys_base = frame::frame_allocator()
            .lock()
            .as_mut()
            .ok_or("frame allocator not initialized")?
            .alloc_contiguous(pages)
            .ok_or("out of frames for user region")?;
        Ok(UserRegion { phys_base, pages })
    }

    pub fn phys_base(&self) -> PhysAddr {
        self.phys_base
    }
}

impl Drop for UserRegion {
    fn drop(&mut self) {
        if let Some(allocator) = frame::frame_allocator().lock().as_mut() {
            allocator.free_contiguous(self.phys_base, self.pages);
        }
    }
}

/// Task control block.
pub struct Task {
    pub id: TaskId,
    pub parent: TaskId,
    pub name: &'static str,
    /// Owned by the scheduler lock.
    pub state: SyncUnsafeCell<TaskState>,
    pub exit_code: AtomicI32,
    /// Register snapshot restored when the task is next dispatched.
    /// Owned by the scheduler lock.
    pub frame: SyncUnsafeCell<TrapFrame>,
    pub address_space: Arc<AddressSpace>,
    pub kernel_stack: KernelStack,
    pub user_stack: Option<UserRegion>,
    pub user_code: Option<UserRegion>,
    /// 0 is the highest priority. Recorded per task; the round-robin
    /// queue itself is priority-blind.
    pub priority: u8,
    /// Ticks a task may hold the CPU before preemption.
    pub time_slice: u32,
    pub slice_used: AtomicU32,
    /// Times this task has been dispatched.
    pub total_ticks: AtomicU64,
    /// Tick at which a sleeping task becomes ready again.
    pub wake_at_tick: AtomicU64,
}

impl Task {
    /// Current lifecycle state.
    ///
    /// Reads race only with the scheduler lock holder; a stale value is
    /// acceptable for display and polling.
    pub fn state(&self) -> TaskState {
        // SAFETY: aligned load of a small enum written under the
        // scheduler lock.
        unsafe { *self.state.get() }
    }

    /// Set the lifecycle state. Caller must hold the scheduler lock (or
    /// be constructing the task).
    pub(crate) fn set_state(&self, state: TaskState) {
        // SAFETY: see above.
        unsafe {
            *self.state.get() = state;
        }
    }

    pub fn is_user(&self) -> bool {
        self.user_code.is_some()
    }

    /// Build a ring-0 task. The trap frame is primed so that the first
    /// dispatch "returns" into `entry` on a fresh kernel stack with
    /// interrupts enabled.
    pub fn new_kernel(
        entry: extern "C" fn() -> !,
        name: &'static str,
        priority: u8,
    ) -> Result<Arc<Task>, &'static str> {
        let kernel_stack = KernelStack::allocate()?;

        let mut frame = TrapFrame::zeroed();
        frame.rip = entry as usize as u64;
        frame.rsp = kernel_stack.top().as_u64();
        frame.cs = gdt::KERNEL_CODE as u64;
        frame.ss = gdt::KERNEL_DATA as u64;
        frame.ds = gdt::KERNEL_DATA as u64;
        frame.es = gdt::KERNEL_DATA as u64;
        frame.fs = gdt::KERNEL_DATA as u64;
        frame.gs = gdt::KERNEL_DATA as u64;
        frame.rflags = RFLAGS_IF;

        let task = Arc::new(Task {
            id: TaskId::next(),
            parent: super::current_task().map(|t| t.id).unwrap_or(TaskId::NONE),
            name,
            state: SyncUnsafeCell::new(TaskState::Ready),
            exit_code: AtomicI32::new(0),
            frame: SyncUnsafeCell::new(frame),
            address_space: memory::kernel_address_space().clone(),
            kernel_stack,
            user_stack: None,
            user_code: None,
            priority,
            time_slice: 10,
            slice_used: AtomicU32::new(0),
            total_ticks: AtomicU64::new(0),
            wake_at_tick: AtomicU64::new(0),
        });

        log::debug!(
            "kernel task '{}' (id {}) stack top {:#x}",
            name,
            task.id,
            task.kernel_stack.top().as_u64(),
        );
        Ok(task)
    }

    /// Build a ring-3 task with its own address space.
    ///
    /// There is no program loader yet, so `USER_CODE_SIZE` bytes starting
    /// at `entry` are copied verbatim into the task's code region; the
    /// entry function must be self-contained within that window. Any
    /// failure on the way releases everything acquired so far (the owned
    /// pieces drop on early return).
    pub fn new_user(
        entry: extern "C" fn() -> !,
        name: &'static str,
        priority: u8,
    ) -> Result<Arc<Task>, &'static str> {
        let kernel_stack = KernelStack::allocate()?;
        let user_stack = UserRegion::allocate(USER_STACK_SIZE / PAGE_SIZE)?;
        let user_code = UserRegion::allocate(USER_CODE_SIZE / PAGE_SIZE)?;
        let address_space = AddressSpace::new_user().ok_or("out of frames for address space")?;

        use x86_64::structures::paging::PageTableFlags as Flags;
        let user_data_flags = Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESSIBLE;

        // No NX on the stack: the loader contract does not guarantee
        // EFER.NXE, and a reserved bit would fault the whole mapping.
        let stack_base = VirtAddr::new(USER_STACK_TOP - USER_STACK_SIZE as u64);
        address_space.map_range(
            stack_base,
            user_stack.phys_base(),
            USER_STACK_SIZE / PAGE_SIZE,
            user_data_flags,
        )?;
        address_space.map_range(
            VirtAddr::new(USER_CODE_BASE),
            user_code.phys_base(),
            USER_CODE_SIZE / PAGE_SIZE,
            user_data_flags,
        )?;

        // Copy the image through the direct map; the new space need not
        // (and must not) be loaded for this.
        // SAFETY: the source window lies in kernel text, the destination
        // frames were just allocated for this task.
        unsafe {
            core::ptr::copy_nonoverlapping(
                entry as usize as *const u8,
                memory::phys_to_virt(user_code.phys_base()).as_mut_ptr::<u8>(),
                USER_CODE_SIZE,
            );
        }

        let mut frame = TrapFrame::zeroed();
        frame.rip = USER_CODE_BASE;
        frame.rsp = USER_STACK_TOP;
        frame.cs = gdt::USER_CODE as u64;
        frame.ss = gdt::USER_DATA as u64;
        frame.ds = gdt::USER_DATA as u64;
        frame.es = gdt::USER_DATA as u64;
        frame.fs = gdt::USER_DATA as u64;
        frame.gs = gdt::USER_DATA as u64;
        frame.rflags = RFLAGS_IF;

        let task = Arc::new(Task {
            id: TaskId::next(),
            parent: super::current_task().map(|t| t.id).unwrap_or(TaskId::NONE),
            name,
            state: SyncUnsafeCell::new(TaskState::Ready),
            exit_code: AtomicI32::new(0),
            frame: SyncUnsafeCell::new(frame),
            address_space: Arc::new(address_space),
            kernel_stack,
            user_stack: Some(user_stack),
            user_code: Some(user_code),
            priority,
            time_slice: 10,
            slice_used: AtomicU32::new(0),
            total_ticks: AtomicU64::new(0),
            wake_at_tick: AtomicU64::new(0),
        });

        log::debug!(
            "user task '{}' (id {}) code at {:#x}, stack top {:#x}, PML4 {:#x}",
            name,
            task.id,
            USER_CODE_BASE,
            USER_STACK_TOP,
            task.address_space.pml4_phys().as_u64(),
        );
        Ok(task)
    }
}
