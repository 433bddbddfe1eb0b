//! Task State Segment.
//!
//! Long mode keeps the TSS for two things we need: the ring-0 stack
//! pointer loaded on any trap out of ring 3 (`rsp0`), and the interrupt
//! stack table entry that gives the double-fault handler a known-good
//! stack.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot used by the double-fault gate.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 4;
/// Boot-time ring-0 trap stack, used until the scheduler points rsp0 at
/// the current task's kernel stack.
const TRAP_STACK_SIZE: usize = 4096 * 4;

static mut IST_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
static mut TRAP_STACK: [u8; TRAP_STACK_SIZE] = [0; TRAP_STACK_SIZE];

static mut TSS: MaybeUninit<TaskStateSegment> = MaybeUninit::uninit();
static TSS_READY: AtomicBool = AtomicBool::new(false);

/// Build the TSS. Must run before `gdt::init`, which references it.
pub fn init() {
    // SAFETY: single-threaded init, before interrupts are enabled.
    unsafe {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] =
            VirtAddr::from_ptr((&raw const TRAP_STACK).cast::<u8>()) + TRAP_STACK_SIZE as u64;
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::from_ptr((&raw const IST_STACK).cast::<u8>()) + IST_STACK_SIZE as u64;

        (&raw mut TSS).write(MaybeUninit::new(tss));
        TSS_READY.store(true, Ordering::Release);
    }

    log::info!(
        "TSS ready: rsp0 boot stack {} KiB, double-fault IST {} KiB",
        TRAP_STACK_SIZE / 1024,
        IST_STACK_SIZE / 1024,
    );
}

/// The TSS reference the GDT descriptor is built from.
pub fn tss() -> &'static TaskStateSegment {
    if !TSS_READY.load(Ordering::Acquire) {
        panic!("TSS used before init");
    }
    // SAFETY: written once in init, never moved.
    unsafe { &*(&raw const TSS).cast::<TaskStateSegment>() }
}

/// Point rsp0 at `stack_top`, the stack the CPU switches to on the next
/// trap from ring 3. The scheduler calls this on every context switch.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    if !TSS_READY.load(Ordering::Acquire) {
        return;
    }
    // SAFETY: an aligned u64 store; callers run with interrupts masked
    // (trap context or explicit cli), so no trap reads rsp0 mid-update.
    unsafe {
        (*(&raw mut TSS).cast::<TaskStateSegment>()).privilege_stack_table[0] = stack_top;
    }
}
