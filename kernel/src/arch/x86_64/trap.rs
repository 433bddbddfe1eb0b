//! Vector table and trap entry/exit.
//!
//! Every installed gate points at a per-vector naked stub that pushes a
//! synthesized zero error code when the CPU did not supply one, pushes
//! the vector number, and jumps to [`trap_entry_common`]. The common
//! entry saves the remaining register state so the stack holds a
//! complete [`TrapFrame`], calls [`trap_dispatch`] with a pointer to it,
//! restores, and `iretq`s.
//!
//! Because the frame lives on the stack and the dispatcher gets a
//! mutable borrow, a handler may rewrite it wholesale; the scheduler
//! uses exactly this to make the `iretq` resume a different task.

use core::mem::offset_of;

use x86_64::registers::control::Cr2;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::sync::SyncUnsafeCell;

/// Software-interrupt vector for system calls, gate DPL 3.
pub const SYSCALL_VECTOR: u8 = 0x80;
/// Vector the timer IRQ arrives at after PIC remapping.
pub const TIMER_VECTOR: u8 = super::pic::MASTER_OFFSET;

/// The full register snapshot saved on every trap.
///
/// Field order is the stack layout built by the entry path, lowest
/// address first; it must not be reordered.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    // Data segment selectors, pushed last by the common entry.
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    // General-purpose registers.
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Pushed by the per-vector stub.
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU on the trap.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// An all-zero frame; task construction fills in the fields it needs.
    pub fn zeroed() -> Self {
        // SAFETY: TrapFrame is repr(C) and all-u64, so all-zero is valid.
        unsafe { core::mem::zeroed() }
    }

    /// Whether the trap came from ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// A registered trap handler.
pub type TrapHandler = fn(&mut TrapFrame);

/// Handler table, one slot per vector.
///
/// SAFETY discipline: written only through `register_handler` /
/// `unregister_handler` with interrupts masked on the single CPU; reads
/// from trap context see either the old or the new aligned pointer.
static HANDLERS: SyncUnsafeCell<[Option<TrapHandler>; 256]> = SyncUnsafeCell::new([None; 256]);

/// Install `handler` for `vector`, replacing any previous one.
pub fn register_handler(vector: u8, handler: TrapHandler) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        // SAFETY: interrupts are masked, so no trap can observe a torn table.
        unsafe {
            (*HANDLERS.get())[vector as usize] = Some(handler);
        }
    });
}

/// Remove the handler for `vector`.
pub fn unregister_handler(vector: u8) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        // SAFETY: as in `register_handler`.
        unsafe {
            (*HANDLERS.get())[vector as usize] = None;
        }
    });
}

/// Common trap entry. The stub has already pushed `error_code` (or a
/// zero substitute) and `vector`; this saves GPRs and data segment
/// selectors, hands the frame to the dispatcher, and unwinds.
#[unsafe(naked)]
unsafe extern "C" fn trap_entry_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, gs",
        "push rax",
        "mov rax, fs",
        "push rax",
        "mov rax, es",
        "push rax",
        "mov rax, ds",
        "push rax",
        // Kernel data for the handler itself.
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop rax",
        "mov ds, ax",
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov fs, ax",
        "pop rax",
        "mov gs, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop vector and error code.
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_dispatch,
    );
}

macro_rules! trap_stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                concat!("push ", stringify!($vector)),
                "jmp {common}",
                common = sym trap_entry_common,
            );
        }
    };
    ($name:ident, $vector:literal, has_error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push ", stringify!($vector)),
                "jmp {common}",
                common = sym trap_entry_common,
            );
        }
    };
}

// CPU exceptions. Vectors 8, 10-14, 17 and 30 come with a hardware
// error code; the rest get a synthesized zero.
trap_stub!(stub_divide_error, 0);
trap_stub!(stub_debug, 1);
trap_stub!(stub_nmi, 2);
trap_stub!(stub_breakpoint, 3);
trap_stub!(stub_overflow, 4);
trap_stub!(stub_bound_range, 5);
trap_stub!(stub_invalid_opcode, 6);
trap_stub!(stub_device_not_available, 7);
trap_stub!(stub_double_fault, 8, has_error_code);
trap_stub!(stub_invalid_tss, 10, has_error_code);
trap_stub!(stub_segment_not_present, 11, has_error_code);
trap_stub!(stub_stack_segment_fault, 12, has_error_code);
trap_stub!(stub_general_protection, 13, has_error_code);
trap_stub!(stub_page_fault, 14, has_error_code);
trap_stub!(stub_x87_fp, 16);
trap_stub!(stub_alignment_check, 17, has_error_code);
trap_stub!(stub_machine_check, 18);
trap_stub!(stub_simd_fp, 19);
trap_stub!(stub_virtualization, 20);
trap_stub!(stub_cp_protection, 21, has_error_code);
trap_stub!(stub_hv_injection, 28);
trap_stub!(stub_vmm_communication, 29, has_error_code);
trap_stub!(stub_security_exception, 30, has_error_code);

// Remapped hardware interrupts.
trap_stub!(stub_irq0, 32);
trap_stub!(stub_irq1, 33);
trap_stub!(stub_irq2, 34);
trap_stub!(stub_irq3, 35);
trap_stub!(stub_irq4, 36);
trap_stub!(stub_irq5, 37);
trap_stub!(stub_irq6, 38);
trap_stub!(stub_irq7, 39);
trap_stub!(stub_irq8, 40);
trap_stub!(stub_irq9, 41);
trap_stub!(stub_irq10, 42);
trap_stub!(stub_irq11, 43);
trap_stub!(stub_irq12, 44);
trap_stub!(stub_irq13, 45);
trap_stub!(stub_irq14, 46);
trap_stub!(stub_irq15, 47);

// System-call gate.
trap_stub!(stub_syscall, 128);

static IDT: SyncUnsafeCell<InterruptDescriptorTable> =
    SyncUnsafeCell::new(InterruptDescriptorTable::new());

/// Build and load the IDT.
///
/// Every gate is an interrupt gate at DPL 0 except the system-call gate,
/// which carries DPL 3 so ring-3 code may raise it.
pub fn init() {
    // SAFETY: called once during single-threaded init before interrupts
    // are enabled; the IDT storage is 'static.
    unsafe {
        let idt = &mut *IDT.get();

        idt.divide_error
            .set_handler_addr(VirtAddr::new(stub_divide_error as usize as u64));
        idt.debug
            .set_handler_addr(VirtAddr::new(stub_debug as usize as u64));
        idt.non_maskable_interrupt
            .set_handler_addr(VirtAddr::new(stub_nmi as usize as u64));
        idt.breakpoint
            .set_handler_addr(VirtAddr::new(stub_breakpoint as usize as u64));
        idt.overflow
            .set_handler_addr(VirtAddr::new(stub_overflow as usize as u64));
        idt.bound_range_exceeded
            .set_handler_addr(VirtAddr::new(stub_bound_range as usize as u64));
        idt.invalid_opcode
            .set_handler_addr(VirtAddr::new(stub_invalid_opcode as usize as u64));
        idt.device_not_available
            .set_handler_addr(VirtAddr::new(stub_device_not_available as usize as u64));
        idt.double_fault
            .set_handler_addr(VirtAddr::new(stub_double_fault as usize as u64))
            .set_stack_index(super::tss::DOUBLE_FAULT_IST_INDEX);
        idt.invalid_tss
            .set_handler_addr(VirtAddr::new(stub_invalid_tss as usize as u64));
        idt.segment_not_present
            .set_handler_addr(VirtAddr::new(stub_segment_not_present as usize as u64));
        idt.stack_segment_fault
            .set_handler_addr(VirtAddr::new(stub_stack_segment_fault as usize as u64));
        idt.general_protection_fault
            .set_handler_addr(VirtAddr::new(stub_general_protection as usize as u64));
        idt.page_fault
            .set_handler_addr(VirtAddr::new(stub_page_fault as usize as u64));
        idt.x87_floating_point
            .set_handler_addr(VirtAddr::new(stub_x87_fp as usize as u64));
        idt.alignment_check
            .set_handler_addr(VirtAddr::new(stub_alignment_check as usize as u64));
        idt.machine_check
            .set_handler_addr(VirtAddr::new(stub_machine_check as usize as u64));
        idt.simd_floating_point
            .set_handler_addr(VirtAddr::new(stub_simd_fp as usize as u64));
        idt.virtualization
            .set_handler_addr(VirtAddr::new(stub_virtualization as usize as u64));
        idt.cp_protection_exception
            .set_handler_addr(VirtAddr::new(stub_cp_protection as usize as u64));
        idt.hv_injection_exception
            .set_handler_addr(VirtAddr::new(stub_hv_injection as usize as u64));
        idt.vmm_communication_exception
            .set_handler_addr(VirtAddr::new(stub_vmm_communication as usize as u64));
        idt.security_exception
            .set_handler_addr(VirtAddr::new(stub_security_exception as usize as u64));

        let irq_stubs: [unsafe extern "C" fn(); 16] = [
            stub_irq0, stub_irq1, stub_irq2, stub_irq3, stub_irq4, stub_irq5, stub_irq6,
            stub_irq7, stub_irq8, stub_irq9, stub_irq10, stub_irq11, stub_irq12, stub_irq13,
            stub_irq14, stub_irq15,
        ];
        for (i, stub) in irq_stubs.iter().enumerate() {
            idt[32 + i as u8].set_handler_addr(VirtAddr::new(*stub as usize as u64));
        }

        idt[SYSCALL_VECTOR]
            .set_handler_addr(VirtAddr::new(stub_syscall as usize as u64))
            .set_privilege_level(PrivilegeLevel::Ring3);

        idt.load_unsafe();
    }

    log::info!("IDT loaded: 256 gates, syscall gate {:#04x} at DPL 3", SYSCALL_VECTOR);
}

static EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
    "virtualization exception",
    "control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "HV injection exception",
    "VMM communication exception",
    "security exception",
    "reserved",
];

/// Rust side of every trap. Called from `trap_entry_common` with the
/// on-stack frame.
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let vector = frame.vector as usize;

    // SAFETY: aligned read of one table slot; see HANDLERS discipline.
    let handler = unsafe { (*HANDLERS.get())[vector] };
    if let Some(handler) = handler {
        handler(frame);
        return;
    }

    if vector < 32 {
        report_fatal_exception(frame);
    }

    log::warn!("unhandled interrupt vector {} (rip={:#x})", vector, frame.rip);
    if (32..48).contains(&(vector as u8)) {
        // No handler will acknowledge this stray line; do it here so the
        // controller can keep delivering.
        super::pic::end_of_interrupt(vector as u8 - 32);
    }
}

/// Print everything we know about an unhandled CPU exception and stop.
fn report_fatal_exception(frame: &TrapFrame) -> ! {
    let vector = frame.vector as usize;
    log::error!("*** CPU EXCEPTION: {} ***", EXCEPTION_NAMES[vector]);
    log::error!(
        "vector={} error_code={:#x} rip={:#x} cs={:#x} rflags={:#x}",
        vector,
        frame.error_code,
        frame.rip,
        frame.cs,
        frame.rflags,
    );
    log::error!(
        "rsp={:#x} ss={:#x} from {}",
        frame.rsp,
        frame.ss,
        if frame.from_user() { "user mode" } else { "kernel mode" },
    );
    log::error!(
        "rax={:#x} rbx={:#x} rcx={:#x} rdx={:#x}",
        frame.rax,
        frame.rbx,
        frame.rcx,
        frame.rdx,
    );
    log::error!(
        "rsi={:#x} rdi={:#x} rbp={:#x}",
        frame.rsi,
        frame.rdi,
        frame.rbp,
    );

    if vector == 14 {
        let fault_addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
        log::error!("faulting address: {:#x}", fault_addr);
        log::error!(
            "page fault: {}, {}, {}",
            if frame.error_code & 1 != 0 {
                "protection violation"
            } else {
                "non-present page"
            },
            if frame.error_code & 2 != 0 { "write" } else { "read" },
            if frame.error_code & 4 != 0 {
                "user mode"
            } else {
                "kernel mode"
            },
        );
    }

    log::error!("system halted");
    super::halt_forever();
}

// The asm entry path and the struct must agree on the layout; pin the
// ends and the pivot points.
const _: () = {
    assert!(offset_of!(TrapFrame, ds) == 0);
    assert!(offset_of!(TrapFrame, r15) == 4 * 8);
    assert!(offset_of!(TrapFrame, rax) == 18 * 8);
    assert!(offset_of!(TrapFrame, vector) == 19 * 8);
    assert!(offset_of!(TrapFrame, error_code) == 20 * 8);
    assert!(offset_of!(TrapFrame, rip) == 21 * 8);
    assert!(offset_of!(TrapFrame, ss) == 25 * 8);
    assert!(core::mem::size_of::<TrapFrame>() == 26 * 8);
};
