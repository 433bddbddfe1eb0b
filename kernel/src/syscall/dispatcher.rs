//! System-call dispatch.
//!
//! The user raises vector 0x80 with the call number in `rax` and up to
//! five arguments in `rdi, rsi, rdx, r10, r8`. The dispatcher validates
//! the number against the table, calls the registered handler with the
//! trap frame, and writes the result back into `rax`; anything invalid
//! or unregistered yields −1 without running a handler.
//!
//! TODO: pointer arguments (`rsi` for read/write, `rdi` for open) are
//! dereferenced without being translated through the caller's address
//! space or bounds-checked; validate them via
//! `AddressSpace::translate` before the first hardened release.

use syscall_abi as abi;

use super::error::SYSCALL_ERR;
use crate::arch::x86_64::trap::{self, TrapFrame, SYSCALL_VECTOR};
use crate::arch::x86_64::timer;
use crate::drivers::console;
use crate::process;
use crate::sync::SyncUnsafeCell;
use crate::vfs;

/// A syscall handler; the result lands in the caller's `rax`.
pub type SyscallHandler = fn(&mut TrapFrame) -> i64;

/// Handler table indexed by call number.
///
/// SAFETY discipline: written only through `register` with interrupts
/// masked; read from the syscall trap.
static SYSCALL_TABLE: SyncUnsafeCell<[Option<SyscallHandler>; abi::SYSCALL_COUNT]> =
    SyncUnsafeCell::new([None; abi::SYSCALL_COUNT]);

/// Install a handler for call number `num`. Numbers outside the table
/// are rejected with a log message.
pub fn register(num: u64, handler: SyscallHandler) {
    if num as usize >= abi::SYSCALL_COUNT {
        log::warn!("syscall number {} out of range, not registered", num);
        return;
    }
    x86_64::instructions::interrupts::without_interrupts(|| {
        // SAFETY: interrupts masked; the table is only read from traps.
        unsafe {
            (*SYSCALL_TABLE.get())[num as usize] = Some(handler);
        }
    });
}

/// Wire up the standard call set and install the 0x80 trap handler.
pub fn init() {
    register(abi::SYS_EXIT, sys_exit);
    register(abi::SYS_WRITE, sys_write);
    register(abi::SYS_READ, sys_read);
    register(abi::SYS_OPEN, sys_open);
    register(abi::SYS_CLOSE, sys_close);
    register(abi::SYS_GETPID, sys_getpid);
    register(abi::SYS_SLEEP_MS, sys_sleep_ms);
    register(abi::SYS_YIELD, sys_yield);
    register(abi::SYS_UPTIME_MS, sys_uptime_ms);
    register(abi::SYS_GETCHAR, sys_getchar);
    register(abi::SYS_PUTCHAR, sys_putchar);
    // 8-12 (fork, exec, wait, malloc, free) stay unwired and return −1.

    trap::register_handler(SYSCALL_VECTOR, syscall_trap);
    log::info!("syscall table wired ({} slots)", abi::SYSCALL_COUNT);
}

/// Trap-side entry for vector 0x80.
fn syscall_trap(frame: &mut TrapFrame) {
    let num = frame.rax;

    let handler = if (num as usize) < abi::SYSCALL_COUNT {
        // SAFETY: aligned slot read; see SYSCALL_TABLE discipline.
        unsafe { (*SYSCALL_TABLE.get())[num as usize] }
    } else {
        None
    };

    let result = match handler {
        Some(handler) => {
            // Handlers run with interrupts enabled so the timer keeps
            // ticking through long kernel paths; the trap exit restores
            // the caller's flags regardless.
            crate::arch::x86_64::sti();
            let result = handler(frame);
            crate::arch::x86_64::cli();
            result
        }
        None => SYSCALL_ERR,
    };

    frame.rax = result as u64;
}

fn sys_exit(frame: &mut TrapFrame) -> i64 {
    process::exit_current(frame.rdi as i32)
}

/// write(fd, buf, len): bytes go to the diagnostic console for fd 1 and
/// fd 2; every other descriptor is rejected for now.
fn sys_write(frame: &mut TrapFrame) -> i64 {
    let fd = frame.rdi as i64;
    let len = frame.rdx as usize;
    if fd != 1 && fd != 2 {
        return SYSCALL_ERR;
    }
    if len == 0 {
        return 0;
    }
    // User pointer, trusted as-is (see module TODO).
    let bytes = unsafe { core::slice::from_raw_parts(frame.rsi as *const u8, len) };
    console::write_bytes(bytes);
    len as i64
}

fn sys_read(frame: &mut TrapFrame) -> i64 {
    let fd = frame.rdi as i32;
    let len = frame.rdx as usize;
    if len == 0 {
        return 0;
    }
    // User pointer, trusted as-is (see module TODO).
    let buf = unsafe { core::slice::from_raw_parts_mut(frame.rsi as *mut u8, len) };
    match vfs::read(fd, buf) {
        Ok(n) => n as i64,
        Err(_) => SYSCALL_ERR,
    }
}

fn sys_open(frame: &mut TrapFrame) -> i64 {
    let len = frame.rsi as usize;
    if len == 0 || len > 4096 {
        return SYSCALL_ERR;
    }
    // User pointer, trusted as-is (see module TODO).
    let bytes = unsafe { core::slice::from_raw_parts(frame.rdi as *const u8, len) };
    let Ok(path) = core::str::from_utf8(bytes) else {
        return SYSCALL_ERR;
    };
    match vfs::open(path, vfs::OpenFlags::from_bits_truncate(frame.rdx as u32)) {
        Ok(fd) => fd as i64,
        Err(_) => SYSCALL_ERR,
    }
}

fn sys_close(frame: &mut TrapFrame) -> i64 {
    match vfs::close(frame.rdi as i32) {
        Ok(()) => 0,
        Err(_) => SYSCALL_ERR,
    }
}

fn sys_getpid(_frame: &mut TrapFrame) -> i64 {
    match process::current_task() {
        Some(task) => task.id.as_u64() as i64,
        None => 0,
    }
}

/// sleep_ms rounds up to whole ticks; sleep_ms(0) returns immediately.
fn sys_sleep_ms(frame: &mut TrapFrame) -> i64 {
    let ms = frame.rdi;
    if ms == 0 {
        return 0;
    }
    process::sleep_ticks(timer::ms_to_ticks(ms));
    0
}

fn sys_yield(_frame: &mut TrapFrame) -> i64 {
    process::yield_now();
    0
}

fn sys_uptime_ms(_frame: &mut TrapFrame) -> i64 {
    timer::uptime_ms() as i64
}

/// No input device is wired yet; reports "no character available".
fn sys_getchar(_frame: &mut TrapFrame) -> i64 {
    SYSCALL_ERR
}

fn sys_putchar(frame: &mut TrapFrame) -> i64 {
    console::putchar(frame.rdi as u8);
    0
}
