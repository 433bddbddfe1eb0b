//! Ferrite-OS kernel.
//!
//! A small x86_64 kernel: bitmap frame allocator, 4-level paging with a
//! higher-half direct map, a growable first-fit heap, trap-frame based
//! preemptive round-robin scheduling of ring-0 and ring-3 tasks, an
//! int 0x80 syscall surface, and a VFS over PIO ATA storage carrying the
//! flatfs on-disk format.

#![no_std]
#![no_main]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod drivers;
pub mod fs;
pub mod logger;
pub mod memory;
pub mod panic;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod vfs;

use core::panic::PanicInfo;

use boot::BootInfo;
use process::task::Task;

#[panic_handler]
fn panic_handler(info: &PanicInfo) -> ! {
    panic::panic_handler(info)
}

/// Timer frequency the kernel runs at.
pub const TICK_HZ: u32 = 100;

fn banner() {
    serial_println!();
    serial_println!(r"    ______                _ __");
    serial_println!(r"   / ____/__  ____  ____(_) /____     ____  _____");
    serial_println!(r"  / /_  / _ \/ __ \/ __/ / __/ _ \   / __ \/ ___/");
    serial_println!(r" / __/ /  __/ /  / /  / / /_/  __/  / /_/ (__  )");
    serial_println!(r"/_/    \___/_/  /_/  /_/\__/\___/   \____/____/");
    serial_println!();
    serial_println!("  Ferrite-OS kernel v0.1.0 (x86_64)");
    serial_println!();
}

extern "C" fn idle_task() -> ! {
    loop {
        arch::x86_64::hlt();
    }
}

/// Mount the first detected disk at `/`, formatting it first when it
/// does not carry a filesystem yet.
fn mount_root_disk() {
    let Some(disk) = drivers::block::get_device("hda") else {
        log::warn!("no disk detected; running without a root filesystem");
        return;
    };

    let fs = match fs::FlatFsFileSystem::mount_device(disk.clone()) {
        Ok(fs) => fs,
        Err(_) => {
            log::info!("hda carries no filesystem; formatting");
            if let Err(e) = fs::FlatFsFileSystem::format(disk.as_ref()) {
                log::error!("format of hda failed: {}", e);
                return;
            }
            match fs::FlatFsFileSystem::mount_device(disk) {
                Ok(fs) => fs,
                Err(e) => {
                    log::error!("mount of freshly formatted hda failed: {}", e);
                    return;
                }
            }
        }
    };

    vfs::register_filesystem(fs.clone());
    if let Err(e) = vfs::mount("/", fs) {
        log::error!("mounting '/' failed: {}", e);
    }
}

#[cfg(feature = "selftest")]
extern "C" fn selftest_task() -> ! {
    process::scheduler_test::run();
    syscall::usertest::run();
    fs::selftest::run();
    log::info!("selftest: scenario suite finished");
    process::exit_current(0)
}

/// Kernel initialization, in dependency order. Called by the boot entry
/// with loader-provided [`BootInfo`].
///
/// # Safety
/// Must be called exactly once, in long mode, with paging established
/// and the direct map in place.
pub unsafe fn kmain(boot_info: &BootInfo) -> ! {
    arch::x86_64::serial::init();
    logger::init();
    banner();

    if let Some(cmdline) = boot_info.cmdline {
        log::info!("command line: {}", cmdline);
    }
    log::info!(
        "kernel image ends at {:#x}, {} MiB RAM",
        boot_info.kernel_end,
        boot_info.total_memory() / (1024 * 1024),
    );

    // Memory: frames, paging, the kernel address space, then the heap
    // (everything past this point may allocate).
    memory::init(boot_info);
    memory::address_space::init();
    memory::heap::init(memory::heap::HEAP_BASE, memory::heap::HEAP_INITIAL_SIZE);

    // CPU tables and the trap path.
    arch::x86_64::tss::init();
    arch::x86_64::gdt::init();
    arch::x86_64::trap::init();

    // Interrupt controller and timer; interrupts stay masked until both
    // are programmed.
    arch::x86_64::pic::init(arch::x86_64::pic::MASTER_OFFSET, arch::x86_64::pic::SLAVE_OFFSET);
    arch::x86_64::timer::init(TICK_HZ);

    process::scheduler::init();
    syscall::init();

    arch::x86_64::sti();

    #[cfg(feature = "selftest")]
    {
        memory::selftest::run();
    }

    // Storage and filesystems.
    vfs::init();
    drivers::ata::init();
    mount_root_disk();

    // Tasking: idle plus whatever the build wants to run.
    match Task::new_kernel(idle_task, "idle", u8::MAX) {
        Ok(idle) => process::scheduler::set_idle_task(idle),
        Err(e) => panic!("cannot create idle task: {}", e),
    }

    #[cfg(feature = "selftest")]
    {
        match Task::new_kernel(selftest_task, "selftest", 0) {
            Ok(task) => process::scheduler::add_task(task),
            Err(e) => log::error!("cannot create selftest task: {}", e),
        }
    }

    let mem = memory::stats();
    log::info!(
        "memory: {}/{} frames used, heap {} KiB of {} KiB in use",
        mem.used_frames,
        mem.total_frames,
        mem.heap_used / 1024,
        mem.heap_total / 1024,
    );

    process::scheduler::start();
    log::info!("boot complete, handing over to the scheduler");

    // The first tick dispatches a task and abandons this context.
    loop {
        arch::x86_64::hlt();
    }
}

/// Wrap a raw loader pointer and enter [`kmain`].
///
/// # Safety
/// `boot_info` must be null or point to a valid `BootInfo`.
pub unsafe fn kernel_entry(boot_info: *const BootInfo) -> ! {
    static FALLBACK: BootInfo = BootInfo::minimal(0x0100_0000);
    let boot_info = if boot_info.is_null() {
        &FALLBACK
    } else {
        // SAFETY: non-null per contract.
        unsafe { &*boot_info }
    };
    // SAFETY: single entry from the loader.
    unsafe { kmain(boot_info) }
}
