//! Runtime check of the ring-3 boundary: a user task runs a fixed
//! syscall sequence and must exit cleanly through Zombie to Dead.
//!
//! The user body is copied verbatim into the task's code region, so it
//! must stay self-contained: every syscall wrapper it uses is
//! `#[inline(always)]` and it references no kernel data.

use syscall_abi::calls;

use crate::process::scheduler;
use crate::process::task::Task;

/// Runs in ring 3. Emits a small trace on the console:
/// `A` after startup, then `+` when `uptime_ms` moved by at least the
/// slept amount (`-` otherwise), then exits 0.
extern "C" fn user_body() -> ! {
    let pid = calls::getpid();
    if pid > 0 {
        calls::putchar(b'A');
    } else {
        calls::putchar(b'!');
    }

    let before = calls::uptime_ms();
    calls::sleep_ms(10);
    let after = calls::uptime_ms();
    if after >= before + 10 {
        calls::putchar(b'+');
    } else {
        calls::putchar(b'-');
    }
    calls::putchar(b'\n');

    calls::exit(0)
}

/// Spawn the user task and wait for it to be reaped.
pub fn run() {
    let task = match Task::new_user(user_body, "user-probe", 1) {
        Ok(task) => task,
        Err(e) => {
            log::error!("selftest: cannot build user task: {}", e);
            return;
        }
    };
    let id = task.id;
    scheduler::add_task(task);

    // sleep_ms(10) is one tick at 100 Hz; the whole sequence should be
    // gone well within this window.
    let mut reaped = false;
    for _ in 0..100 {
        scheduler::sleep_ticks(2);
        if scheduler::task_by_id(id).is_none() {
            reaped = true;
            break;
        }
    }

    log::info!(
        "selftest: user syscall sequence [{}] (expect 'A+' above)",
        if reaped { "ok" } else { "FAILED: task never reaped" }
    );
}
