//! Preemptive round-robin scheduler.
//!
//! The registry (`BTreeMap<TaskId, Arc<Task>>`) owns every task; the
//! ready queue holds only ids, so queue membership is bookkeeping, not
//! ownership. An idle task is kept aside and dispatched only when the
//! queue is empty, so it never competes with real work.
//!
//! ## The switch
//!
//! `on_timer` runs inside the timer trap with a mutable borrow of the
//! on-stack [`TrapFrame`]. Switching tasks is three copies and a CR3
//! load: save the frame into the outgoing task, restore the incoming
//! task's saved frame over it, and load the incoming address space if it
//! differs. The common trap exit then "returns" into the new task.
//! `yield_now` self-delivers the timer vector so voluntary and forced
//! preemption share one path.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use x86_64::instructions::interrupts::without_interrupts;

use super::task::{Task, TaskId, TaskState};
use crate::arch::x86_64::{timer, trap::TrapFrame, tss};
use crate::sync::SpinLock;

pub struct Scheduler {
    ready: VecDeque<TaskId>,
    all_tasks: BTreeMap<TaskId, Arc<Task>>,
    current: Option<Arc<Task>>,
    idle: Option<Arc<Task>>,
    running: bool,
    total_switches: u64,
}

static SCHEDULER: SpinLock<Option<Scheduler>> = SpinLock::new(None);

/// Take the scheduler lock from task context, with interrupts masked so
/// a tick cannot preempt the holder.
fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        guard.as_mut().map(f)
    })
}

/// Create the scheduler and hook it onto the timer tick.
pub fn init() {
    without_interrupts(|| {
        *SCHEDULER.lock() = Some(Scheduler {
            ready: VecDeque::new(),
            all_tasks: BTreeMap::new(),
            current: None,
            idle: None,
            running: false,
            total_switches: 0,
        });
    });
    timer::set_callback(on_timer);
    log::info!("scheduler ready (round-robin)");
}

/// Begin dispatching on timer ticks. The boot context keeps running
/// until the first tick, after which it is abandoned.
pub fn start() {
    with_scheduler(|s| s.running = true);
    log::info!("scheduler started");
}

/// Stop dispatching; the task running at the next tick keeps the CPU.
pub fn stop() {
    with_scheduler(|s| s.running = false);
    log::info!("scheduler stopped");
}

/// Register `task` and queue it for execution.
pub fn add_task(task: Arc<Task>) {
    with_scheduler(|s| {
        task.set_state(TaskState::Ready);
        s.ready.push_back(task.id);
        s.all_tasks.insert(task.id, task);
    });
}

/// Register `task` as the idle task. It runs only when the ready queue
/// is empty.
pub fn set_idle_task(task: Arc<Task>) {
    with_scheduler(|s| {
        task.set_state(TaskState::Ready);
        s.idle = Some(task.clone());
        s.all_tasks.insert(task.id, task);
    });
}

/// Drop a task from the ready queue (it stays registered).
pub fn remove_from_queue(id: TaskId) {
    with_scheduler(|s| s.ready.retain(|&queued| queued != id));
}

/// The registered idle task.
pub fn idle_task() -> Option<Arc<Task>> {
    without_interrupts(|| {
        let guard = SCHEDULER.lock();
        guard.as_ref().and_then(|s| s.idle.clone())
    })
}

/// The task currently holding the CPU.
pub fn current_task() -> Option<Arc<Task>> {
    without_interrupts(|| {
        let guard = SCHEDULER.lock();
        guard.as_ref().and_then(|s| s.current.clone())
    })
}

/// Look a task up by id.
pub fn task_by_id(id: TaskId) -> Option<Arc<Task>> {
    without_interrupts(|| {
        let guard = SCHEDULER.lock();
        guard.as_ref().and_then(|s| s.all_tasks.get(&id).cloned())
    })
}

/// Number of tasks in the ready queue.
pub fn ready_count() -> usize {
    with_scheduler(|s| s.ready.len()).unwrap_or(0)
}

/// Context switches performed since boot.
pub fn total_switches() -> u64 {
    with_scheduler(|s| s.total_switches).unwrap_or(0)
}

/// Number of registered tasks (all states).
pub fn task_count() -> usize {
    with_scheduler(|s| s.all_tasks.len()).unwrap_or(0)
}

/// Give up the remainder of the time slice by self-delivering the timer
/// vector; the trap path then runs the scheduler like any other tick.
pub fn yield_now() {
    // SAFETY: vector 0x20 is the timer gate; raising it from ring 0 is
    // exactly how the hardware tick arrives.
    unsafe {
        core::arch::asm!("int 0x20");
    }
}

/// Put the current task to sleep for at least `ticks` timer periods.
pub fn sleep_ticks(ticks: u64) {
    if ticks == 0 {
        return;
    }
    let wake_at = timer::ticks() + ticks;
    // State change happens under the lock so a tick cannot interleave.
    let is_task = with_scheduler(|s| match s.current.as_ref() {
        Some(current) => {
            current.wake_at_tick.store(wake_at, Ordering::Relaxed);
            current.set_state(TaskState::Sleeping);
            true
        }
        None => false,
    })
    .unwrap_or(false);

    if is_task {
        yield_now();
    } else {
        // No tasking yet: park the boot context on the timer directly.
        timer::wait_ticks(ticks);
    }
}

/// Move the current task to `Blocked` and give up the CPU. Some other
/// context must `unblock` it.
pub fn block_current() {
    let blocked = with_scheduler(|s| match s.current.as_ref() {
        Some(current) => {
            current.set_state(TaskState::Blocked);
            true
        }
        None => false,
    })
    .unwrap_or(false);
    if blocked {
        yield_now();
    }
}

/// Make a blocked task runnable again.
pub fn unblock(id: TaskId) {
    with_scheduler(|s| {
        if let Some(task) = s.all_tasks.get(&id) {
            if task.state() == TaskState::Blocked {
                task.set_state(TaskState::Ready);
                s.ready.push_back(id);
            }
        }
    });
}

/// Terminate the current task. Never returns: the scheduler reaps the
/// zombie once another task is on the CPU.
pub fn exit_current(code: i32) -> ! {
    with_scheduler(|s| {
        if let Some(current) = s.current.as_ref() {
            log::debug!(
                "task '{}' (id {}) exiting with code {}",
                current.name,
                current.id,
                code
            );
            current.exit_code.store(code, Ordering::Relaxed);
            current.set_state(TaskState::Zombie);
        }
    });
    loop {
        yield_now();
        crate::arch::x86_64::hlt();
    }
}

/// Mark a task for termination. A ready task leaves the queue now; the
/// running task dies at its next preemption.
pub fn kill(id: TaskId) -> Result<(), &'static str> {
    with_scheduler(|s| {
        let task = s.all_tasks.get(&id).ok_or("no such task")?;
        task.set_state(TaskState::Zombie);
        s.ready.retain(|&queued| queued != id);
        Ok(())
    })
    .unwrap_or(Err("scheduler not initialized"))
}

/// Log the task table, one line per task.
pub fn list_tasks() {
    with_scheduler(|s| {
        log::info!("{:<5} {:<20} {:<10} {:>8} {:>10}", "ID", "NAME", "STATE", "PRIO", "DISPATCHED");
        for task in s.all_tasks.values() {
            log::info!(
                "{:<5} {:<20} {:<10} {:>8} {:>10}",
                task.id,
                task.name,
                task.state().name(),
                task.priority,
                task.total_ticks.load(Ordering::Relaxed),
            );
        }
    });
}

/// Wake every sleeping task whose deadline has passed. Runs under the
/// scheduler lock.
fn wake_expired(s: &mut Scheduler, now: u64) {
    // Collect first: pushing to the queue while iterating the map would
    // alias the borrow.
    let woken: alloc::vec::Vec<TaskId> = s
        .all_tasks
        .values()
        .filter(|task| {
            task.state() == TaskState::Sleeping
                && now >= task.wake_at_tick.load(Ordering::Relaxed)
        })
        .map(|task| {
            task.set_state(TaskState::Ready);
            task.id
        })
        .collect();
    s.ready.extend(woken);
}

/// Release every zombie that is not the currently running context. The
/// running zombie's kernel stack is still live under our feet; it is
/// reaped on a later tick, after the switch away from it.
fn reap_zombies(s: &mut Scheduler) {
    let current_id = s.current.as_ref().map(|t| t.id);
    let dead: alloc::vec::Vec<TaskId> = s
        .all_tasks
        .values()
        .filter(|task| task.state() == TaskState::Zombie && Some(task.id) != current_id)
        .map(|task| task.id)
        .collect();
    for id in dead {
        if let Some(task) = s.all_tasks.remove(&id) {
            task.set_state(TaskState::Dead);
            s.ready.retain(|&queued| queued != id);
            log::debug!(
                "reaped task '{}' (id {}, exit code {})",
                task.name,
                task.id,
                task.exit_code.load(Ordering::Relaxed),
            );
            // Dropping the Arc releases stacks, user regions and the
            // address space.
        }
    }
}

/// Timer-tick entry: wake sleepers, reap zombies, pick the next task and
/// switch the trap frame to it.
fn on_timer(frame: &mut TrapFrame) {
    // Interrupts are off in the trap; try_lock still guards against a
    // tick landing on a path that somehow holds the lock.
    let Some(mut guard) = SCHEDULER.try_lock() else {
        return;
    };
    let Some(s) = guard.as_mut() else {
        return;
    };
    if !s.running {
        return;
    }

    let now = timer::ticks();
    wake_expired(s, now);
    reap_zombies(s);

    // Save the outgoing context and requeue it when it is still runnable.
    // The idle task never enters the queue; it is picked up again only
    // when the queue runs dry.
    if let Some(current) = s.current.clone() {
        // SAFETY: the scheduler lock owns every saved frame.
        unsafe {
            *current.frame.get() = *frame;
        }
        current.slice_used.store(0, Ordering::Relaxed);
        if current.state() == TaskState::Running {
            current.set_state(TaskState::Ready);
            let is_idle = s.idle.as_ref().map(|idle| idle.id) == Some(current.id);
            if !is_idle {
                s.ready.push_back(current.id);
            }
        }
    }

    // Round-robin: head of the queue next, idle when there is none.
    let next = loop {
        match s.ready.pop_front() {
            Some(id) => match s.all_tasks.get(&id) {
                // Skip stale ids (killed while queued).
                Some(task) if task.state() == TaskState::Ready => break Some(task.clone()),
                _ => continue,
            },
            None => break s.idle.clone(),
        }
    };

    let Some(next) = next else {
        // Nothing to run at all; the boot context keeps the CPU.
        s.current = None;
        return;
    };

    next.set_state(TaskState::Running);
    next.total_ticks.fetch_add(1, Ordering::Relaxed);
    s.total_switches += 1;

    // Restore the incoming context over the on-stack frame; the trap
    // exit path returns into it.
    // SAFETY: the scheduler lock owns every saved frame.
    unsafe {
        *frame = *next.frame.get();
    }

    // Loading CR3 flushes non-global TLB entries; skipped when the
    // address space is unchanged.
    next.address_space.switch_to();
    // Traps out of ring 3 must land on this task's kernel stack.
    tss::set_kernel_stack(next.kernel_stack.top());

    s.current = Some(next);
}
