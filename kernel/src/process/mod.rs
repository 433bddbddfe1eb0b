//! Tasking: task control blocks and the round-robin scheduler.

pub mod scheduler;
#[cfg(feature = "selftest")]
pub mod scheduler_test;
pub mod task;

pub use scheduler::{
    block_current, current_task, exit_current, kill, sleep_ticks, task_by_id, unblock, yield_now,
};
pub use task::{Task, TaskId, TaskState};
