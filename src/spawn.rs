//! Free-function task submission.
//!
//! `spawn` from a worker thread submits to the scheduler that owns the
//! worker; from any other thread it submits to the process-wide default
//! scheduler (which still needs someone to call `start` on it).

use crate::config::MIN_STACK;
use crate::sched::processor::with_context;
use crate::sched::scheduler::{Scheduler, TaskHandle};
use std::sync::OnceLock;

/// Per-task submission options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SpawnOptions {
    /// Stack size for the task's coroutine; the scheduler's configured
    /// default when `None`.
    pub stack_size: Option<usize>,
}

/// The process-wide default scheduler, created on first use.
pub fn global() -> &'static Scheduler {
    static GLOBAL: OnceLock<Scheduler> = OnceLock::new();
    GLOBAL.get_or_init(Scheduler::new)
}

/// Submits a task to the ambient scheduler.
pub fn spawn<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_with(SpawnOptions::default(), f)
}

/// Submits a task with explicit options to the ambient scheduler.
pub fn spawn_with<F>(options: SpawnOptions, f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    if let Some(shared) = with_context(|ctx| ctx.and_then(|c| c.shared.upgrade())) {
        let stack = options
            .stack_size
            .unwrap_or(shared.config.stack_size)
            .max(MIN_STACK);
        return shared.make_task(stack, f);
    }
    global().spawn_with(options, f)
}
