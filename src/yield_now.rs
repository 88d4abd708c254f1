//! In-task control: yielding, parking, and self-identification.

use crate::sched::processor::{current_task, with_context};
use crate::sched::scheduler::TaskHandle;
use std::sync::Weak;

/// Gives up the current turn.
///
/// Inside a task this suspends the coroutine and hands control back to
/// its processor; the task stays runnable and gets another turn. On a
/// non-worker thread it degrades to [`std::thread::yield_now`].
pub fn yield_now() {
    if current_task().is_some() {
        generator::yield_with(());
    } else {
        std::thread::yield_now();
    }
}

/// Suspends the current task until some holder of its [`TaskHandle`]
/// calls [`wake`](TaskHandle::wake).
///
/// If a wake already arrived, the park is skipped and the task keeps
/// running. Outside a task this is a plain thread yield.
pub fn park() {
    let Some(current) = current_task() else {
        std::thread::yield_now();
        return;
    };
    let suspend = with_context(|ctx| ctx.map(|c| c.proc.park_current(current.id)));
    if suspend == Some(true) {
        generator::yield_with(());
    }
}

/// Handle to the task the calling code is running inside, or `None` on a
/// non-worker thread.
#[must_use]
pub fn current() -> Option<TaskHandle> {
    let task = current_task()?;
    with_context(|ctx| {
        ctx.map(|c| TaskHandle::from_parts(task.id, task.uid, Weak::clone(&c.shared)))
    })
}
