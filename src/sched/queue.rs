//! Lock-wrapped task queue with a cheap emptiness probe.
//!
//! Pairs an intrusive [`TsQueue`] with its `Mutex` and keeps an atomic
//! mirror of the length, so `is_empty`/`len` never take the lock. That
//! makes the probe a hint: `pop` re-checks under the lock, and a reader
//! that saw "non-empty" may still find the queue drained.

use super::intrusive::{Batch, RefPolicy, TsQueue};
use crate::task::{TaskId, TaskTable};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct TaskQueue {
    inner: Mutex<TsQueue>,
    tasks: Arc<Mutex<TaskTable>>,
    len: AtomicUsize,
}

impl TaskQueue {
    pub(crate) fn new(tasks: Arc<Mutex<TaskTable>>) -> Self {
        Self {
            inner: Mutex::new(TsQueue::new()),
            tasks,
            len: AtomicUsize::new(0),
        }
    }

    /// Lock-free length hint.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Lock-free emptiness hint.
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, id: TaskId, policy: RefPolicy) {
        let mut queue = self.inner.lock();
        let mut tasks = self.tasks.lock();
        queue.push(id, &mut tasks, policy);
        self.len.store(queue.len(), Ordering::Release);
    }

    /// Pops the head, or `None` if the queue is empty.
    ///
    /// The emptiness hint short-circuits the common idle case without
    /// touching the lock.
    pub(crate) fn pop(&self) -> Option<TaskId> {
        if self.is_empty() {
            return None;
        }
        let mut queue = self.inner.lock();
        let mut tasks = self.tasks.lock();
        let id = queue.pop(&mut tasks);
        self.len.store(queue.len(), Ordering::Release);
        id
    }

    /// Detaches the entire contents, references transferred with the batch.
    pub(crate) fn pop_all(&self) -> Batch {
        if self.is_empty() {
            return Batch::new();
        }
        let mut queue = self.inner.lock();
        let batch = queue.pop_all();
        self.len.store(0, Ordering::Release);
        batch
    }
}
