//! Task records and the shared task table.
//!
//! Every task is a record in a generational arena ([`TaskTable`]). The
//! record embeds the intrusive queue links (`prev`/`next`/`tag`) so queues
//! never allocate per-node, and an explicit reference count: each queue
//! that links a record holds one reference, and the scheduler's live
//! accounting holds one from creation until the record has passed through
//! a processor's garbage queue.

pub mod coroutine;

use crate::sched::intrusive::QueueTag;
use crate::util::{Arena, ArenaIndex};
use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use coroutine::Coroutine;

/// Stable handle to a task record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskId(ArenaIndex);

impl TaskId {
    #[inline]
    pub(crate) const fn from_arena(idx: ArenaIndex) -> Self {
        Self(idx)
    }

    #[inline]
    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Debug for TaskId {
    // Keeping the Debug form short matters in trace output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.0.index(), self.0.generation())
    }
}

/// Execution state of a task. A task is in exactly one state at a time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TaskState {
    /// Eligible to run (or currently running on a processor).
    Runnable,
    /// Suspended; will not be rescheduled until externally woken.
    Wait,
    /// Terminal. The record is awaiting deferred release.
    Finish,
}

/// One coroutine unit: closure, execution context, state, links, refcount.
pub(crate) struct TaskRecord {
    /// Monotonically increasing public id.
    pub uid: u64,
    pub state: TaskState,
    /// Taken out of the record while the task runs on a processor's stack;
    /// dropped at `Finish` so captured resources are released promptly.
    pub coroutine: Option<Coroutine>,
    /// Index of the processor that last ran this task (non-owning).
    pub owner: Option<usize>,
    /// Set by the owning processor once a `Wait` yield has actually left
    /// the processor's stack; a wake may only re-place the task after this.
    pub parked: bool,
    /// A wake arrived while the task was still on-stack; the processor
    /// requeues the task instead of leaving it suspended.
    pub wake_pending: bool,
    refs: AtomicU32,
    // Intrusive queue links.
    pub prev: Option<TaskId>,
    pub next: Option<TaskId>,
    pub tag: Option<QueueTag>,
}

impl TaskRecord {
    pub(crate) fn new(uid: u64, coroutine: Coroutine) -> Self {
        Self {
            uid,
            state: TaskState::Runnable,
            coroutine: Some(coroutine),
            owner: None,
            parked: false,
            wake_pending: false,
            refs: AtomicU32::new(1),
            prev: None,
            next: None,
            tag: None,
        }
    }

    /// A record with no execution context, for queue unit tests.
    #[cfg(test)]
    pub(crate) fn stub(uid: u64) -> Self {
        Self {
            uid,
            state: TaskState::Runnable,
            coroutine: None,
            owner: None,
            parked: false,
            wake_pending: false,
            refs: AtomicU32::new(1),
            prev: None,
            next: None,
            tag: None,
        }
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some() || self.tag.is_some()
    }

    #[inline]
    pub(crate) fn clear_links(&mut self) {
        self.prev = None;
        self.next = None;
        self.tag = None;
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("uid", &self.uid)
            .field("state", &self.state)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The arena of task records shared by a scheduler's queues.
///
/// All mutation happens under the owning `Mutex`; the reference count is
/// atomic because a record is concurrently visible to the queue linking
/// it, the scheduler's live accounting, and a stealer validating an erase.
#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    records: Arena<TaskRecord>,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self {
            records: Arena::new(),
        }
    }

    /// Number of live task records.
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn insert(&mut self, record: TaskRecord) -> TaskId {
        TaskId::from_arena(self.records.insert(record))
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.get(id.arena_index())
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.records.get_mut(id.arena_index())
    }

    /// Takes one additional reference on `id`.
    pub(crate) fn retain(&mut self, id: TaskId) {
        if let Some(record) = self.records.get(id.arena_index()) {
            record.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops one reference on `id`; removes the record when the count hits
    /// zero. Returns true if the record was removed.
    ///
    /// Releasing a count already at zero is a scheduler bug.
    pub(crate) fn release(&mut self, id: TaskId) -> bool {
        let Some(record) = self.records.get(id.arena_index()) else {
            debug_assert!(false, "release of missing record {id:?}");
            return false;
        };
        let prev = record.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference count underflow for {id:?}");
        if prev == 1 {
            self.records.remove(id.arena_index());
            true
        } else {
            false
        }
    }

    /// Drops every record unconditionally (final shutdown reclamation).
    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_removes_at_zero() {
        let mut table = TaskTable::new();
        let id = table.insert(TaskRecord::stub(1));
        table.retain(id);
        assert_eq!(table.get(id).unwrap().refs(), 2);

        assert!(!table.release(id));
        assert!(table.get(id).is_some());
        assert!(table.release(id));
        assert!(table.get(id).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn stale_handle_after_removal() {
        let mut table = TaskTable::new();
        let id = table.insert(TaskRecord::stub(1));
        assert!(table.release(id));

        let replacement = table.insert(TaskRecord::stub(2));
        assert!(table.get(id).is_none());
        assert_eq!(table.get(replacement).unwrap().uid, 2);
    }
}
