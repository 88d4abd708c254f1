//! Intrusive queue core for scheduler hot paths.
//!
//! The doubly-linked queue stores its links (`prev`/`next`/`tag`) inside
//! [`TaskRecord`](crate::task::TaskRecord) rather than allocating nodes, so
//! queue operations are allocation-free and cache-local. A queue owns only
//! `head`/`tail`/`len` plus a process-unique [`QueueTag`] used to validate
//! membership before an unconditional unlink.
//!
//! # Ownership
//!
//! - A record is linked into at most one container at a time: linking
//!   requires both ends of the splice to be clear, unlinking requires the
//!   pair to be adjacent. Violations are scheduler bugs and assert in
//!   debug builds.
//! - A queue holds one reference per linked record. `push` retains by
//!   default ([`RefPolicy::Retain`]); the `Transfer` variants move an
//!   existing reference in or out without touching the count, which is how
//!   batches and the garbage queue hand ownership around.
//! - Batch splices are O(1) and leave member tags stale on purpose; tags
//!   are refreshed lazily by `front`/`successor`, which is exactly the set
//!   of records a validated erase is ever aimed at.
//!
//! Every operation takes `&mut TaskTable`: the caller holds the queue's
//! lock and the table lock, so this whole module is the "already locked"
//! operation family.

use crate::task::{TaskId, TaskTable};
use smallvec::SmallVec;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of one queue instance.
///
/// Stored into each linked record so a stale or already-moved record can be
/// detected without a separate membership index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct QueueTag(NonZeroU64);

impl QueueTag {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).expect("queue tag counter wrapped"))
    }
}

/// Whether a queue operation adjusts the reference count.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RefPolicy {
    /// The queue takes its own reference (the default for submissions).
    Retain,
    /// An existing reference is moved in/out with the record.
    Transfer,
}

/// Links `a` directly before `b`. Both splice ends must be clear.
fn link(a: TaskId, b: TaskId, tasks: &mut TaskTable) {
    debug_assert!(
        tasks.get(a).is_some_and(|r| r.next.is_none()),
        "link: {a:?} already has a successor"
    );
    debug_assert!(
        tasks.get(b).is_some_and(|r| r.prev.is_none()),
        "link: {b:?} already has a predecessor"
    );
    if let Some(ra) = tasks.get_mut(a) {
        ra.next = Some(b);
    }
    if let Some(rb) = tasks.get_mut(b) {
        rb.prev = Some(a);
    }
}

/// A transient run of linked records detached from any queue.
///
/// Moves groups of tasks between containers without per-node locking. A
/// batch does not adjust reference counts: moving it into a queue moves
/// the references its members already carry. Dropping a non-empty batch
/// would strand those references, so it asserts in debug builds — consume
/// batches by splicing or draining them.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

impl Batch {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    const fn from_run(head: TaskId, tail: TaskId, len: usize) -> Self {
        Self {
            head: Some(head),
            tail: Some(tail),
            len,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the batch, returning its run. Records the hand-off so the
    /// drop check knows ownership moved on.
    fn take(&mut self) -> Option<(TaskId, TaskId, usize)> {
        let head = self.head.take()?;
        let tail = self.tail.take()?;
        let len = std::mem::take(&mut self.len);
        Some((head, tail, len))
    }

    /// Splices `other` onto the end of `self` in O(1).
    pub(crate) fn append(&mut self, mut other: Batch, tasks: &mut TaskTable) {
        let Some((head, tail, len)) = other.take() else {
            return;
        };
        match self.tail {
            None => {
                self.head = Some(head);
            }
            Some(old_tail) => link(old_tail, head, tasks),
        }
        self.tail = Some(tail);
        self.len += len;
    }

    /// Detaches the trailing `k` records (or fewer if the batch is
    /// shorter) into a new batch, shrinking `self` accordingly.
    pub(crate) fn trunc_tail(&mut self, k: usize, tasks: &mut TaskTable) -> Batch {
        if k == 0 || self.is_empty() {
            return Batch::new();
        }
        let tail = self.tail.expect("non-empty batch has a tail");
        let mut first = tail;
        let mut count = 1usize;
        while count < k {
            let Some(prev) = tasks.get(first).and_then(|r| r.prev) else {
                break;
            };
            first = prev;
            count += 1;
        }

        let new_tail = tasks.get(first).and_then(|r| r.prev);
        if let Some(record) = tasks.get_mut(first) {
            record.prev = None;
        }
        match new_tail {
            Some(nt) => {
                if let Some(record) = tasks.get_mut(nt) {
                    record.next = None;
                }
            }
            None => self.head = None,
        }
        self.tail = new_tail;
        self.len -= count;
        Batch::from_run(first, tail, count)
    }

    /// Removes a specific member, walking from the head.
    ///
    /// Returns false (and mutates nothing) if `id` is not in this batch.
    pub(crate) fn remove(&mut self, id: TaskId, tasks: &mut TaskTable) -> bool {
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            if cur == id {
                let (prev, next) = match tasks.get(cur) {
                    Some(r) => (r.prev, r.next),
                    None => return false,
                };
                match prev {
                    Some(p) => {
                        if let Some(r) = tasks.get_mut(p) {
                            r.next = next;
                        }
                    }
                    None => self.head = next,
                }
                match next {
                    Some(n) => {
                        if let Some(r) = tasks.get_mut(n) {
                            r.prev = prev;
                        }
                    }
                    None => self.tail = prev,
                }
                if let Some(r) = tasks.get_mut(cur) {
                    r.clear_links();
                }
                self.len -= 1;
                return true;
            }
            cursor = tasks.get(cur).and_then(|r| r.next);
        }
        false
    }

    /// Unlinks every member and returns the ids in batch order.
    pub(crate) fn drain(&mut self, tasks: &mut TaskTable) -> SmallVec<[TaskId; 16]> {
        let mut out = SmallVec::new();
        let Some((head, _tail, _len)) = self.take() else {
            return out;
        };
        let mut cursor = Some(head);
        while let Some(cur) = cursor {
            cursor = match tasks.get_mut(cur) {
                Some(record) => {
                    let next = record.next;
                    record.clear_links();
                    next
                }
                None => None,
            };
            out.push(cur);
        }
        out
    }

    /// Member ids in order, links untouched (test observation only).
    #[cfg(test)]
    pub(crate) fn ids(&self, tasks: &TaskTable) -> Vec<TaskId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            out.push(cur);
            cursor = tasks.get(cur).and_then(|r| r.next);
        }
        out
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.len != 0 && !std::thread::panicking() {
            debug_assert!(false, "batch dropped while owning {} tasks", self.len);
        }
    }
}

/// The intrusive FIFO queue.
///
/// `head`/`tail` are `None` together; `len` counts linked records. All
/// operations are O(1) except the bounded truncation walks.
#[derive(Debug)]
pub(crate) struct TsQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
    tag: QueueTag,
}

impl TsQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            tag: QueueTag::next(),
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    pub(crate) const fn tag(&self) -> QueueTag {
        self.tag
    }

    /// First linked record, with its container tag refreshed so a later
    /// validated erase of it succeeds even after a batch splice.
    pub(crate) fn front(&self, tasks: &mut TaskTable) -> Option<TaskId> {
        let head = self.head?;
        if let Some(record) = tasks.get_mut(head) {
            record.tag = Some(self.tag);
        }
        Some(head)
    }

    /// Queue-order successor of `id`, tag refreshed like [`front`](Self::front).
    ///
    /// Returns `None` if `id` no longer carries this queue's tag (it was
    /// moved or stolen since it was last observed).
    pub(crate) fn successor(&self, id: TaskId, tasks: &mut TaskTable) -> Option<TaskId> {
        let record = tasks.get(id)?;
        if record.tag != Some(self.tag) {
            return None;
        }
        let next = record.next?;
        if let Some(record) = tasks.get_mut(next) {
            record.tag = Some(self.tag);
        }
        Some(next)
    }

    /// Links `id` at the tail.
    pub(crate) fn push(&mut self, id: TaskId, tasks: &mut TaskTable, policy: RefPolicy) {
        {
            let Some(record) = tasks.get_mut(id) else {
                debug_assert!(false, "push of missing record {id:?}");
                return;
            };
            debug_assert!(
                record.prev.is_none() && record.next.is_none(),
                "push of already linked record {id:?}"
            );
            record.tag = Some(self.tag);
        }
        match self.tail {
            None => self.head = Some(id),
            Some(old_tail) => link(old_tail, id, tasks),
        }
        self.tail = Some(id);
        self.len += 1;
        if policy == RefPolicy::Retain {
            tasks.retain(id);
        }
    }

    /// Splices a whole batch at the tail in O(1).
    ///
    /// Member tags are left stale; see the module docs.
    pub(crate) fn push_batch(&mut self, mut batch: Batch, tasks: &mut TaskTable) {
        let Some((head, tail, len)) = batch.take() else {
            return;
        };
        match self.tail {
            None => self.head = Some(head),
            Some(old_tail) => link(old_tail, head, tasks),
        }
        self.tail = Some(tail);
        self.len += len;
    }

    /// Unlinks and returns the head, releasing the queue's reference.
    pub(crate) fn pop(&mut self, tasks: &mut TaskTable) -> Option<TaskId> {
        let head = self.head?;
        let next = match tasks.get_mut(head) {
            Some(record) => {
                let next = record.next;
                record.clear_links();
                next
            }
            None => None,
        };
        self.head = next;
        match next {
            Some(new_head) => {
                if let Some(record) = tasks.get_mut(new_head) {
                    record.prev = None;
                }
            }
            None => self.tail = None,
        }
        self.len -= 1;
        let removed = tasks.release(head);
        debug_assert!(!removed, "queue held the last reference to {head:?}");
        Some(head)
    }

    /// Detaches the entire contents in O(1), references transferred.
    pub(crate) fn pop_all(&mut self) -> Batch {
        let (Some(head), Some(tail)) = (self.head.take(), self.tail.take()) else {
            self.head = None;
            self.tail = None;
            return Batch::new();
        };
        let len = std::mem::take(&mut self.len);
        Batch::from_run(head, tail, len)
    }

    /// Detaches up to `n` records from the front, references transferred.
    pub(crate) fn trunc_front(&mut self, n: usize, tasks: &mut TaskTable) -> Batch {
        if n == 0 || self.is_empty() {
            return Batch::new();
        }
        let first = self.head.expect("non-empty queue has a head");
        let mut last = first;
        let mut count = 1usize;
        while count < n {
            let Some(next) = tasks.get(last).and_then(|r| r.next) else {
                break;
            };
            last = next;
            count += 1;
        }

        let new_head = tasks.get(last).and_then(|r| r.next);
        if let Some(record) = tasks.get_mut(last) {
            record.next = None;
        }
        match new_head {
            Some(nh) => {
                if let Some(record) = tasks.get_mut(nh) {
                    record.prev = None;
                }
            }
            None => self.tail = None,
        }
        self.head = new_head;
        self.len -= count;
        Batch::from_run(first, last, count)
    }

    /// Detaches up to `n` records from the back, references transferred.
    pub(crate) fn trunc_back(&mut self, n: usize, tasks: &mut TaskTable) -> Batch {
        if n == 0 || self.is_empty() {
            return Batch::new();
        }
        let last = self.tail.expect("non-empty queue has a tail");
        let mut first = last;
        let mut count = 1usize;
        while count < n {
            let Some(prev) = tasks.get(first).and_then(|r| r.prev) else {
                break;
            };
            first = prev;
            count += 1;
        }

        let new_tail = tasks.get(first).and_then(|r| r.prev);
        if let Some(record) = tasks.get_mut(first) {
            record.prev = None;
        }
        match new_tail {
            Some(nt) => {
                if let Some(record) = tasks.get_mut(nt) {
                    record.next = None;
                }
            }
            None => self.head = None,
        }
        self.tail = new_tail;
        self.len -= count;
        Batch::from_run(first, last, count)
    }

    /// Removes a specific linked record.
    ///
    /// With `validate`, the record's stored tag must equal this queue's tag
    /// or the call fails without mutating anything — this is how a stale or
    /// already-moved record is detected. `release` controls whether the
    /// queue's reference is dropped or handed to the caller.
    pub(crate) fn erase(
        &mut self,
        id: TaskId,
        tasks: &mut TaskTable,
        validate: bool,
        policy: RefPolicy,
    ) -> bool {
        let (prev, next) = {
            let Some(record) = tasks.get_mut(id) else {
                return false;
            };
            if validate && record.tag != Some(self.tag) {
                return false;
            }
            debug_assert!(
                record.tag == Some(self.tag),
                "unvalidated erase of {id:?} from a queue it is not in"
            );
            let links = (record.prev, record.next);
            record.clear_links();
            links
        };
        match prev {
            Some(p) => {
                if let Some(record) = tasks.get_mut(p) {
                    record.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(record) = tasks.get_mut(n) {
                    record.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        debug_assert!(self.len > 0, "erase from empty queue");
        self.len -= 1;
        if policy == RefPolicy::Retain {
            let removed = tasks.release(id);
            debug_assert!(!removed, "queue held the last reference to {id:?}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRecord;
    use proptest::prelude::*;

    fn setup(n: u64) -> (TaskTable, Vec<TaskId>) {
        let mut table = TaskTable::new();
        let ids = (0..n)
            .map(|uid| table.insert(TaskRecord::stub(uid)))
            .collect();
        (table, ids)
    }

    fn drain_ids(queue: &mut TsQueue, tasks: &mut TaskTable) -> Vec<TaskId> {
        let mut out = Vec::new();
        while let Some(id) = queue.pop(tasks) {
            out.push(id);
        }
        out
    }

    #[test]
    fn fifo_order() {
        let (mut t, ids) = setup(3);
        let mut q = TsQueue::new();
        for &id in &ids {
            q.push(id, &mut t, RefPolicy::Retain);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(&mut t), Some(ids[0]));
        assert_eq!(q.pop(&mut t), Some(ids[1]));
        assert_eq!(q.pop(&mut t), Some(ids[2]));
        assert_eq!(q.pop(&mut t), None);
        assert!(q.is_empty());
    }

    #[test]
    fn push_retains_pop_releases() {
        let (mut t, ids) = setup(1);
        let mut q = TsQueue::new();
        q.push(ids[0], &mut t, RefPolicy::Retain);
        assert_eq!(t.get(ids[0]).unwrap().refs(), 2);
        q.pop(&mut t);
        assert_eq!(t.get(ids[0]).unwrap().refs(), 1);
    }

    #[test]
    fn transfer_push_leaves_count_alone() {
        let (mut t, ids) = setup(1);
        let mut q = TsQueue::new();
        q.push(ids[0], &mut t, RefPolicy::Transfer);
        assert_eq!(t.get(ids[0]).unwrap().refs(), 1);
        // Hand the reference back out without releasing it.
        assert!(q.erase(ids[0], &mut t, false, RefPolicy::Transfer));
        assert_eq!(t.get(ids[0]).unwrap().refs(), 1);
    }

    #[test]
    fn trunc_back_detaches_tail_run() {
        let (mut t, ids) = setup(4);
        let mut q = TsQueue::new();
        for &id in &ids {
            q.push(id, &mut t, RefPolicy::Retain);
        }

        let mut batch = q.trunc_back(2, &mut t);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.ids(&t), vec![ids[2], ids[3]]);
        assert_eq!(q.len(), 2);
        assert_eq!(drain_ids(&mut q, &mut t), vec![ids[0], ids[1]]);

        let drained = batch.drain(&mut t);
        for id in drained {
            t.release(id);
        }
    }

    #[test]
    fn trunc_front_shorter_than_requested() {
        let (mut t, ids) = setup(2);
        let mut q = TsQueue::new();
        for &id in &ids {
            q.push(id, &mut t, RefPolicy::Retain);
        }
        let mut batch = q.trunc_front(5, &mut t);
        assert_eq!(batch.len(), 2);
        assert!(q.is_empty());
        let _ = batch.drain(&mut t);
    }

    #[test]
    fn erase_with_validation_rejects_foreign_tag() {
        let (mut t, ids) = setup(2);
        let mut q1 = TsQueue::new();
        let mut q2 = TsQueue::new();
        q1.push(ids[0], &mut t, RefPolicy::Retain);
        q2.push(ids[1], &mut t, RefPolicy::Retain);

        // ids[1] carries q2's tag; a validated erase against q1 must fail
        // without mutating either queue.
        assert!(!q1.erase(ids[1], &mut t, true, RefPolicy::Retain));
        assert_eq!(q1.len(), 1);
        assert_eq!(q2.len(), 1);
        assert_eq!(t.get(ids[1]).unwrap().refs(), 2);

        assert!(q2.erase(ids[1], &mut t, true, RefPolicy::Retain));
        assert_eq!(q2.len(), 0);
    }

    #[test]
    fn popped_record_can_join_another_queue() {
        let (mut t, ids) = setup(1);
        let mut q1 = TsQueue::new();
        let mut q2 = TsQueue::new();
        q1.push(ids[0], &mut t, RefPolicy::Retain);
        q1.pop(&mut t);

        // No double-ownership: the record is fully unlinked.
        assert!(!t.get(ids[0]).unwrap().is_linked());
        q2.push(ids[0], &mut t, RefPolicy::Retain);
        assert_eq!(q2.pop(&mut t), Some(ids[0]));
    }

    #[test]
    fn pop_all_transfers_everything() {
        let (mut t, ids) = setup(3);
        let mut q = TsQueue::new();
        for &id in &ids {
            q.push(id, &mut t, RefPolicy::Retain);
        }
        let mut batch = q.pop_all();
        assert!(q.is_empty());
        assert_eq!(q.pop(&mut t), None);
        assert_eq!(batch.ids(&t), ids);
        // References moved with the batch.
        assert_eq!(t.get(ids[0]).unwrap().refs(), 2);
        let _ = batch.drain(&mut t);
    }

    #[test]
    fn batch_splice_preserves_order_and_stale_tags_refresh() {
        let (mut t, ids) = setup(4);
        let mut src = TsQueue::new();
        let mut dst = TsQueue::new();
        for &id in &ids[..2] {
            src.push(id, &mut t, RefPolicy::Retain);
        }
        for &id in &ids[2..] {
            dst.push(id, &mut t, RefPolicy::Retain);
        }

        let batch = src.pop_all();
        dst.push_batch(batch, &mut t);
        assert_eq!(dst.len(), 4);

        // Spliced members still carry the source tag until observed.
        assert_eq!(t.get(ids[0]).unwrap().tag, Some(src.tag()));
        assert!(!dst.erase(ids[0], &mut t, true, RefPolicy::Retain));

        // front() refreshes the tag of the record it returns.
        let front = dst.front(&mut t).unwrap();
        assert_eq!(front, ids[2]);
        let next = dst.successor(front, &mut t).unwrap();
        assert_eq!(next, ids[3]);
        let spliced = dst.successor(next, &mut t).unwrap();
        assert_eq!(spliced, ids[0]);
        assert!(dst.erase(spliced, &mut t, true, RefPolicy::Retain));

        assert_eq!(drain_ids(&mut dst, &mut t), vec![ids[2], ids[3], ids[1]]);
    }

    #[test]
    fn batch_append_and_trunc_tail() {
        let (mut t, ids) = setup(5);
        let mut q = TsQueue::new();
        for &id in &ids {
            q.push(id, &mut t, RefPolicy::Retain);
        }
        let mut a = q.trunc_front(2, &mut t);
        let b = q.trunc_front(3, &mut t);
        a.append(b, &mut t);
        assert_eq!(a.len(), 5);
        assert_eq!(a.ids(&t), ids);

        let mut tail = a.trunc_tail(2, &mut t);
        assert_eq!(tail.ids(&t), vec![ids[3], ids[4]]);
        assert_eq!(a.ids(&t), vec![ids[0], ids[1], ids[2]]);

        let _ = a.drain(&mut t);
        let _ = tail.drain(&mut t);
    }

    #[test]
    fn batch_remove_middle_member() {
        let (mut t, ids) = setup(3);
        let mut q = TsQueue::new();
        for &id in &ids {
            q.push(id, &mut t, RefPolicy::Retain);
        }
        let mut batch = q.pop_all();
        assert!(batch.remove(ids[1], &mut t));
        assert!(!batch.remove(ids[1], &mut t));
        assert_eq!(batch.ids(&t), vec![ids[0], ids[2]]);
        assert!(!t.get(ids[1]).unwrap().is_linked());
        let _ = batch.drain(&mut t);
    }

    proptest! {
        // Interleaved pushes and pops stay FIFO regardless of operation mix.
        #[test]
        fn queue_is_fifo_under_any_interleaving(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let (mut t, ids) = setup(64);
            let mut q = TsQueue::new();
            let mut next_push = 0usize;
            let mut expect = std::collections::VecDeque::new();

            for push in ops {
                if push && next_push < ids.len() {
                    q.push(ids[next_push], &mut t, RefPolicy::Retain);
                    expect.push_back(ids[next_push]);
                    next_push += 1;
                } else {
                    prop_assert_eq!(q.pop(&mut t), expect.pop_front());
                }
            }
            prop_assert_eq!(q.len(), expect.len());
        }
    }
}
