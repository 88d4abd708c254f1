//! Per-thread processor: queues, run loop, wake protocol, stealing.
//!
//! A processor owns three queues. `runnable` holds the tasks it is
//! cycling through; `ready` is the cross-thread submission target; and
//! `garbage` accumulates finished tasks so reference-count releases are
//! batched instead of taken one table lock at a time.
//!
//! # Lock order
//!
//! `run` before `ready` before the garbage queue's lock before the task
//! table. Any path that takes more than one of these takes them in that
//! order; the table lock is always innermost and never held across a
//! coroutine resume.

use super::intrusive::{Batch, RefPolicy, TsQueue};
use super::queue::TaskQueue;
use super::scheduler::Shared;
use crate::config::Tunables;
use crate::task::coroutine::Coroutine;
use crate::task::{TaskId, TaskState, TaskTable};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
    static CURRENT_TASK: Cell<Option<CurrentTask>> = const { Cell::new(None) };
}

/// Ambient scheduler identity of a worker thread.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub proc: Arc<Processor>,
    pub shared: Weak<Shared>,
}

/// Identity of the task currently resumed on this thread.
#[derive(Clone, Copy)]
pub(crate) struct CurrentTask {
    pub id: TaskId,
    pub uid: u64,
}

/// Runs `f` with this thread's worker context, if it is a worker.
pub(crate) fn with_context<R>(f: impl FnOnce(Option<&WorkerContext>) -> R) -> R {
    CONTEXT.with(|ctx| f(ctx.borrow().as_ref()))
}

pub(crate) fn current_task() -> Option<CurrentTask> {
    CURRENT_TASK.with(Cell::get)
}

/// State behind the `run` lock: the runnable queue plus the running and
/// precomputed-next cursors. Keeping the cursors under the same lock as
/// the queue is what lets a stealer protect them atomically.
#[derive(Debug)]
struct RunState {
    queue: TsQueue,
    running: Option<TaskId>,
    next: Option<TaskId>,
}

/// State behind the `ready` lock: the incoming queue plus the sleep/wake
/// flags of the lost-wakeup protocol.
#[derive(Debug)]
struct ReadyState {
    queue: TsQueue,
    waiting: bool,
    notified: bool,
}

/// One worker's scheduling state. The OS thread itself is owned by the
/// scheduler; everything here is shared so submitters, stealers and the
/// dispatch thread can reach it.
pub(crate) struct Processor {
    index: usize,
    tasks: Arc<Mutex<TaskTable>>,
    running: Arc<AtomicBool>,
    tunables: Arc<Tunables>,
    run: Mutex<RunState>,
    ready: Mutex<ReadyState>,
    ready_cv: Condvar,
    ready_len: AtomicUsize,
    garbage: TaskQueue,
    active: AtomicBool,
    switches: AtomicU64,
    mark: AtomicU64,
}

impl Processor {
    pub(crate) fn new(
        index: usize,
        tasks: Arc<Mutex<TaskTable>>,
        running: Arc<AtomicBool>,
        tunables: Arc<Tunables>,
    ) -> Self {
        Self {
            index,
            garbage: TaskQueue::new(Arc::clone(&tasks)),
            tasks,
            running,
            tunables,
            run: Mutex::new(RunState {
                queue: TsQueue::new(),
                running: None,
                next: None,
            }),
            ready: Mutex::new(ReadyState {
                queue: TsQueue::new(),
                waiting: false,
                notified: false,
            }),
            ready_cv: Condvar::new(),
            ready_len: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            // Sentinel so the first supervision tick never sees a
            // coincidentally equal progress mark.
            switches: AtomicU64::new(0),
            mark: AtomicU64::new(u64::MAX),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Runnable plus incoming work, the dispatch thread's load metric.
    pub(crate) fn load(&self) -> usize {
        self.run.lock().queue.len() + self.ready_len.load(Ordering::Acquire)
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready_len.load(Ordering::Acquire)
    }

    pub(crate) fn is_sleeping(&self) -> bool {
        self.ready.lock().waiting
    }

    pub(crate) fn has_running(&self) -> bool {
        self.run.lock().running.is_some()
    }

    /// Records the current switch count; [`is_stalled`](Self::is_stalled)
    /// compares against it on the next supervision tick.
    pub(crate) fn note_progress_mark(&self) {
        self.mark
            .store(self.switches.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.mark.load(Ordering::Relaxed) == self.switches.load(Ordering::Relaxed)
    }

    /// Links a task onto the incoming queue and wakes the worker.
    ///
    /// The wake protocol: with the ready lock held, either signal the
    /// condition variable (worker already committed to sleeping) or set
    /// `notified` so the worker's next attempt to sleep short-circuits.
    pub(crate) fn add_task(&self, id: TaskId, policy: RefPolicy) {
        let mut ready = self.ready.lock();
        {
            let mut tasks = self.tasks.lock();
            ready.queue.push(id, &mut tasks, policy);
        }
        self.ready_len.store(ready.queue.len(), Ordering::Release);
        if ready.waiting {
            self.ready_cv.notify_one();
        } else {
            ready.notified = true;
        }
    }

    /// Splices a redistributed batch onto the incoming queue; references
    /// ride in with the batch.
    pub(crate) fn add_batch(&self, batch: Batch) {
        if batch.is_empty() {
            drop(batch);
            return;
        }
        let mut ready = self.ready.lock();
        {
            let mut tasks = self.tasks.lock();
            ready.queue.push_batch(batch, &mut tasks);
        }
        self.ready_len.store(ready.queue.len(), Ordering::Release);
        if ready.waiting {
            self.ready_cv.notify_one();
        } else {
            ready.notified = true;
        }
    }

    /// Marks the processor active and nudges it out of (or away from) its
    /// sleep, used by the dispatch thread and by `stop`.
    pub(crate) fn wake_worker(&self) {
        let mut ready = self.ready.lock();
        if ready.waiting {
            self.ready_cv.notify_one();
        } else {
            ready.notified = true;
        }
    }

    /// Removes up to `n` tasks for redistribution; `n == 0` takes
    /// everything (evacuation of a stalled processor).
    ///
    /// Prefers the tail of `ready`, then the tail of `runnable`. The
    /// running and precomputed-next tasks are never in the result: they
    /// are erased up front when their tag validates, and fished back out
    /// of the stolen batch when it did not (a stale tag after a splice),
    /// then reinserted.
    pub(crate) fn steal(&self, n: usize) -> Batch {
        let mut run = self.run.lock();
        let mut ready = self.ready.lock();
        let mut tasks = self.tasks.lock();

        let mut out = if n == 0 {
            ready.queue.pop_all()
        } else {
            ready.queue.trunc_back(n, &mut tasks)
        };
        self.ready_len.store(ready.queue.len(), Ordering::Release);

        let want = if n == 0 {
            run.queue.len()
        } else {
            n.saturating_sub(out.len())
        };
        if want > 0 && !run.queue.is_empty() {
            let mut shielded: SmallVec<[TaskId; 2]> = SmallVec::new();
            for id in [run.running, run.next].into_iter().flatten() {
                if run.queue.erase(id, &mut tasks, true, RefPolicy::Transfer) {
                    shielded.push(id);
                }
            }
            let mut grabbed = run.queue.trunc_back(want, &mut tasks);
            for id in [run.running, run.next].into_iter().flatten() {
                if !shielded.contains(&id) && grabbed.remove(id, &mut tasks) {
                    shielded.push(id);
                }
            }
            out.append(grabbed, &mut tasks);
            for id in shielded {
                run.queue.push(id, &mut tasks, RefPolicy::Transfer);
            }
        }
        if !out.is_empty() {
            trace!(processor = self.index, stolen = out.len(), "tasks stolen");
        }
        out
    }

    /// Drains the garbage queue, releasing one reference per entry.
    /// Returns the number of records reclaimed.
    pub(crate) fn gc(&self) -> usize {
        let mut batch = self.garbage.pop_all();
        if batch.is_empty() {
            drop(batch);
            return 0;
        }
        let mut tasks = self.tasks.lock();
        let ids = batch.drain(&mut tasks);
        let count = ids.len();
        for id in ids {
            tasks.release(id);
        }
        trace!(processor = self.index, reclaimed = count, "garbage reclaimed");
        count
    }

    /// Suspends the task currently resumed on this processor.
    ///
    /// Called from inside the task, before it yields. Precomputes the
    /// queue successor as the next task to run and unlinks the record,
    /// which keeps the reference with the suspended task. Returns false
    /// when a wake already arrived, in which case the caller must not
    /// yield at all.
    pub(crate) fn park_current(&self, id: TaskId) -> bool {
        let mut run = self.run.lock();
        let mut tasks = self.tasks.lock();
        let Some(record) = tasks.get_mut(id) else {
            debug_assert!(false, "park of missing record {id:?}");
            return false;
        };
        if record.wake_pending {
            record.wake_pending = false;
            return false;
        }
        record.state = TaskState::Wait;
        run.next = run.queue.successor(id, &mut tasks);
        run.queue.erase(id, &mut tasks, false, RefPolicy::Transfer);
        true
    }

    /// Points the running cursor at `id` without queueing it (test setup).
    #[cfg(test)]
    pub(crate) fn force_running(&self, id: TaskId) {
        self.run.lock().running = Some(id);
    }

    /// The worker thread body. Returns when the scheduler stops.
    pub(crate) fn run(self: &Arc<Self>, shared: &Weak<Shared>) {
        CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = Some(WorkerContext {
                proc: Arc::clone(self),
                shared: Weak::clone(shared),
            });
        });
        debug!(processor = self.index, "worker started");

        while self.running.load(Ordering::Acquire) {
            if !self.take_front() {
                self.idle_sleep();
                continue;
            }
            self.set_active(true);
            self.run_ready_tasks();
        }

        self.gc();
        CONTEXT.with(|ctx| {
            ctx.borrow_mut().take();
        });
        debug!(processor = self.index, "worker stopped");
    }

    /// Points `running` at the front of `runnable`, admitting the whole
    /// incoming queue first if `runnable` is empty.
    fn take_front(&self) -> bool {
        let mut run = self.run.lock();
        {
            let mut tasks = self.tasks.lock();
            run.running = run.queue.front(&mut tasks);
        }
        if run.running.is_none() {
            let mut ready = self.ready.lock();
            let mut tasks = self.tasks.lock();
            let batch = ready.queue.pop_all();
            run.queue.push_batch(batch, &mut tasks);
            self.ready_len.store(0, Ordering::Release);
            run.running = run.queue.front(&mut tasks);
        }
        run.running.is_some()
    }

    /// Sleeps until work arrives or the scheduler stops. Deferred garbage
    /// is reclaimed first as idle-time work.
    fn idle_sleep(&self) {
        self.gc();
        let mut ready = self.ready.lock();
        if ready.notified {
            ready.notified = false;
            return;
        }
        if !ready.queue.is_empty() {
            return;
        }
        self.set_active(false);
        ready.waiting = true;
        while ready.queue.is_empty() && !ready.notified && self.running.load(Ordering::Acquire) {
            self.ready_cv.wait(&mut ready);
        }
        ready.waiting = false;
        ready.notified = false;
    }

    /// One scheduling pass: cycles through the runnable queue, resuming
    /// tasks until the cursor runs out. `quota` bounds how many times the
    /// incoming queue may be admitted mid-pass.
    fn run_ready_tasks(&self) {
        let mut quota = 1usize;
        while self.running.load(Ordering::Acquire) {
            let Some((id, mut coroutine, uid)) = self.begin_resume() else {
                return;
            };

            CURRENT_TASK.with(|c| c.set(Some(CurrentTask { id, uid })));
            let done = coroutine.resume();
            CURRENT_TASK.with(|c| c.set(None));
            self.switches.fetch_add(1, Ordering::Relaxed);

            if !self.end_resume(id, coroutine, done, &mut quota) {
                return;
            }
        }
    }

    /// Takes the running task's execution context out of its record.
    fn begin_resume(&self) -> Option<(TaskId, Coroutine, u64)> {
        let mut run = self.run.lock();
        let id = run.running?;
        let mut tasks = self.tasks.lock();
        let Some(record) = tasks.get_mut(id) else {
            debug_assert!(false, "running cursor points at missing record {id:?}");
            run.running = None;
            return None;
        };
        record.state = TaskState::Runnable;
        record.owner = Some(self.index);
        record.parked = false;
        let uid = record.uid;
        let Some(coroutine) = record.coroutine.take() else {
            debug_assert!(false, "running record {id:?} has no execution context");
            run.running = None;
            return None;
        };
        Some((id, coroutine, uid))
    }

    /// Stores the context back, transitions the task, and advances the
    /// running cursor. Returns false when the pass is over.
    fn end_resume(&self, id: TaskId, coroutine: Coroutine, done: bool, quota: &mut usize) -> bool {
        let mut slot = if done { None } else { Some(coroutine) };
        let mut run = self.run.lock();

        let state = {
            let mut tasks = self.tasks.lock();
            let Some(record) = tasks.get_mut(id) else {
                debug_assert!(false, "resumed record {id:?} vanished");
                run.running = None;
                return false;
            };
            if done {
                record.state = TaskState::Finish;
            } else {
                record.coroutine = slot.take();
            }
            record.state
        };

        match state {
            TaskState::Runnable => {
                let next = {
                    let mut tasks = self.tasks.lock();
                    run.queue.successor(id, &mut tasks)
                };
                if next.is_some() {
                    run.running = next;
                    return true;
                }
                if *quota >= 1 && self.splice_ready(&mut run) {
                    *quota -= 1;
                    let mut tasks = self.tasks.lock();
                    run.running = run.queue.successor(id, &mut tasks);
                    return run.running.is_some();
                }
                run.running = None;
                false
            }
            TaskState::Wait => {
                let mut tasks = self.tasks.lock();
                if let Some(record) = tasks.get_mut(id) {
                    if record.wake_pending {
                        // Woken while still on our stack; now that the
                        // context is stored back it can simply requeue.
                        record.wake_pending = false;
                        record.state = TaskState::Runnable;
                        run.queue.push(id, &mut tasks, RefPolicy::Transfer);
                    } else {
                        // Commit point: a wake may re-place the task from
                        // here on.
                        record.parked = true;
                    }
                }
                run.running = run.next.take();
                run.running.is_some()
            }
            TaskState::Finish => {
                let mut next = {
                    let mut tasks = self.tasks.lock();
                    run.queue.successor(id, &mut tasks)
                };
                if next.is_none() && *quota >= 1 && self.splice_ready(&mut run) {
                    *quota -= 1;
                    let mut tasks = self.tasks.lock();
                    next = run.queue.successor(id, &mut tasks);
                }
                {
                    let mut tasks = self.tasks.lock();
                    run.queue.erase(id, &mut tasks, false, RefPolicy::Retain);
                }
                if self.garbage.len() > self.tunables.gc_threshold() {
                    self.gc();
                }
                // The record's remaining (creation) reference rides the
                // garbage queue until the next reclamation pass.
                self.garbage.push(id, RefPolicy::Transfer);
                run.running = next;
                run.running.is_some()
            }
        }
    }

    /// Admits the whole incoming queue into `runnable`. Returns false if
    /// there was nothing to admit.
    fn splice_ready(&self, run: &mut RunState) -> bool {
        let mut ready = self.ready.lock();
        if ready.queue.is_empty() {
            return false;
        }
        let mut tasks = self.tasks.lock();
        let batch = ready.queue.pop_all();
        run.queue.push_batch(batch, &mut tasks);
        self.ready_len.store(0, Ordering::Release);
        true
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("index", &self.index)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::task::TaskRecord;
    use std::sync::atomic::AtomicUsize;

    const STACK: usize = 64 * 1024;

    fn harness() -> (Arc<Mutex<TaskTable>>, Arc<AtomicBool>, Arc<Processor>) {
        let tasks = Arc::new(Mutex::new(TaskTable::new()));
        let running = Arc::new(AtomicBool::new(true));
        let proc = Arc::new(Processor::new(
            0,
            Arc::clone(&tasks),
            Arc::clone(&running),
            Arc::new(Tunables::new(&Config::default())),
        ));
        (tasks, running, proc)
    }

    fn stub(tasks: &Arc<Mutex<TaskTable>>, uid: u64) -> TaskId {
        tasks.lock().insert(TaskRecord::stub(uid))
    }

    #[test]
    fn submission_sets_notified_when_awake() {
        let (tasks, _running, proc) = harness();
        let id = stub(&tasks, 1);
        proc.add_task(id, RefPolicy::Retain);
        assert_eq!(proc.ready_len(), 1);
        assert!(proc.ready.lock().notified);
        assert!(!proc.is_sleeping());
    }

    #[test]
    fn take_front_admits_incoming_work() {
        let (tasks, _running, proc) = harness();
        let a = stub(&tasks, 1);
        let b = stub(&tasks, 2);
        proc.add_task(a, RefPolicy::Retain);
        proc.add_task(b, RefPolicy::Retain);

        assert!(proc.take_front());
        let run = proc.run.lock();
        assert_eq!(run.running, Some(a));
        assert_eq!(run.queue.len(), 2);
        drop(run);
        assert_eq!(proc.ready_len(), 0);
    }

    #[test]
    fn steal_protects_running_and_next() {
        let (tasks, _running, proc) = harness();
        let ids: Vec<_> = (0..5).map(|uid| stub(&tasks, uid)).collect();
        for &id in &ids {
            proc.add_task(id, RefPolicy::Retain);
        }
        assert!(proc.take_front());
        {
            // Pretend ids[1] was precomputed as next.
            let mut run = proc.run.lock();
            let mut t = tasks.lock();
            run.next = run.queue.successor(ids[0], &mut t);
            assert_eq!(run.next, Some(ids[1]));
        }

        let mut batch = proc.steal(0);
        let stolen = {
            let mut t = tasks.lock();
            batch.drain(&mut t)
        };
        assert!(!stolen.contains(&ids[0]));
        assert!(!stolen.contains(&ids[1]));
        assert_eq!(stolen.len(), 3);

        // The shielded pair is still queued locally.
        let run = proc.run.lock();
        assert_eq!(run.queue.len(), 2);
        drop(run);
        let mut t = tasks.lock();
        for id in stolen {
            t.release(id);
        }
    }

    #[test]
    fn steal_prefers_ready_tail() {
        let (tasks, _running, proc) = harness();
        let ids: Vec<_> = (0..4).map(|uid| stub(&tasks, uid)).collect();
        for &id in &ids {
            proc.add_task(id, RefPolicy::Retain);
        }

        let mut batch = proc.steal(2);
        let stolen = {
            let mut t = tasks.lock();
            batch.drain(&mut t)
        };
        assert_eq!(stolen.as_slice(), &[ids[2], ids[3]]);
        assert_eq!(proc.ready_len(), 2);
        let mut t = tasks.lock();
        for id in stolen {
            t.release(id);
        }
    }

    #[test]
    fn runs_tasks_in_submission_order_exactly_once() {
        let (tasks, running, proc) = harness();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut ids = Vec::new();
        {
            let mut t = tasks.lock();
            for uid in 0..3u64 {
                let log = Arc::clone(&order);
                let flag = Arc::clone(&running);
                let co = Coroutine::new(STACK, move || {
                    log.lock().push(uid);
                    if uid == 2 {
                        flag.store(false, Ordering::Release);
                    }
                });
                ids.push(t.insert(TaskRecord::new(uid, co)));
            }
        }
        for id in ids {
            proc.add_task(id, RefPolicy::Retain);
        }

        proc.run(&Weak::new());
        assert_eq!(order.lock().as_slice(), &[0, 1, 2]);
        // All records passed through the garbage queue and were reclaimed.
        assert_eq!(tasks.lock().len(), 0);
    }

    #[test]
    fn yielding_tasks_interleave() {
        let (tasks, running, proc) = harness();
        let order = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(AtomicUsize::new(2));

        let mut ids = Vec::new();
        {
            let mut t = tasks.lock();
            for uid in 0..2u64 {
                let log = Arc::clone(&order);
                let left = Arc::clone(&pending);
                let flag = Arc::clone(&running);
                let co = Coroutine::new(STACK, move || {
                    log.lock().push(uid);
                    generator::yield_with(());
                    log.lock().push(uid);
                    if left.fetch_sub(1, Ordering::AcqRel) == 1 {
                        flag.store(false, Ordering::Release);
                    }
                });
                ids.push(t.insert(TaskRecord::new(uid, co)));
            }
        }
        for id in ids {
            proc.add_task(id, RefPolicy::Retain);
        }

        proc.run(&Weak::new());
        assert_eq!(order.lock().as_slice(), &[0, 1, 0, 1]);
    }

    #[test]
    fn gc_waits_for_threshold_then_reclaims() {
        let (tasks, _running, proc) = harness();
        let ids: Vec<_> = (0..3).map(|uid| stub(&tasks, uid)).collect();
        for &id in &ids {
            // Transfer the creation reference straight to the garbage queue.
            proc.garbage.push(id, RefPolicy::Transfer);
        }
        assert_eq!(tasks.lock().len(), 3);
        assert_eq!(proc.gc(), 3);
        assert_eq!(tasks.lock().len(), 0);
        assert_eq!(proc.gc(), 0);
    }
}
