//! Scheduler: task creation, placement, lifecycle, and wake handles.

use super::dispatch;
use super::intrusive::RefPolicy;
use super::processor::{with_context, Processor};
use crate::config::{Config, Tunables, MIN_STACK};
use crate::error::Error;
use crate::spawn::SpawnOptions;
use crate::task::coroutine::Coroutine;
use crate::task::{TaskId, TaskRecord, TaskState, TaskTable};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// State shared by the scheduler handle, its workers, and the dispatch
/// thread.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) running: Arc<AtomicBool>,
    started: AtomicBool,
    pub(crate) procs: RwLock<Vec<Arc<Processor>>>,
    pub(crate) tasks: Arc<Mutex<TaskTable>>,
    next_uid: AtomicU64,
    pub(crate) last_active: AtomicUsize,
    pub(crate) min: AtomicUsize,
    pub(crate) max: AtomicUsize,
    pub(crate) tunables: Arc<Tunables>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop_lock: Mutex<()>,
}

impl Shared {
    fn new(config: Config) -> Arc<Self> {
        let config = config.normalize();
        let tasks = Arc::new(Mutex::new(TaskTable::new()));
        let running = Arc::new(AtomicBool::new(false));
        let tunables = Arc::new(Tunables::new(&config));
        let shared = Arc::new(Self {
            config,
            running: Arc::clone(&running),
            started: AtomicBool::new(false),
            procs: RwLock::new(Vec::new()),
            tasks: Arc::clone(&tasks),
            next_uid: AtomicU64::new(1),
            last_active: AtomicUsize::new(0),
            min: AtomicUsize::new(1),
            max: AtomicUsize::new(1),
            tunables,
            dispatch: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            stop_lock: Mutex::new(()),
        });
        // Processor 0 exists from the start so tasks can be submitted
        // before `start`; its loop runs on the starting thread.
        shared.procs.write().push(Arc::new(Processor::new(
            0,
            Arc::clone(&shared.tasks),
            running,
            Arc::clone(&shared.tunables),
        )));
        shared
    }

    pub(crate) fn make_task<F>(
        self: &Arc<Self>,
        stack_size: usize,
        f: F,
    ) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let coroutine = Coroutine::new(stack_size, f);
        let id = self.tasks.lock().insert(TaskRecord::new(uid, coroutine));
        self.place(id, RefPolicy::Retain);
        TaskHandle {
            id,
            uid,
            shared: Arc::downgrade(self),
        }
    }

    /// Places a task on some processor's incoming queue.
    ///
    /// Preference order: the task's last owning processor if still
    /// active, then the submitting worker's own processor when it belongs
    /// to this scheduler, then a round-robin scan from just past the
    /// last-activated index for any active processor, and finally the
    /// last-activated slot regardless of its state (pre-start, that is
    /// processor 0).
    pub(crate) fn place(self: &Arc<Self>, id: TaskId, policy: RefPolicy) {
        let owner = self.tasks.lock().get(id).and_then(|r| r.owner);
        let procs = self.procs.read();
        debug_assert!(!procs.is_empty());

        let target = owner
            .and_then(|i| procs.get(i))
            .filter(|p| p.is_active())
            .map(Arc::clone)
            .or_else(|| {
                with_context(|ctx| {
                    let ctx = ctx?;
                    let ours = std::ptr::eq(ctx.shared.as_ptr(), Arc::as_ptr(self));
                    (ours && ctx.proc.is_active()).then(|| Arc::clone(&ctx.proc))
                })
            })
            .or_else(|| {
                let start = self.last_active.load(Ordering::Relaxed);
                let n = procs.len();
                (1..=n)
                    .map(|k| &procs[(start + k) % n])
                    .find(|p| p.is_active())
                    .map(Arc::clone)
            })
            .unwrap_or_else(|| {
                let n = procs.len();
                Arc::clone(&procs[self.last_active.load(Ordering::Relaxed) % n])
            });
        drop(procs);
        target.add_task(id, policy);
    }

    /// Creates one more processor with its own worker thread.
    pub(crate) fn spawn_processor(self: &Arc<Self>) -> Result<(), Error> {
        let mut procs = self.procs.write();
        let index = procs.len();
        let proc = Arc::new(Processor::new(
            index,
            Arc::clone(&self.tasks),
            Arc::clone(&self.running),
            Arc::clone(&self.tunables),
        ));
        let weak = Arc::downgrade(self);
        let worker = Arc::clone(&proc);
        let handle = thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || worker.run(&weak))?;
        procs.push(proc);
        self.workers.lock().push(handle);
        debug!(processor = index, "processor spawned");
        Ok(())
    }

    fn stop(self: &Arc<Self>) {
        let _guard = self.stop_lock.lock();
        if self.running.swap(false, Ordering::AcqRel) {
            info!("scheduler stopping");
            for p in self.procs.read().iter() {
                p.wake_worker();
            }
            self.join_threads();
        }
        self.reclaim_all();
    }

    /// Joins the dispatch thread and every worker thread, skipping the
    /// calling thread itself (stop may be invoked from inside a task).
    fn join_threads(self: &Arc<Self>) {
        let me = thread::current().id();
        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    /// Drops every task that never got to run (and every deferred
    /// release) so `task_count` reads zero after shutdown.
    fn reclaim_all(self: &Arc<Self>) {
        let procs: Vec<Arc<Processor>> = self.procs.read().clone();
        for p in &procs {
            let mut batch = p.steal(0);
            let ids = {
                let mut tasks = self.tasks.lock();
                batch.drain(&mut tasks)
            };
            {
                let mut tasks = self.tasks.lock();
                for id in ids {
                    tasks.release(id);
                }
            }
            p.gc();
        }
        let mut tasks = self.tasks.lock();
        let leftover = tasks.len();
        if leftover > 0 {
            debug!(count = leftover, "dropping tasks that never completed");
        }
        tasks.clear();
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("processors", &self.procs.read().len())
            .finish_non_exhaustive()
    }
}

/// An M:N coroutine scheduler.
///
/// Multiplexes cooperative tasks onto a pool of worker threads with work
/// stealing and periodic load balancing. See the crate docs for a usage
/// example.
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler with the default [`Config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a scheduler with an explicit configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            shared: Shared::new(config),
        }
    }

    /// Submits a closure as a new task and returns a handle to it.
    ///
    /// Tasks may be submitted before `start`; they run once the
    /// scheduler starts.
    pub fn spawn<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.make_task(self.shared.config.stack_size, f)
    }

    /// Submits a closure with explicit per-task options.
    pub fn spawn_with<F>(&self, options: SpawnOptions, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = options
            .stack_size
            .unwrap_or(self.shared.config.stack_size)
            .max(MIN_STACK);
        self.shared.make_task(stack, f)
    }

    /// Runs the scheduler on the calling thread until it stops.
    ///
    /// Starts `min` processors (`min - 1` extra worker threads plus the
    /// calling thread) and allows growth up to `max`; zero for either
    /// means the hardware parallelism. The dispatch thread is started
    /// when `max > 1`. May be called at most once per scheduler.
    pub fn start(&self, min: usize, max: usize) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let hw = thread::available_parallelism().map_or(1, |n| n.get());
        let min = if min == 0 { hw } else { min };
        let max = if max == 0 { hw.max(min) } else { max.max(min) };
        shared.min.store(min, Ordering::Relaxed);
        shared.max.store(max, Ordering::Relaxed);
        shared.running.store(true, Ordering::Release);
        info!(min, max, "scheduler starting");

        for _ in 1..min {
            if let Err(err) = shared.spawn_processor() {
                shared.stop();
                return Err(err);
            }
        }
        if max > 1 {
            let for_dispatch = Arc::clone(shared);
            let interval = shared.config.dispatch_interval;
            match thread::Builder::new()
                .name("weft-dispatch".into())
                .spawn(move || dispatch::run(&for_dispatch, interval))
            {
                Ok(handle) => *shared.dispatch.lock() = Some(handle),
                Err(err) => {
                    shared.stop();
                    return Err(err.into());
                }
            }
        }

        let proc0 = Arc::clone(&shared.procs.read()[0]);
        proc0.set_active(true);
        proc0.run(&Arc::downgrade(shared));

        // The loop exited, so the scheduler is stopping; collect any
        // threads a foreign-thread stop could not join.
        shared.join_threads();
        Ok(())
    }

    /// Stops the scheduler: wakes every worker, joins the dispatch and
    /// worker threads, and reclaims unfinished tasks. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// True between a successful `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of tasks created and not yet reclaimed.
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Current size of the processor pool.
    pub fn processor_count(&self) -> usize {
        self.shared.procs.read().len()
    }

    /// Forces an immediate reclamation pass on every processor's garbage
    /// queue. Returns the number of records reclaimed.
    pub fn collect_garbage(&self) -> usize {
        let procs: Vec<Arc<Processor>> = self.shared.procs.read().clone();
        procs.iter().map(|p| p.gc()).sum()
    }

    /// Adjusts the deferred-reclamation threshold at runtime.
    pub fn set_gc_threshold(&self, threshold: usize) {
        self.shared.tunables.set_gc_threshold(threshold);
    }

    /// Adjusts the load-balancing sensitivity at runtime.
    pub fn set_load_balance_rate(&self, rate: f32) {
        self.shared.tunables.set_load_balance_rate(rate);
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// Handle to a spawned task.
///
/// Cheap to clone; holds no reference that would keep the task alive.
/// Its only operation besides identity is [`wake`](Self::wake), which
/// re-submits a task that parked itself.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    uid: u64,
    shared: Weak<Shared>,
}

impl TaskHandle {
    pub(crate) fn from_parts(id: TaskId, uid: u64, shared: Weak<Shared>) -> Self {
        Self { id, uid, shared }
    }

    /// The task's public id; unique per scheduler, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.uid
    }

    /// Re-submits the task if it parked itself, or records the wake so an
    /// in-flight park is skipped. Returns true if the task was re-placed
    /// onto a processor.
    ///
    /// Waking a finished (or reclaimed) task is a no-op.
    pub fn wake(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let claimed = {
            let mut tasks = shared.tasks.lock();
            let Some(record) = tasks.get_mut(self.id) else {
                return false;
            };
            if record.uid != self.uid {
                return false;
            }
            match record.state {
                TaskState::Wait if record.parked => {
                    // Claim the suspended task; its reference travels
                    // with it back onto a ready queue.
                    record.parked = false;
                    record.state = TaskState::Runnable;
                    true
                }
                TaskState::Finish => return false,
                _ => {
                    // Still on a processor's stack (or already queued);
                    // the owner consumes this instead of suspending.
                    record.wake_pending = true;
                    false
                }
            }
        };
        if claimed {
            shared.place(self.id, RefPolicy::Transfer);
        }
        claimed
    }
}
