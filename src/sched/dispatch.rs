//! Periodic supervision: blocked-processor evacuation, pool growth, and
//! load balancing.
//!
//! The dispatch thread wakes on a fixed tick and, per tick: classifies
//! each processor as blocked or not (a processor that holds a running
//! task, is not asleep, and made no context switch since the last tick
//! is treated as blocked), keeps at least `min` processors active,
//! evacuates blocked processors' queues onto active ones, grows the pool
//! up to `max` when nobody is active, and finally smooths load skew.
//!
//! The redistribution and rebalance arithmetic lives in pure planning
//! functions so their tie-breaking is pinned by unit tests.

use super::intrusive::Batch;
use super::processor::Processor;
use super::scheduler::Shared;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Dispatch thread body; returns when the scheduler stops.
pub(crate) fn run(shared: &Arc<Shared>, interval: Duration) {
    debug!("dispatch started");
    while shared.running.load(Ordering::Acquire) {
        thread::sleep(interval);
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        tick(shared);
    }
    debug!("dispatch stopped");
}

/// One supervision pass over the processor pool.
pub(crate) fn tick(shared: &Arc<Shared>) {
    let mut procs: Vec<Arc<Processor>> = shared.procs.read().clone();
    if procs.is_empty() {
        return;
    }
    let min = shared.min.load(Ordering::Relaxed);

    let mut blocked = vec![false; procs.len()];
    for (i, p) in procs.iter().enumerate() {
        if !p.is_sleeping() && p.has_running() && p.is_stalled() {
            p.set_active(false);
            blocked[i] = true;
            debug!(processor = p.index(), "processor appears blocked");
        }
        p.note_progress_mark();
    }

    let mut active: Vec<usize> = (0..procs.len()).filter(|&i| procs[i].is_active()).collect();
    if active.len() < min {
        for (i, p) in procs.iter().enumerate() {
            if active.len() >= min {
                break;
            }
            if p.is_active() {
                continue;
            }
            // Prefer a processor that can actually make progress: one not
            // classified blocked, or one that is merely asleep.
            if !blocked[i] || p.is_sleeping() {
                p.set_active(true);
                p.wake_worker();
                shared.last_active.store(i, Ordering::Relaxed);
                active.push(i);
            }
        }
        active.sort_unstable();
    }

    for &i in &active {
        let p = &procs[i];
        if p.load() > 0 && p.is_sleeping() {
            p.wake_worker();
        }
    }

    if active.is_empty() && procs.len() < shared.max.load(Ordering::Relaxed) {
        match shared.spawn_processor() {
            Ok(()) => {
                // The fresh processor takes over in the same tick, so the
                // blocked ones get evacuated onto it below.
                if let Some(p) = shared.procs.read().last().map(Arc::clone) {
                    p.set_active(true);
                    shared.last_active.store(p.index(), Ordering::Relaxed);
                    blocked.push(false);
                    active.push(procs.len());
                    procs.push(p);
                }
            }
            Err(err) => warn!(error = %err, "failed to grow processor pool"),
        }
    }
    if active.is_empty() {
        return;
    }

    evacuate_blocked(shared, &procs, &blocked, &active);
    rebalance(shared, &procs, &active);
}

/// Steals everything from blocked processors and spreads it over the
/// active ones.
fn evacuate_blocked(
    shared: &Arc<Shared>,
    procs: &[Arc<Processor>],
    blocked: &[bool],
    active: &[usize],
) {
    let mut pool = Batch::new();
    for (i, p) in procs.iter().enumerate() {
        if !blocked[i] {
            continue;
        }
        let stolen = p.steal(0);
        if stolen.is_empty() {
            drop(stolen);
            continue;
        }
        let mut tasks = shared.tasks.lock();
        pool.append(stolen, &mut tasks);
    }
    if pool.is_empty() {
        drop(pool);
        return;
    }
    debug!(count = pool.len(), "evacuating blocked processors");

    let loads: Vec<(usize, usize)> = active.iter().map(|&i| (procs[i].load(), i)).collect();
    let plan = plan_even_split(&loads, pool.len());
    for (slot, give) in plan {
        if give == 0 {
            continue;
        }
        let part = {
            let mut tasks = shared.tasks.lock();
            pool.trunc_tail(give, &mut tasks)
        };
        procs[slot].add_batch(part);
    }
    // Whatever the integer split left over lands on the least loaded.
    let least = loads
        .iter()
        .min()
        .map_or(active[0], |&(_, slot)| slot);
    procs[least].add_batch(pool);
}

/// Smooths load skew across active processors.
fn rebalance(shared: &Arc<Shared>, procs: &[Arc<Processor>], active: &[usize]) {
    let loads: Vec<(usize, usize)> = active.iter().map(|&i| (procs[i].load(), i)).collect();
    let rate = shared.tunables.load_balance_rate();
    if !should_rebalance(&loads, rate) {
        return;
    }
    let total: usize = loads.iter().map(|&(load, _)| load).sum();
    let avg = total / loads.len();
    if avg == 0 {
        return;
    }

    let mut overloaded: Vec<(usize, usize)> = loads
        .iter()
        .copied()
        .filter(|&(load, _)| load > avg)
        .collect();
    overloaded.sort_unstable_by(|a, b| b.cmp(a));

    let mut pool = Batch::new();
    for (load, slot) in overloaded {
        let stolen = procs[slot].steal(load - avg);
        if stolen.is_empty() {
            drop(stolen);
            continue;
        }
        let mut tasks = shared.tasks.lock();
        pool.append(stolen, &mut tasks);
    }
    if pool.is_empty() {
        drop(pool);
        return;
    }
    trace!(count = pool.len(), avg, "rebalancing load");

    let mut underloaded: Vec<(usize, usize)> = loads
        .iter()
        .copied()
        .filter(|&(load, _)| load < avg)
        .collect();
    underloaded.sort_unstable();
    for &(load, slot) in &underloaded {
        if pool.is_empty() {
            break;
        }
        let need = avg - load;
        let part = {
            let mut tasks = shared.tasks.lock();
            pool.trunc_tail(need, &mut tasks)
        };
        procs[slot].add_batch(part);
    }
    let least = underloaded
        .first()
        .map_or_else(|| loads.iter().min().map_or(active[0], |&(_, s)| s), |&(_, s)| s);
    procs[least].add_batch(pool);
}

/// Anti-thrashing guard: skip rebalancing while the least-loaded active
/// processor already carries more than `average * rate`.
fn should_rebalance(loads: &[(usize, usize)], rate: f32) -> bool {
    if loads.len() < 2 {
        return false;
    }
    let total: usize = loads.iter().map(|&(load, _)| load).sum();
    let avg = total / loads.len();
    let min = loads.iter().map(|&(load, _)| load).min().unwrap_or(0);
    (min as f32) <= (avg as f32) * rate
}

/// Plans the even split of `incoming` tasks over processors.
///
/// Walks processors in ascending load order, growing the candidate set
/// while each next processor's own load stays within the running average
/// of `incoming` plus the included loads. Processors beyond that point
/// are already busier than the post-split average and are left as-is.
/// Returns `(slot, give)` pairs; the gives sum to at most `incoming`,
/// with the integer remainder left to the caller.
fn plan_even_split(loads: &[(usize, usize)], incoming: usize) -> Vec<(usize, usize)> {
    if loads.is_empty() || incoming == 0 {
        return Vec::new();
    }
    let mut sorted = loads.to_vec();
    sorted.sort_unstable();

    let mut included = 0usize;
    let mut sum = 0usize;
    for &(load, _) in &sorted {
        let avg_with = (sum + load + incoming) / (included + 1);
        if included > 0 && load > avg_with {
            break;
        }
        sum += load;
        included += 1;
    }
    let avg = (sum + incoming) / included;
    sorted[..included]
        .iter()
        .map(|&(load, slot)| (slot, avg.saturating_sub(load)))
        .collect()
}
