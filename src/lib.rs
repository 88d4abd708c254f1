//! An embeddable M:N coroutine runtime.
//!
//! `weft` multiplexes cooperative, stackful tasks onto a small pool of OS
//! worker threads ("processors"). Each processor runs tasks from its own
//! queues; a background dispatch thread periodically evacuates blocked
//! processors and rebalances skewed load across the pool.
//!
//! # Model
//!
//! - Tasks are cooperative: a task runs until it calls [`yield_now`],
//!   [`park`]s, or returns. There is no preemption — a task that never
//!   yields starves its processor (but only its processor).
//! - Submission is cheap: [`spawn`] links the task into a processor's
//!   incoming queue under one lock.
//! - Cross-thread movement (submission, stealing, redistribution) always
//!   goes through locked queue operations; there is no lock-free path.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let sched = Arc::new(weft::Scheduler::new());
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..1000 {
//!     let counter = Arc::clone(&counter);
//!     sched.spawn(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//!
//! let runner = Arc::clone(&sched);
//! let handle = std::thread::spawn(move || runner.start(2, 4));
//! while sched.task_count() > 0 {
//!     std::thread::yield_now();
//! }
//! sched.stop();
//! handle.join().unwrap().unwrap();
//! assert_eq!(counter.load(Ordering::Relaxed), 1000);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
mod sched;
mod spawn;
mod task;
mod util;
mod yield_now;

pub use config::Config;
pub use error::Error;
pub use sched::scheduler::{Scheduler, TaskHandle};
pub use spawn::{global, spawn, spawn_with, SpawnOptions};
pub use yield_now::{current, park, yield_now};
