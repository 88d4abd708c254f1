//! Runtime configuration.
//!
//! [`Config`] holds the concrete values that drive scheduler behavior.
//! Pass one to [`Scheduler::with_config`](crate::Scheduler::with_config);
//! [`Scheduler::new`](crate::Scheduler::new) uses the defaults below.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `stack_size` | 64 KiB |
//! | `gc_threshold` | 16 |
//! | `load_balance_rate` | 0.01 |
//! | `dispatch_interval` | 1 ms |

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Floor for coroutine stack sizes; anything smaller faults on resume.
pub(crate) const MIN_STACK: usize = 4 * 1024;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coroutine stack size in bytes.
    pub stack_size: usize,
    /// Number of finished tasks a processor accumulates before it reclaims
    /// them outside its run loop.
    pub gc_threshold: usize,
    /// Imbalance tolerance for load balancing: a processor whose load is
    /// within `average * rate` of the busiest is left alone.
    pub load_balance_rate: f32,
    /// Period of the dispatch thread's supervision tick.
    pub dispatch_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 64 * 1024,
            gc_threshold: 16,
            load_balance_rate: 0.01,
            dispatch_interval: Duration::from_millis(1),
        }
    }
}

impl Config {
    /// Clamps nonsensical values to usable ones.
    ///
    /// A zero stack would fault on first resume; a zero gc threshold
    /// degenerates to reclaiming on every pass, which is fine, but a
    /// negative or non-finite balance rate is replaced by the default.
    #[must_use]
    pub(crate) fn normalize(mut self) -> Self {
        if self.stack_size < MIN_STACK {
            self.stack_size = MIN_STACK;
        }
        if !self.load_balance_rate.is_finite() || self.load_balance_rate < 0.0 {
            self.load_balance_rate = 0.01;
        }
        if self.dispatch_interval.is_zero() {
            self.dispatch_interval = Duration::from_millis(1);
        }
        self
    }
}

/// The subset of [`Config`] that can be adjusted while the scheduler runs.
///
/// Shared by every processor and the dispatch thread; plain atomics since
/// a torn read of a tuning knob is harmless.
#[derive(Debug)]
pub(crate) struct Tunables {
    gc_threshold: AtomicUsize,
    load_balance_rate: AtomicU32,
}

impl Tunables {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            gc_threshold: AtomicUsize::new(config.gc_threshold),
            load_balance_rate: AtomicU32::new(config.load_balance_rate.to_bits()),
        }
    }

    pub(crate) fn gc_threshold(&self) -> usize {
        self.gc_threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn set_gc_threshold(&self, threshold: usize) {
        self.gc_threshold.store(threshold, Ordering::Relaxed);
    }

    pub(crate) fn load_balance_rate(&self) -> f32 {
        f32::from_bits(self.load_balance_rate.load(Ordering::Relaxed))
    }

    pub(crate) fn set_load_balance_rate(&self, rate: f32) {
        let rate = if rate.is_finite() && rate >= 0.0 {
            rate
        } else {
            0.01
        };
        self.load_balance_rate.store(rate.to_bits(), Ordering::Relaxed);
    }
}
