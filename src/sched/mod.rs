//! Scheduler internals: intrusive queues, processors, dispatch.

pub(crate) mod dispatch;
pub(crate) mod intrusive;
pub(crate) mod processor;
pub(crate) mod queue;
pub(crate) mod scheduler;
