//! Stackful execution context.
//!
//! Wraps the `generator` crate's stackful coroutine: `resume` transfers
//! control into the task and returns when the task yields or finishes;
//! yielding from inside the task goes through `generator::yield_with`.
//! The trampoline invokes the stored closure exactly once; a panic raised
//! by the closure is caught and discarded so a failing task can never take
//! its processor down, and the task still reaches its terminal state.

use generator::{Generator, Gn};
use std::panic::{self, AssertUnwindSafe};
use tracing::debug;

/// A task's execution context: stack plus suspended machine state.
pub(crate) struct Coroutine {
    gen: Generator<'static, (), ()>,
}

impl Coroutine {
    /// Builds the context with its own stack of `stack_size` bytes.
    ///
    /// The closure does not run until the first [`resume`](Self::resume).
    pub(crate) fn new<F>(stack_size: usize, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let gen = Gn::<()>::new_scoped_opt(stack_size, move |_scope| {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                if payload.downcast_ref::<generator::Error>().is_some() {
                    // Forced unwind from dropping an unfinished coroutine;
                    // it must keep propagating.
                    panic::resume_unwind(payload);
                }
                debug!("task closure panicked; discarding the failure");
            }
        });
        Self { gen }
    }

    /// Transfers control into the task.
    ///
    /// Returns `true` once the closure has returned; the context must not
    /// be resumed again after that.
    pub(crate) fn resume(&mut self) -> bool {
        debug_assert!(!self.gen.is_done(), "resume of a finished coroutine");
        self.gen.resume();
        self.gen.is_done()
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("done", &self.gen.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const STACK: usize = 64 * 1024;

    #[test]
    fn runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let mut co = Coroutine::new(STACK, move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert!(co.resume());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn yield_suspends_and_resumes() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&steps);
        let mut co = Coroutine::new(STACK, move || {
            s.fetch_add(1, Ordering::Relaxed);
            generator::yield_with(());
            s.fetch_add(1, Ordering::Relaxed);
        });

        assert!(!co.resume());
        assert_eq!(steps.load(Ordering::Relaxed), 1);
        assert!(co.resume());
        assert_eq!(steps.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn closure_panic_is_swallowed() {
        let mut co = Coroutine::new(STACK, || panic!("boom"));
        // The panic must not cross the resume boundary.
        assert!(co.resume());
    }

    #[test]
    fn dropping_unfinished_coroutine_unwinds_cleanly() {
        struct SetOnDrop(Arc<AtomicUsize>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let guard = SetOnDrop(Arc::clone(&drops));
        let mut co = Coroutine::new(STACK, move || {
            let _guard = guard;
            generator::yield_with(());
            generator::yield_with(());
        });
        assert!(!co.resume());
        drop(co);
        // Captured resources were released by the forced unwind.
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
