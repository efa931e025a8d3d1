//! Per-run outstanding-work accounting.
//!
//! The quiescence model could track two separate counters (`in_flight`,
//! `pending`) plus a set of not-yet-fired join listeners; this collapses the
//! first two into one. A message is "outstanding" from the moment it is
//! handed to a matching `Each`-mode listener's queue until that listener has
//! finished running its transform and applying its sinks. That span covers
//! both "queued but not yet picked up" and "currently executing", which is
//! all quiescence needs: a simpler sufficient condition than tracking them
//! apart.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Maximum number of transform steps a single run may perform before it is
/// assumed to be caught in a process cycle and fails with `CycleOverflow`;
/// chosen generously above any of the chain lengths exercised by this
/// crate's own test suite (the 100-process chain).
pub const MAX_RUN_STEPS: u64 = 10_000;

/// Shared bookkeeping for one `invoke`/`batch`-element/`stream` run.
#[derive(Debug, Default)]
pub struct RunCounter {
    outstanding: AtomicI64,
    steps: AtomicU64,
    notify: Notify,
}

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one more delivery as outstanding. Called the instant a message
    /// is pushed onto a matching `Each`-mode listener's queue, or a join is
    /// flushed.
    pub fn mark_pending(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Marks one delivery as fully handled (transform ran, sinks applied).
    pub fn mark_done(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Records one more transform invocation for this run, returning the new
    /// total. Callers compare this against [`MAX_RUN_STEPS`] to detect a
    /// runaway cycle.
    pub fn record_step(&self) -> u64 {
        self.steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Await this to be woken the next time `mark_pending`/`mark_done` is
    /// called. Must be created *before* re-checking `outstanding()` to avoid
    /// missing a wakeup (the standard `Notify` check-then-wait pattern).
    pub fn notified(&self) -> tokio::sync::Notified<'_> {
        self.notify.notified()
    }
}

/// RAII guard handed out alongside every delivery pushed to a listener's
/// queue. Dropping it calls [`RunCounter::mark_done`], so no matter how the
/// delivery is handled (successfully, with an error, or simply dropped
/// because a run was torn down mid-flight) the run's outstanding count is
/// always reconciled exactly once.
pub struct DeliveryGuard {
    counter: std::sync::Arc<RunCounter>,
}

impl DeliveryGuard {
    pub fn new(counter: std::sync::Arc<RunCounter>) -> Self {
        counter.mark_pending();
        Self { counter }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.counter.mark_done();
    }
}

impl std::fmt::Debug for DeliveryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryGuard").finish()
    }
}
