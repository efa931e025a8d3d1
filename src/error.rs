//! Crate-wide error type.
//!
//! One small enum, one variant per failure category, everything else
//! coerced into it at the boundary where it's discovered.

/// Boxed error type accepted from user-supplied transforms.
pub type TransformError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The runtime's error type. Returned from every fallible engine operation.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// A process transform returned an error. The run is aborted and all of
    /// its listeners are torn down before this propagates to the caller.
    #[error("transform failed: {0}")]
    TransformFailure(String),

    /// A run performed more transform steps than `MAX_RUN_STEPS` without
    /// reaching quiescence, almost always because a process cycle publishes
    /// back onto a topic it (transitively) subscribes to.
    #[error("exceeded {0} steps without reaching quiescence (possible process cycle)")]
    CycleOverflow(usize),

    /// Internal invariant violation: listeners remained on the connection
    /// after a run finished tearing down. This should be impossible; it is
    /// asserted by tests and by `ListenerGuard` in debug builds, not a
    /// condition callers are expected to handle.
    #[error("{0} listener(s) leaked past run teardown")]
    ListenerLeak(usize),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
