//! Tracer trait for observing memoized computation.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! cache hits, computations, invalidations, timers and sweeps. The default
//! [`NoopTracer`] ignores everything; [`LogTracer`] forwards events to `tracing`.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use memo_flow::{ComputeOutcome, MemoRuntime, Tracer, TracerKey};
//!
//! #[derive(Default)]
//! struct Counting {
//!     computed: AtomicUsize,
//! }
//!
//! impl Tracer for Counting {
//!     fn on_compute_end(&self, _key: TracerKey<'_>, _outcome: ComputeOutcome) {
//!         self.computed.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let runtime = MemoRuntime::builder().tracer(Counting::default()).build();
//! # let _ = runtime;
//! ```

use std::fmt::Debug;

use crate::{FunctionId, Invalidation, PruneStats, Tag, TimerKind};

/// Identifies a computed value in tracer events.
#[derive(Clone, Copy)]
pub struct TracerKey<'a> {
    /// The function that owns the value.
    pub function: FunctionId,
    /// The input, formatted lazily by the tracer if it needs it.
    pub input: &'a dyn Debug,
    /// Generation tag, when a value exists.
    pub tag: Option<Tag>,
}

impl<'a> TracerKey<'a> {
    /// Create a new tracer key.
    #[inline]
    pub fn new(function: FunctionId, input: &'a dyn Debug, tag: Option<Tag>) -> Self {
        Self {
            function,
            input,
            tag,
        }
    }
}

impl Debug for TracerKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.function.name(), self.input)?;
        if let Some(tag) = self.tag {
            write!(f, "{}", tag)?;
        }
        Ok(())
    }
}

/// How a computation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeOutcome {
    /// The producer returned a value, now cached.
    Value,
    /// The producer failed; the error is cached.
    Error {
        /// Display representation of the error.
        message: String,
    },
    /// The computation was cancelled or failed with a system error and was discarded.
    Abandoned,
    /// The value was invalidated while it was computing, so it was not cached.
    InvalidatedWhileComputing,
}

/// Tracer trait for observing memoized computation.
///
/// All methods have default empty implementations, so you only need to override
/// the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer may be called from
/// multiple threads concurrently.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a call is served from the registry.
    #[inline]
    fn on_cache_hit(&self, _key: TracerKey<'_>) {}

    /// Called when a producer is about to run.
    #[inline]
    fn on_compute_start(&self, _key: TracerKey<'_>) {}

    /// Called when a producer run ends.
    #[inline]
    fn on_compute_end(&self, _key: TracerKey<'_>, _outcome: ComputeOutcome) {}

    /// Called when a dependency edge is recorded.
    #[inline]
    fn on_dependency_recorded(&self, _consumer: TracerKey<'_>, _dependency: TracerKey<'_>) {}

    /// Called when a value is invalidated through its function.
    #[inline]
    fn on_invalidated(&self, _key: TracerKey<'_>, _invalidation: Invalidation) {}

    /// Called when a lifecycle timer fires.
    #[inline]
    fn on_timer_fired(&self, _tag: Tag, _kind: TimerKind) {}

    /// Called after a registry sweep.
    #[inline]
    fn on_prune(&self, _function: FunctionId, _stats: PruneStats) {}
}

/// Shared tracers, so a caller can keep a handle to the tracer it installs.
impl<T: Tracer + ?Sized> Tracer for std::sync::Arc<T> {
    fn on_cache_hit(&self, key: TracerKey<'_>) {
        (**self).on_cache_hit(key)
    }

    fn on_compute_start(&self, key: TracerKey<'_>) {
        (**self).on_compute_start(key)
    }

    fn on_compute_end(&self, key: TracerKey<'_>, outcome: ComputeOutcome) {
        (**self).on_compute_end(key, outcome)
    }

    fn on_dependency_recorded(&self, consumer: TracerKey<'_>, dependency: TracerKey<'_>) {
        (**self).on_dependency_recorded(consumer, dependency)
    }

    fn on_invalidated(&self, key: TracerKey<'_>, invalidation: Invalidation) {
        (**self).on_invalidated(key, invalidation)
    }

    fn on_timer_fired(&self, tag: Tag, kind: TimerKind) {
        (**self).on_timer_fired(tag, kind)
    }

    fn on_prune(&self, function: FunctionId, stats: PruneStats) {
        (**self).on_prune(function, stats)
    }
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`MemoRuntime`](crate::MemoRuntime).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards every event to the `tracing` crate at debug level.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_cache_hit(&self, key: TracerKey<'_>) {
        tracing::debug!(key = ?key, "memo.cache_hit");
    }

    fn on_compute_start(&self, key: TracerKey<'_>) {
        tracing::debug!(key = ?key, "memo.compute_start");
    }

    fn on_compute_end(&self, key: TracerKey<'_>, outcome: ComputeOutcome) {
        tracing::debug!(key = ?key, ?outcome, "memo.compute_end");
    }

    fn on_dependency_recorded(&self, consumer: TracerKey<'_>, dependency: TracerKey<'_>) {
        tracing::debug!(consumer = ?consumer, dependency = ?dependency, "memo.dependency");
    }

    fn on_invalidated(&self, key: TracerKey<'_>, invalidation: Invalidation) {
        tracing::debug!(key = ?key, reason = ?invalidation.reason, "memo.invalidated");
    }

    fn on_timer_fired(&self, tag: Tag, kind: TimerKind) {
        tracing::debug!(tag = %tag, ?kind, "memo.timer_fired");
    }

    fn on_prune(&self, function: FunctionId, stats: PruneStats) {
        tracing::debug!(
            function = function.name(),
            entries = stats.entries_removed,
            edges = stats.edges_removed,
            "memo.prune"
        );
    }
}
