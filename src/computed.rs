//! Computed values and their consistency state machine.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{ComputeError, StateError};
use crate::timer::TimerWheel;
use crate::{FunctionId, Invalidation, InvalidationReason, Tag};

/// The stored result of a producer: a shared value or the cached producer error.
pub type Output<O> = Result<Arc<O>, Arc<anyhow::Error>>;

type InvalidatedHandler<I, O> = Box<dyn FnOnce(&Computed<I, O>, &Invalidation) + Send>;

/// Lifecycle stage of a computed value.
///
/// Transitions are one-directional: `Computing -> Consistent -> Invalidated`, or
/// `Computing -> Invalidated` when a computation is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsistencyState {
    /// The producer is running; the output is not readable yet.
    Computing = 0,
    /// The output is set and still valid.
    Consistent = 1,
    /// The value is stale. Terminal.
    Invalidated = 2,
}

impl ConsistencyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsistencyState::Computing,
            1 => ConsistencyState::Consistent,
            _ => ConsistencyState::Invalidated,
        }
    }
}

/// Type-erased view of a [`Computed`] value.
///
/// Dependency edges, the ambient frame and the lifecycle timers hold computed values of
/// arbitrary input/output types through this trait.
pub trait AnyComputed: Send + Sync + 'static {
    /// Identity of the function that produced this value.
    fn function(&self) -> FunctionId;

    /// Generation tag of this value.
    fn tag(&self) -> Tag;

    /// Current consistency state.
    fn state(&self) -> ConsistencyState;

    /// The input, for diagnostics.
    fn input_debug(&self) -> &dyn Debug;

    /// Invalidate this value, returning false if it was already invalidated.
    fn invalidate_with(&self, invalidation: Invalidation) -> bool;

    /// Record `dependency` as used by this (computing) value.
    fn add_used(&self, dependency: Arc<dyn AnyComputed>) -> Result<(), StateError>;

    /// Record `consumer` as a dependent of this (consistent) value.
    ///
    /// Returns false if this value can no longer accept dependents.
    fn add_used_by(&self, consumer: Weak<dyn AnyComputed>, consumer_tag: Tag) -> bool;

    /// Drop the dependent edge recorded for `consumer_tag`.
    fn remove_used_by(&self, consumer_tag: Tag);

    /// Drop the payload of a consistent value while keeping its metadata.
    fn release_output(&self) -> bool;

    /// Drop dependent edges whose target is gone, stale or invalidated.
    fn prune_used_by(&self) -> usize;

    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Convert into `Arc<dyn Any>` for downcasting to `Arc<Computed<I, O>>`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl dyn AnyComputed {
    /// Invalidate this value manually.
    pub fn invalidate(&self) -> bool {
        self.invalidate_with(Invalidation::manual())
    }

    /// Returns true if this value is consistent.
    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// Returns true if this value is invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }
}

impl Debug for dyn AnyComputed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({:?}){} [{:?}]",
            self.function().name(),
            self.input_debug(),
            self.tag(),
            self.state()
        )
    }
}

struct Edges<I, O> {
    used: HashMap<Tag, Arc<dyn AnyComputed>, ahash::RandomState>,
    used_by: HashMap<Tag, Weak<dyn AnyComputed>, ahash::RandomState>,
    handlers: Vec<InvalidatedHandler<I, O>>,
    invalidation: Option<Invalidation>,
}

impl<I, O> Default for Edges<I, O> {
    fn default() -> Self {
        Self {
            used: HashMap::default(),
            used_by: HashMap::default(),
            handlers: Vec::new(),
            invalidation: None,
        }
    }
}

/// A memoized `(function, input)` evaluation result.
///
/// The state ordinal is read and transitioned lock-free; the dependency edges and the
/// handler list are guarded by one per-instance mutex that is never held while calling
/// into another computed value's invalidation.
pub struct Computed<I, O> {
    me: Weak<Computed<I, O>>,
    function: FunctionId,
    input: I,
    tag: Tag,
    state: AtomicU8,
    output: RwLock<Option<Output<O>>>,
    edges: Mutex<Edges<I, O>>,
    timers: Weak<TimerWheel>,
}

impl<I, O> Computed<I, O>
where
    I: Debug + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Create a new value in the `Computing` state.
    pub fn new(function: FunctionId, input: I, tag: Tag) -> Arc<Self> {
        Self::with_timers(function, input, tag, Weak::new())
    }

    pub(crate) fn with_timers(
        function: FunctionId,
        input: I,
        tag: Tag,
        timers: Weak<TimerWheel>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            function,
            input,
            tag,
            state: AtomicU8::new(ConsistencyState::Computing as u8),
            output: RwLock::new(None),
            edges: Mutex::new(Edges::default()),
            timers,
        })
    }

    /// Identity of the function that produced this value.
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// The input this value was computed for.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Generation tag of this value.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Current consistency state.
    pub fn state(&self) -> ConsistencyState {
        ConsistencyState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns true if this value is consistent.
    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// Returns true if this value is invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }

    /// The stored output.
    ///
    /// `None` while computing, after the output was released, or when the computation
    /// was invalidated before its output could be set.
    pub fn output(&self) -> Option<Output<O>> {
        if self.state() == ConsistencyState::Computing {
            return None;
        }
        self.output.read().clone()
    }

    /// The output as a call result, if available.
    pub fn value(&self) -> Option<Result<Arc<O>, ComputeError>> {
        self.output()
            .map(|output| output.map_err(ComputeError::Producer))
    }

    /// Why this value was invalidated, once it is.
    pub fn invalidation(&self) -> Option<Invalidation> {
        self.edges.lock().invalidation
    }

    /// Transition `Computing -> Consistent` with `output`.
    ///
    /// Returns false and leaves the value untouched if it is not computing, including
    /// when it was invalidated while its producer was still running.
    pub fn try_set_output(&self, output: Output<O>) -> bool {
        // Writers hold the slot across the transition so a reader that observes
        // `Consistent` always finds the output.
        let mut slot = self.output.write();
        if self
            .state
            .compare_exchange(
                ConsistencyState::Computing as u8,
                ConsistencyState::Consistent as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        *slot = Some(output);
        true
    }

    /// Strict variant of [`try_set_output`](Self::try_set_output).
    pub fn set_output(&self, output: Output<O>) -> Result<(), StateError> {
        if self.try_set_output(output) {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                from: self.state(),
                to: ConsistencyState::Consistent,
            })
        }
    }

    /// Invalidate this value manually.
    pub fn invalidate(&self) -> bool {
        self.invalidate_with(Invalidation::manual())
    }

    /// Transition to `Invalidated` and cascade to dependents.
    ///
    /// Returns true exactly once. Handlers fire before the cascade reaches dependents.
    pub fn invalidate_with(&self, invalidation: Invalidation) -> bool {
        let (used, used_by, handlers) = {
            let mut edges = self.edges.lock();
            let mut current = self.state.load(Ordering::Acquire);
            loop {
                if current == ConsistencyState::Invalidated as u8 {
                    return false;
                }
                match self.state.compare_exchange_weak(
                    current,
                    ConsistencyState::Invalidated as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
            edges.invalidation = Some(invalidation);
            (
                std::mem::take(&mut edges.used),
                std::mem::take(&mut edges.used_by),
                std::mem::take(&mut edges.handlers),
            )
        };

        tracing::trace!(
            function = self.function.name(),
            input = ?self.input,
            tag = %self.tag,
            reason = ?invalidation.reason,
            "computed.invalidated"
        );

        if let Some(timers) = self.timers.upgrade() {
            timers.cancel(self.tag);
        }

        for dependency in used.into_values() {
            dependency.remove_used_by(self.tag);
        }

        for handler in handlers {
            handler(self, &invalidation);
        }

        let propagated = invalidation.propagated(self.tag);
        for (consumer_tag, consumer) in used_by {
            let Some(consumer) = consumer.upgrade() else {
                continue;
            };
            if consumer.tag() == consumer_tag {
                consumer.invalidate_with(propagated);
            }
        }
        true
    }

    /// Subscribe to invalidation. Fires immediately if the value is already invalidated.
    pub fn on_invalidated<F>(&self, handler: F)
    where
        F: FnOnce(&Computed<I, O>, &Invalidation) + Send + 'static,
    {
        let invalidation = {
            let mut edges = self.edges.lock();
            if !self.is_invalidated() {
                edges.handlers.push(Box::new(handler));
                return;
            }
            edges.invalidation.unwrap_or_default()
        };
        handler(self, &invalidation);
    }

    /// Record `dependency` as used while this value is computing.
    ///
    /// Does nothing once this value is invalidated. If the dependency is already
    /// invalidated, this value is invalidated too since it read stale data.
    pub fn add_used(&self, dependency: Arc<dyn AnyComputed>) -> Result<(), StateError> {
        let dependency_tag = dependency.tag();
        let accepted = {
            let mut edges = self.edges.lock();
            match self.state() {
                ConsistencyState::Invalidated => return Ok(()),
                ConsistencyState::Consistent => {
                    return Err(StateError::NotComputing {
                        state: ConsistencyState::Consistent,
                    })
                }
                ConsistencyState::Computing => {}
            }
            if edges.used.contains_key(&dependency_tag) {
                return Ok(());
            }
            let me: Weak<dyn AnyComputed> = self.me.clone();
            if dependency.add_used_by(me, self.tag) {
                edges.used.insert(dependency_tag, dependency);
                true
            } else {
                false
            }
        };
        if !accepted {
            self.invalidate_with(Invalidation::new_source(
                Some(dependency_tag),
                InvalidationReason::DependencyInvalidated,
            ));
        }
        Ok(())
    }

    /// Record `consumer` as a dependent. Only consistent values accept dependents.
    pub fn add_used_by(&self, consumer: Weak<dyn AnyComputed>, consumer_tag: Tag) -> bool {
        let mut edges = self.edges.lock();
        match self.state() {
            ConsistencyState::Consistent => {
                edges.used_by.insert(consumer_tag, consumer);
                true
            }
            state => {
                tracing::trace!(
                    function = self.function.name(),
                    tag = %self.tag,
                    ?state,
                    "computed.used_by_rejected"
                );
                false
            }
        }
    }

    /// Drop the dependent edge recorded for `consumer_tag`.
    pub fn remove_used_by(&self, consumer_tag: Tag) {
        self.edges.lock().used_by.remove(&consumer_tag);
    }

    /// Drop dependent edges whose target is gone, stale or invalidated.
    pub fn prune_used_by(&self) -> usize {
        let mut edges = self.edges.lock();
        let before = edges.used_by.len();
        edges.used_by.retain(|tag, consumer| {
            consumer
                .upgrade()
                .is_some_and(|c| c.tag() == *tag && !c.is_invalidated())
        });
        before - edges.used_by.len()
    }

    /// Drop the payload of a consistent value while keeping its metadata.
    pub fn release_output(&self) -> bool {
        if !self.is_consistent() {
            return false;
        }
        self.output.write().take().is_some()
    }

    /// Dependencies read while this value was computing.
    pub fn used(&self) -> Vec<Arc<dyn AnyComputed>> {
        self.edges.lock().used.values().cloned().collect()
    }

    /// Number of recorded dependents, including ones not yet pruned.
    pub fn used_by_count(&self) -> usize {
        self.edges.lock().used_by.len()
    }
}

impl<I, O> AnyComputed for Computed<I, O>
where
    I: Debug + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    fn function(&self) -> FunctionId {
        self.function
    }

    fn tag(&self) -> Tag {
        self.tag
    }

    fn state(&self) -> ConsistencyState {
        Computed::state(self)
    }

    fn input_debug(&self) -> &dyn Debug {
        &self.input
    }

    fn invalidate_with(&self, invalidation: Invalidation) -> bool {
        Computed::invalidate_with(self, invalidation)
    }

    fn add_used(&self, dependency: Arc<dyn AnyComputed>) -> Result<(), StateError> {
        Computed::add_used(self, dependency)
    }

    fn add_used_by(&self, consumer: Weak<dyn AnyComputed>, consumer_tag: Tag) -> bool {
        Computed::add_used_by(self, consumer, consumer_tag)
    }

    fn remove_used_by(&self, consumer_tag: Tag) {
        Computed::remove_used_by(self, consumer_tag)
    }

    fn release_output(&self) -> bool {
        Computed::release_output(self)
    }

    fn prune_used_by(&self) -> usize {
        Computed::prune_used_by(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<I: Debug, O> Debug for Computed<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("function", &self.function.name())
            .field("input", &self.input)
            .field("tag", &self.tag)
            .field(
                "state",
                &ConsistencyState::from_u8(self.state.load(Ordering::Acquire)),
            )
            .finish()
    }
}
