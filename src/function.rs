//! Memoized functions: read, lock, re-read, compute, store.

use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::CallOptions;
use crate::dependency::Frame;
use crate::error::ComputeError;
use crate::lock::AsyncLockSet;
use crate::pruner::{PruneStats, Sweep};
use crate::registry::Registry;
use crate::runtime::MemoRuntime;
use crate::timer::{ExpirationPolicy, TimerKind};
use crate::tracer::{ComputeOutcome, TracerKey};
use crate::{AnyComputed, Computed, Invalidation, InvalidationReason, Output, Tag};

/// Types usable as memoized function inputs.
///
/// Automatically implemented for every `Clone + Hash + Eq + Debug + Send + Sync + 'static` type.
pub trait Input: Clone + Hash + Eq + Debug + Send + Sync + 'static {}

impl<T: Clone + Hash + Eq + Debug + Send + Sync + 'static> Input for T {}

/// Identity of a memoized function within its runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId {
    id: u64,
    name: &'static str,
}

impl FunctionId {
    /// Create a function id.
    pub fn new(id: u64, name: &'static str) -> Self {
        Self { id, name }
    }

    /// Numeric id, unique within a runtime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Lifecycle options of a memoized function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionOptions {
    /// How long a value is held after its last use. `None` holds nothing.
    pub keep_alive: Option<Duration>,
    /// Delay after the last use before the output payload is dropped.
    pub output_release: Option<Duration>,
    /// What happens when the keep-alive period elapses.
    pub expiration: ExpirationPolicy,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        Self {
            keep_alive: Some(Duration::from_secs(60)),
            output_release: None,
            expiration: ExpirationPolicy::Release,
        }
    }
}

impl FunctionOptions {
    /// Set the keep-alive period.
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    /// Hold no reference after use; values live only while something else holds them.
    pub fn no_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    /// Drop the output payload this long after the last use.
    pub fn output_release(mut self, duration: Duration) -> Self {
        self.output_release = Some(duration);
        self
    }

    /// Set the expiration policy.
    pub fn expiration(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration = policy;
        self
    }
}

/// The body of a memoized function.
///
/// Must be callable any number of times with the same input and return equivalent
/// results until something it read is invalidated.
#[async_trait]
pub trait Producer<I, O>: Send + Sync + 'static {
    /// Compute the output for `input`.
    async fn produce(&self, input: I, cancel: CancellationToken) -> Result<O, ComputeError>;
}

#[async_trait]
impl<I, O, F, Fut> Producer<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ComputeError>> + Send + 'static,
{
    async fn produce(&self, input: I, cancel: CancellationToken) -> Result<O, ComputeError> {
        (self)(input, cancel).await
    }
}

struct FunctionInner<I, O> {
    id: FunctionId,
    options: FunctionOptions,
    producer: Box<dyn Producer<I, O>>,
    registry: Arc<Registry<I, O>>,
    locks: AsyncLockSet<I>,
    runtime: MemoRuntime,
}

/// A memoized async function.
///
/// Cloning is cheap; clones share the same cache.
pub struct MemoFunction<I, O> {
    inner: Arc<FunctionInner<I, O>>,
}

impl<I, O> Clone for MemoFunction<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O> Debug for MemoFunction<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoFunction")
            .field("id", &self.inner.id)
            .field("options", &self.inner.options)
            .finish()
    }
}

/// Where a call was served from.
enum Served<I, O> {
    Hit(Arc<Computed<I, O>>, Output<O>),
    Fresh(Arc<Computed<I, O>>, Output<O>),
}

impl<I, O> Served<I, O> {
    fn into_parts(self) -> (Arc<Computed<I, O>>, Output<O>) {
        match self {
            Served::Hit(computed, output) | Served::Fresh(computed, output) => {
                (computed, output)
            }
        }
    }
}

impl<I, O> MemoFunction<I, O>
where
    I: Input,
    O: Send + Sync + 'static,
{
    /// Create a memoized function on `runtime`.
    pub fn new<P>(runtime: &MemoRuntime, name: &'static str, options: FunctionOptions, producer: P) -> Self
    where
        P: Producer<I, O>,
    {
        let id = runtime.next_function_id(name);
        let registry = Arc::new(Registry::new(id, runtime.prune_config(), runtime.tracer().clone()));
        let sweeper: Arc<dyn Sweep> = registry.clone();
        runtime.register_sweeper(&sweeper);
        Self {
            inner: Arc::new(FunctionInner {
                id,
                options,
                producer: Box::new(producer),
                registry,
                locks: AsyncLockSet::default(),
                runtime: runtime.clone(),
            }),
        }
    }

    /// Identity of this function.
    pub fn id(&self) -> FunctionId {
        self.inner.id
    }

    /// Lifecycle options of this function.
    pub fn options(&self) -> FunctionOptions {
        self.inner.options
    }

    /// Call the function, cancelled together with the calling producer, if any.
    pub async fn invoke(&self, input: I) -> Result<Arc<O>, ComputeError> {
        let cancel = Frame::current().cancel.unwrap_or_default();
        self.invoke_with(input, cancel).await
    }

    /// Call the function with an explicit cancellation token.
    pub async fn invoke_with(
        &self,
        input: I,
        cancel: CancellationToken,
    ) -> Result<Arc<O>, ComputeError> {
        let (_, output) = self.serve(input, cancel).await?.into_parts();
        output.map_err(ComputeError::Producer)
    }

    /// Call the function and return the computed value instead of its output.
    ///
    /// A cached producer error is returned as a value, not as `Err`.
    pub async fn computed(&self, input: I) -> Result<Arc<Computed<I, O>>, ComputeError> {
        let cancel = Frame::current().cancel.unwrap_or_default();
        let (computed, _) = self.serve(input, cancel).await?.into_parts();
        Ok(computed)
    }

    /// The cached consistent value for `input`, without computing or recording a dependency.
    pub fn get_existing(&self, input: &I) -> Option<Arc<Computed<I, O>>> {
        self.inner
            .registry
            .get(input)
            .filter(|computed| computed.is_consistent())
    }

    /// Invalidate the cached or in-flight value for `input`. Returns false if there was none.
    pub fn invalidate(&self, input: &I) -> bool {
        match self.inner.registry.get(input) {
            Some(computed) => self.invalidate_value(&computed, Invalidation::manual()),
            None => false,
        }
    }

    /// A reconstructible reference to `computed`.
    pub fn reference(&self, computed: &Computed<I, O>) -> ComputedRef<I, O> {
        ComputedRef {
            function: self.clone(),
            input: computed.input().clone(),
            tag: computed.tag(),
        }
    }

    /// The live value for `input` if its tag is still `tag`.
    pub fn resolve(&self, input: &I, tag: Tag) -> Option<Arc<Computed<I, O>>> {
        self.inner
            .registry
            .get(input)
            .filter(|computed| computed.tag() == tag)
    }

    /// Number of registry entries, including dead handles not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Returns true if the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep this function's registry now.
    pub fn prune(&self) -> PruneStats {
        self.inner.registry.sweep()
    }

    fn key<'a>(&self, computed: &'a Computed<I, O>) -> TracerKey<'a> {
        TracerKey::new(self.inner.id, computed.input(), Some(computed.tag()))
    }

    fn invalidate_value(&self, computed: &Computed<I, O>, invalidation: Invalidation) -> bool {
        let invalidated = computed.invalidate_with(invalidation);
        if invalidated {
            self.inner
                .runtime
                .tracer()
                .on_invalidated(self.key(computed), invalidation);
        }
        invalidated
    }

    /// A consistent cached value with a readable output.
    ///
    /// A value whose output was released is retired so the caller recomputes it.
    fn ready(&self, computed: Arc<Computed<I, O>>) -> Option<(Arc<Computed<I, O>>, Output<O>)> {
        if !computed.is_consistent() {
            return None;
        }
        match computed.output() {
            Some(output) => Some((computed, output)),
            None => {
                self.invalidate_value(
                    &computed,
                    Invalidation::new_source(None, InvalidationReason::OutputReleased),
                );
                None
            }
        }
    }

    async fn serve(&self, input: I, cancel: CancellationToken) -> Result<Served<I, O>, ComputeError> {
        let inner = &self.inner;
        inner.runtime.ensure_background();
        let frame = Frame::current();
        let options = frame.context.options();

        let existing = inner.registry.get(&input);
        if options.contains(CallOptions::INVALIDATE) {
            if let Some(computed) = existing {
                let erased: Arc<dyn AnyComputed> = computed.clone();
                frame.context.try_capture(&erased);
                self.invalidate_value(&computed, frame.context.invalidation());
            }
            return Err(ComputeError::NotComputed);
        }

        if let Some((computed, output)) = existing.and_then(|c| self.ready(c)) {
            inner.runtime.tracer().on_cache_hit(self.key(&computed));
            self.use_value(&frame, &computed)?;
            return Ok(Served::Hit(computed, output));
        }
        if options.contains(CallOptions::TRY_GET_EXISTING) {
            return Err(ComputeError::NotComputed);
        }
        if frame.is_computing::<I, O>(inner.id, &input) {
            return Err(ComputeError::Reentrant {
                function: inner.id.name(),
                input: format!("{:?}", input),
            });
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ComputeError::Cancelled),
            guard = inner.locks.lock(&input) => guard,
        };

        if let Some((computed, output)) = inner.registry.get(&input).and_then(|c| self.ready(c)) {
            inner.runtime.tracer().on_cache_hit(self.key(&computed));
            self.use_value(&frame, &computed)?;
            return Ok(Served::Hit(computed, output));
        }

        let (computed, output) = self.compute(input, &frame, cancel).await?;
        self.use_value(&frame, &computed)?;
        Ok(Served::Fresh(computed, output))
    }

    /// Attribute a served value to the caller: capture it, record the edge and renew timers.
    fn use_value(&self, frame: &Frame, computed: &Arc<Computed<I, O>>) -> Result<(), ComputeError> {
        let runtime = &self.inner.runtime;
        let erased: Arc<dyn AnyComputed> = computed.clone();
        frame.context.try_capture(&erased);
        frame.record(&erased, runtime.tracer().as_ref())?;

        let options = &self.inner.options;
        if let Some(delay) = options.keep_alive {
            runtime
                .timers()
                .renew(erased.clone(), TimerKind::KeepAlive, options.expiration, delay);
        }
        if let Some(delay) = options.output_release {
            runtime
                .timers()
                .renew(erased, TimerKind::OutputRelease, options.expiration, delay);
        }
        Ok(())
    }

    async fn compute(
        &self,
        input: I,
        frame: &Frame,
        cancel: CancellationToken,
    ) -> Result<(Arc<Computed<I, O>>, Output<O>), ComputeError> {
        let inner = &self.inner;
        let runtime = &inner.runtime;
        let tracer = runtime.tracer();
        let computed = Computed::with_timers(
            inner.id,
            input.clone(),
            runtime.clock().next(),
            Arc::downgrade(runtime.timers()),
        );

        tracing::debug!(
            function = inner.id.name(),
            input = ?computed.input(),
            tag = %computed.tag(),
            "memo.compute"
        );
        tracer.on_compute_start(self.key(&computed));

        // Registered while computing so external invalidation reaches the in-flight value.
        // Readers skip it until it is consistent and queue on the per-input lock instead.
        inner.registry.store(computed.input().clone(), &computed);
        let registry = Arc::downgrade(&inner.registry);
        computed.on_invalidated(move |computed, _| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(computed.input(), computed);
            }
        });

        let producer_frame = frame.for_producer(computed.clone(), cancel.clone());
        let produced = producer_frame
            .scope(async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ComputeError::Cancelled),
                    result = inner.producer.produce(input, cancel.clone()) => result,
                }
            })
            .await;

        let output: Output<O> = match produced {
            Ok(value) => Ok(Arc::new(value)),
            Err(ComputeError::Producer(err)) => Err(err),
            Err(err) => {
                computed.invalidate_with(Invalidation::new_source(None, InvalidationReason::Abandoned));
                tracing::debug!(
                    function = inner.id.name(),
                    input = ?computed.input(),
                    error = %err,
                    "memo.compute_abandoned"
                );
                tracer.on_compute_end(self.key(&computed), ComputeOutcome::Abandoned);
                return Err(err);
            }
        };

        if !computed.try_set_output(output.clone()) {
            tracing::debug!(
                function = inner.id.name(),
                input = ?computed.input(),
                tag = %computed.tag(),
                "memo.invalidated_while_computing"
            );
            tracer.on_compute_end(self.key(&computed), ComputeOutcome::InvalidatedWhileComputing);
            return Ok((computed, output));
        }

        let outcome = match &output {
            Ok(_) => ComputeOutcome::Value,
            Err(err) => ComputeOutcome::Error {
                message: err.to_string(),
            },
        };
        tracer.on_compute_end(self.key(&computed), outcome);
        Ok((computed, output))
    }
}

/// A reconstructible `(function, input, tag)` reference to a computed value.
///
/// Resolves only while the registry still serves the same generation; a stale
/// reference resolves to `None` and invalidating it is a no-op.
pub struct ComputedRef<I, O> {
    function: MemoFunction<I, O>,
    input: I,
    tag: Tag,
}

impl<I: Clone, O> Clone for ComputedRef<I, O> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            input: self.input.clone(),
            tag: self.tag,
        }
    }
}

impl<I: Debug, O> Debug for ComputedRef<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}){}", self.function.inner.id.name(), self.input, self.tag)
    }
}

impl<I, O> ComputedRef<I, O>
where
    I: Input,
    O: Send + Sync + 'static,
{
    /// The referenced input.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The referenced generation.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The live value, if it is still the referenced generation.
    pub fn resolve(&self) -> Option<Arc<Computed<I, O>>> {
        self.function.resolve(&self.input, self.tag)
    }

    /// Invalidate the referenced generation. No-op if it is gone or was replaced.
    pub fn invalidate(&self) -> bool {
        match self.resolve() {
            Some(computed) => self
                .function
                .invalidate_value(&computed, Invalidation::manual()),
            None => false,
        }
    }
}
