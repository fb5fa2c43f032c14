use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::function::{FunctionOptions, Input, MemoFunction};
use crate::pruner::{sweep_all, PruneConfig, PruneStats, Sweep};
use crate::timer::TimerWheel;
use crate::tracer::{NoopTracer, Tracer};
use crate::{ComputeError, FunctionId, TagClock};

struct RuntimeInner {
    clock: TagClock,
    timers: Arc<TimerWheel>,
    tracer: Arc<dyn Tracer>,
    next_function: AtomicU64,
    sweepers: Mutex<Vec<Weak<dyn Sweep>>>,
    prune: PruneConfig,
    default_options: FunctionOptions,
    pruner_started: AtomicBool,
}

/// The engine that memoized functions and their values belong to.
///
/// Owns the tag clock, the lifecycle timer wheel, the tracer and the set of registries
/// swept by [`prune`](Self::prune). This is cheap to clone, so you can pass it around
/// by just cloning it.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use memo_flow::{ComputeError, MemoRuntime};
///
/// let runtime = MemoRuntime::new();
/// let square = runtime.function("square", |x: u64, _cancel| async move {
///     Ok::<_, ComputeError>(x * x)
/// });
///
/// assert_eq!(*square.invoke(4).await.unwrap(), 16);
/// assert_eq!(*square.invoke(4).await.unwrap(), 16);
/// # }
/// ```
pub struct MemoRuntime {
    inner: Arc<RuntimeInner>,
}

impl Default for MemoRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoRuntime {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for MemoRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoRuntime")
            .field("quantum", &self.inner.timers.quantum())
            .field("prune", &self.inner.prune)
            .field("default_options", &self.inner.default_options)
            .finish()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<MemoRuntime>();
    assert_sync::<MemoRuntime>();
    assert_send::<MemoFunction<u32, String>>();
    assert_sync::<MemoFunction<u32, String>>();
}

impl MemoRuntime {
    /// Create a new runtime with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the runtime.
    pub fn builder() -> MemoRuntimeBuilder {
        MemoRuntimeBuilder::new()
    }

    /// Memoize `producer` with the runtime's default options.
    pub fn function<I, O, F, Fut>(&self, name: &'static str, producer: F) -> MemoFunction<I, O>
    where
        I: Input,
        O: Send + Sync + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ComputeError>> + Send + 'static,
    {
        self.function_with(name, self.inner.default_options, producer)
    }

    /// Memoize `producer` with explicit lifecycle options.
    pub fn function_with<I, O, F, Fut>(
        &self,
        name: &'static str,
        options: FunctionOptions,
        producer: F,
    ) -> MemoFunction<I, O>
    where
        I: Input,
        O: Send + Sync + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ComputeError>> + Send + 'static,
    {
        MemoFunction::new(self, name, options, producer)
    }

    /// Options used by [`function`](Self::function).
    pub fn default_options(&self) -> FunctionOptions {
        self.inner.default_options
    }

    /// The installed tracer.
    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.inner.tracer
    }

    /// The lifecycle timer wheel.
    pub fn timers(&self) -> &Arc<TimerWheel> {
        &self.inner.timers
    }

    /// The generation clock.
    pub fn clock(&self) -> &TagClock {
        &self.inner.clock
    }

    /// Sweep the registry of every live function.
    pub fn prune(&self) -> PruneStats {
        sweep_all(&self.inner.sweepers)
    }

    pub(crate) fn prune_config(&self) -> PruneConfig {
        self.inner.prune
    }

    pub(crate) fn next_function_id(&self, name: &'static str) -> FunctionId {
        FunctionId::new(self.inner.next_function.fetch_add(1, Ordering::Relaxed), name)
    }

    pub(crate) fn register_sweeper(&self, sweeper: &Arc<dyn Sweep>) {
        self.inner.sweepers.lock().push(Arc::downgrade(sweeper));
        self.ensure_background();
    }

    /// Start the periodic pruner if one is configured and a tokio runtime is available.
    pub(crate) fn ensure_background(&self) {
        let Some(period) = self.inner.prune.interval else {
            return;
        };
        if self.inner.pruner_started.load(Ordering::Acquire)
            || self.inner.pruner_started.swap(true, Ordering::AcqRel)
        {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let running = PrunerRunning(Arc::downgrade(&self.inner));
                handle.spawn(prune_periodically(running, period));
            }
            Err(_) => self.inner.pruner_started.store(false, Ordering::Release),
        }
    }
}

/// Clears `pruner_started` when the pruner task ends or is dropped with its tokio runtime.
struct PrunerRunning(Weak<RuntimeInner>);

impl Drop for PrunerRunning {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.upgrade() {
            runtime.pruner_started.store(false, Ordering::Release);
        }
    }
}

async fn prune_periodically(running: PrunerRunning, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(runtime) = running.0.upgrade() else {
            break;
        };
        let stats = sweep_all(&runtime.sweepers);
        tracing::trace!(
            removed = stats.entries_removed,
            edges = stats.edges_removed,
            "runtime.periodic_prune"
        );
    }
}

/// Builder for [`MemoRuntime`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use memo_flow::{FunctionOptions, LogTracer, MemoRuntime};
///
/// let runtime = MemoRuntime::builder()
///     .timer_quantum(Duration::from_millis(100))
///     .registry_capacity(4096)
///     .prune_factor(2.0)
///     .default_options(FunctionOptions::default().keep_alive(Duration::from_secs(5)))
///     .tracer(LogTracer)
///     .build();
/// assert_eq!(runtime.timers().quantum(), Duration::from_millis(100));
/// ```
pub struct MemoRuntimeBuilder {
    timer_quantum: Duration,
    prune: PruneConfig,
    default_options: FunctionOptions,
    tracer: Arc<dyn Tracer>,
}

impl Default for MemoRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            timer_quantum: Duration::from_millis(250),
            prune: PruneConfig::default(),
            default_options: FunctionOptions::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Granularity of lifecycle timer deadlines.
    pub fn timer_quantum(mut self, quantum: Duration) -> Self {
        self.timer_quantum = quantum;
        self
    }

    /// Minimum number of registry operations between sweeps of one registry.
    pub fn registry_capacity(mut self, capacity: usize) -> Self {
        self.prune.capacity = capacity;
        self
    }

    /// Multiplier applied to the registry size to get the sweep threshold.
    pub fn prune_factor(mut self, factor: f64) -> Self {
        self.prune.factor = factor;
        self
    }

    /// Sweep every registry on this period in the background.
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.prune.interval = Some(interval);
        self
    }

    /// Options used by [`MemoRuntime::function`].
    pub fn default_options(mut self, options: FunctionOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Install a tracer.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the runtime with the configured settings.
    pub fn build(self) -> MemoRuntime {
        MemoRuntime {
            inner: Arc::new(RuntimeInner {
                clock: TagClock::new(),
                timers: Arc::new(TimerWheel::new(self.timer_quantum, self.tracer.clone())),
                tracer: self.tracer,
                next_function: AtomicU64::new(1),
                sweepers: Mutex::new(Vec::new()),
                prune: self.prune,
                default_options: self.default_options,
                pruner_started: AtomicBool::new(false),
            }),
        }
    }
}
