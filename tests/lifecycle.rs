//! Tests for cached errors, output release, pruning and tracer events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memo_flow::{
    CancellationToken, ComputeError, FunctionId, FunctionOptions, InvalidationReason,
    MemoFunction, MemoRuntime, PruneStats, Tracer, TracerKey,
};

// =============================================================================
// Cached producer errors
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct NotFound(u32);

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "record {} not found", self.0)
    }
}

impl std::error::Error for NotFound {}

fn lookup(runtime: &MemoRuntime, calls: &Arc<AtomicUsize>) -> MemoFunction<u32, String> {
    let calls = calls.clone();
    runtime.function("lookup", move |id: u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if id == 0 {
                Err::<(), _>(NotFound(id))?;
            }
            Ok::<_, ComputeError>(format!("record-{}", id))
        }
    })
}

#[tokio::test]
async fn test_producer_error_is_cached_until_invalidated() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let lookup = lookup(&runtime, &calls);

    let first = lookup.invoke(0).await.unwrap_err();
    let second = lookup.invoke(0).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.downcast_ref::<NotFound>(), Some(&NotFound(0)));
    assert!(Arc::ptr_eq(
        first.producer_error().unwrap(),
        second.producer_error().unwrap()
    ));

    let computed = lookup.computed(0).await.unwrap();
    assert!(computed.is_consistent());
    assert!(computed.output().unwrap().is_err());

    lookup.invalidate(&0);
    lookup.invoke(0).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_error_propagates_to_consumers() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let lookup = lookup(&runtime, &calls);
    let title = {
        let lookup = lookup.clone();
        runtime.function("title", move |id: u32, _cancel: CancellationToken| {
            let lookup = lookup.clone();
            async move { Ok::<_, ComputeError>(lookup.invoke(id).await?.to_uppercase()) }
        })
    };

    assert_eq!(*title.invoke(1).await.unwrap(), "RECORD-1");
    let err = title.invoke(0).await.unwrap_err();
    assert!(err.is_cacheable());
    assert!(err.to_string().contains("record 0 not found"));
    assert!(title.get_existing(&0).is_some());
}

// =============================================================================
// Output release
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_released_output_keeps_metadata_and_recomputes() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let big = {
        let calls = calls.clone();
        runtime.function_with(
            "big",
            FunctionOptions::default().output_release(Duration::from_millis(500)),
            move |n: usize, _cancel: CancellationToken| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, ComputeError>(vec![0u8; n]) }
            },
        )
    };

    assert_eq!(big.invoke(1024).await.unwrap().len(), 1024);
    let computed = big.get_existing(&1024).unwrap();
    assert!(computed.output().is_some());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(computed.is_consistent());
    assert!(computed.output().is_none());
    assert_eq!(*computed.input(), 1024);

    assert_eq!(big.invoke(1024).await.unwrap().len(), 1024);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        computed.invalidation().map(|i| i.reason),
        Some(InvalidationReason::OutputReleased)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_keep_alive_holds_values() {
    let runtime = MemoRuntime::new();
    let forever = runtime.function_with(
        "forever",
        FunctionOptions::default()
            .keep_alive(Duration::MAX)
            .output_release(Duration::MAX),
        |x: u32, _cancel: CancellationToken| async move { Ok::<_, ComputeError>(x) },
    );

    assert_eq!(*forever.invoke(1).await.unwrap(), 1);
    assert_eq!(*forever.invoke(1).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let computed = forever.get_existing(&1).unwrap();
    assert!(computed.output().is_some());
    assert_eq!(runtime.timers().len(), 2);

    drop(computed);
    assert!(forever.invalidate(&1));
    assert!(runtime.timers().is_empty());
}

// =============================================================================
// Reuse across tokio runtimes
// =============================================================================

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

#[test]
fn test_timers_restart_on_a_new_tokio_runtime() {
    let runtime = MemoRuntime::new();
    let held = runtime.function_with(
        "held",
        FunctionOptions::default().keep_alive(Duration::from_millis(300)),
        |x: u32, _cancel: CancellationToken| async move { Ok::<_, ComputeError>(x) },
    );

    paused_runtime().block_on(async {
        held.invoke(1).await.unwrap();
    });
    paused_runtime().block_on(async {
        held.invoke(2).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    assert!(runtime.timers().is_empty());
    assert!(held.get_existing(&1).is_none());
    assert!(held.get_existing(&2).is_none());
}

#[test]
fn test_periodic_prune_restarts_on_a_new_tokio_runtime() {
    let runtime = MemoRuntime::builder()
        .prune_interval(Duration::from_secs(1))
        .build();
    let transient = transient(&runtime);

    paused_runtime().block_on(async {
        transient.invoke(1).await.unwrap();
    });
    paused_runtime().block_on(async {
        for i in 2..10 {
            transient.invoke(i).await.unwrap();
        }
        assert_eq!(transient.len(), 9);
        tokio::time::sleep(Duration::from_secs(3)).await;
    });

    assert!(transient.is_empty());
}

// =============================================================================
// Pruning
// =============================================================================

fn transient(runtime: &MemoRuntime) -> MemoFunction<u32, u32> {
    runtime.function_with(
        "transient",
        FunctionOptions::default().no_keep_alive(),
        |x: u32, _cancel: CancellationToken| async move { Ok::<_, ComputeError>(x) },
    )
}

#[tokio::test]
async fn test_prune_removes_dead_entries() {
    let runtime = MemoRuntime::new();
    let transient = transient(&runtime);

    for i in 0..100 {
        transient.invoke(i).await.unwrap();
    }
    assert_eq!(transient.len(), 100);

    let stats = runtime.prune();
    assert_eq!(stats.entries_scanned, 100);
    assert_eq!(stats.entries_removed, 100);
    assert!(transient.is_empty());
}

#[tokio::test]
async fn test_held_values_survive_pruning() {
    let runtime = MemoRuntime::new();
    let transient = transient(&runtime);

    let held = transient.computed(1).await.unwrap();
    transient.invoke(2).await.unwrap();

    let stats = transient.prune();
    assert_eq!(stats.entries_removed, 1);
    assert!(Arc::ptr_eq(&transient.get_existing(&1).unwrap(), &held));
}

#[tokio::test]
async fn test_prune_drops_edges_of_dead_consumers() {
    let runtime = MemoRuntime::new();
    let shared = runtime.function("shared", |x: u32, _cancel: CancellationToken| async move {
        Ok::<_, ComputeError>(x)
    });
    let reader = {
        let shared = shared.clone();
        runtime.function_with(
            "reader",
            FunctionOptions::default().no_keep_alive(),
            move |x: u32, _cancel: CancellationToken| {
                let shared = shared.clone();
                async move { Ok::<_, ComputeError>(*shared.invoke(x).await?) }
            },
        )
    };

    reader.invoke(1).await.unwrap();
    let dependency = shared.get_existing(&1).unwrap();
    assert_eq!(dependency.used_by_count(), 1);

    let stats = runtime.prune();
    assert_eq!(stats.edges_removed, 1);
    assert_eq!(stats.entries_removed, 1);
    assert_eq!(dependency.used_by_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_prune() {
    let runtime = MemoRuntime::builder()
        .prune_interval(Duration::from_secs(1))
        .build();
    let transient = transient(&runtime);

    for i in 0..10 {
        transient.invoke(i).await.unwrap();
    }
    assert_eq!(transient.len(), 10);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(transient.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registry_traffic_triggers_sweeps() {
    let runtime = MemoRuntime::builder().registry_capacity(32).build();
    let transient = transient(&runtime);

    for round in 0..20 {
        for i in 0..100 {
            transient.invoke(round * 100 + i).await.unwrap();
        }
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transient.len() < 2000);
}

// =============================================================================
// Tracer
// =============================================================================

#[derive(Default)]
struct Counting {
    hits: AtomicUsize,
    computes: AtomicUsize,
    edges: AtomicUsize,
    invalidations: AtomicUsize,
    prunes: AtomicUsize,
}

impl Tracer for Counting {
    fn on_cache_hit(&self, _key: TracerKey<'_>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_compute_start(&self, _key: TracerKey<'_>) {
        self.computes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dependency_recorded(&self, consumer: TracerKey<'_>, dependency: TracerKey<'_>) {
        assert_eq!(consumer.function.name(), "outer");
        assert_eq!(dependency.function.name(), "inner");
        self.edges.fetch_add(1, Ordering::SeqCst);
    }

    fn on_invalidated(&self, _key: TracerKey<'_>, _invalidation: memo_flow::Invalidation) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn on_prune(&self, _function: FunctionId, _stats: PruneStats) {
        self.prunes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_tracer_observes_engine_events() {
    let tracer = Arc::new(Counting::default());
    let runtime = MemoRuntime::builder().tracer(tracer.clone()).build();
    let inner = runtime.function("inner", |x: u32, _cancel: CancellationToken| async move {
        Ok::<_, ComputeError>(x)
    });
    let outer = {
        let inner = inner.clone();
        runtime.function("outer", move |x: u32, _cancel: CancellationToken| {
            let inner = inner.clone();
            async move { Ok::<_, ComputeError>(*inner.invoke(x).await? + *inner.invoke(x).await?) }
        })
    };

    outer.invoke(1).await.unwrap();
    outer.invoke(1).await.unwrap();
    assert_eq!(tracer.computes.load(Ordering::SeqCst), 2);
    // The second inner read and the second outer call.
    assert_eq!(tracer.hits.load(Ordering::SeqCst), 2);
    assert_eq!(tracer.edges.load(Ordering::SeqCst), 2);

    inner.invalidate(&1);
    assert_eq!(tracer.invalidations.load(Ordering::SeqCst), 1);

    runtime.prune();
    assert_eq!(tracer.prunes.load(Ordering::SeqCst), 2);
}
