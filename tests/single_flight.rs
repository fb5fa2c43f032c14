//! Tests for single-flight execution, cancellation and reentrancy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use memo_flow::{CancellationToken, ComputeError, MemoFunction, MemoRuntime};

// =============================================================================
// Single-flight
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_callers_execute_body_once() {
    const CALLERS: usize = 32;

    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let slow = {
        let calls = calls.clone();
        runtime.function("slow", move |x: u32, _cancel: CancellationToken| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, ComputeError>(vec![x; 4])
            }
        })
    };

    let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));
    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let slow = slow.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                slow.invoke(3).await
            })
        })
        .collect();

    let outputs: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(outputs.iter().all(|output| Arc::ptr_eq(output, &outputs[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_inputs_compute_in_parallel() {
    let runtime = MemoRuntime::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let slow = {
        let running = running.clone();
        let peak = peak.clone();
        runtime.function("slow", move |x: u32, _cancel: CancellationToken| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ComputeError>(x)
            }
        })
    };

    let (a, b) = tokio::join!(slow.invoke(1), slow.invoke(2));
    assert_eq!((*a.unwrap(), *b.unwrap()), (1, 2));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Cancellation
// =============================================================================

fn sleepy(runtime: &MemoRuntime, calls: &Arc<AtomicUsize>) -> MemoFunction<u32, u32> {
    let calls = calls.clone();
    runtime.function("sleepy", move |x: u32, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, ComputeError>(x + 1)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_is_never_cached() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let sleepy = sleepy(&runtime, &calls);

    let token = CancellationToken::new();
    let (result, ()) = tokio::join!(sleepy.invoke_with(1, token.clone()), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });

    assert!(matches!(result, Err(ComputeError::Cancelled)));
    assert!(sleepy.get_existing(&1).is_none());

    assert_eq!(*sleepy.invoke(1).await.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_does_not_compute() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let sleepy = sleepy(&runtime, &calls);

    let token = CancellationToken::new();
    token.cancel();
    let result = sleepy.invoke_with(1, token).await;
    assert!(matches!(result, Err(ComputeError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_computes_after_owner_is_cancelled() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let sleepy = sleepy(&runtime, &calls);

    let owner = CancellationToken::new();
    let (cancelled, served, ()) = tokio::join!(
        sleepy.invoke_with(5, owner.clone()),
        async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            sleepy.invoke(5).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            owner.cancel();
        }
    );

    assert!(matches!(cancelled, Err(ComputeError::Cancelled)));
    assert_eq!(*served.unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_nested_calls_inherit_producer_cancellation() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let sleepy = sleepy(&runtime, &calls);
    let outer = {
        let sleepy = sleepy.clone();
        runtime.function("outer", move |x: u32, _cancel: CancellationToken| {
            let sleepy = sleepy.clone();
            async move { Ok::<_, ComputeError>(*sleepy.invoke(x).await? * 10) }
        })
    };

    let token = CancellationToken::new();
    let (result, ()) = tokio::join!(outer.invoke_with(1, token.clone()), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });

    assert!(matches!(result, Err(ComputeError::Cancelled)));
    assert!(sleepy.get_existing(&1).is_none());
    assert!(outer.get_existing(&1).is_none());
}

// =============================================================================
// Reentrancy and recursion
// =============================================================================

fn recursive<F, Fut>(runtime: &MemoRuntime, name: &'static str, body: F) -> MemoFunction<u64, u64>
where
    F: Fn(MemoFunction<u64, u64>, u64) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<u64, ComputeError>> + Send + 'static,
{
    let slot: Arc<OnceLock<MemoFunction<u64, u64>>> = Arc::default();
    let function = {
        let slot = slot.clone();
        runtime.function(name, move |x: u64, _cancel: CancellationToken| {
            let me = slot.get().cloned();
            let body = me.map(|me| body(me, x));
            async move {
                match body {
                    Some(body) => body.await,
                    None => Err(anyhow::anyhow!("function not installed").into()),
                }
            }
        })
    };
    let _ = slot.set(function.clone());
    function
}

#[tokio::test]
async fn test_self_call_with_same_input_fails_fast() {
    let runtime = MemoRuntime::new();
    let looping = recursive(&runtime, "looping", |me, x| async move {
        Ok::<_, ComputeError>(*me.invoke(x).await? + 1)
    });

    let err = looping.invoke(1).await.unwrap_err();
    match err {
        ComputeError::Reentrant { function, input } => {
            assert_eq!(function, "looping");
            assert_eq!(input, "1");
        }
        other => panic!("expected reentrant error, got {}", other),
    }
    assert!(looping.get_existing(&1).is_none());
}

#[tokio::test]
async fn test_mutual_reentrancy_is_detected() {
    let runtime = MemoRuntime::new();
    let slot: Arc<OnceLock<MemoFunction<u64, u64>>> = Arc::default();
    let ping = {
        let slot = slot.clone();
        runtime.function("ping", move |x: u64, _cancel: CancellationToken| {
            let pong = slot.get().cloned();
            async move {
                let pong = pong.ok_or_else(|| anyhow::anyhow!("pong not installed"))?;
                Ok::<_, ComputeError>(*pong.invoke(x).await?)
            }
        })
    };
    let pong = {
        let ping = ping.clone();
        runtime.function("pong", move |x: u64, _cancel: CancellationToken| {
            let ping = ping.clone();
            async move { Ok::<_, ComputeError>(*ping.invoke(x).await?) }
        })
    };
    let _ = slot.set(pong);

    let err = ping.invoke(3).await.unwrap_err();
    assert!(matches!(err, ComputeError::Reentrant { function: "ping", .. }));
}

#[tokio::test]
async fn test_recursion_on_smaller_inputs_is_memoized() {
    let runtime = MemoRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fib = {
        let calls = calls.clone();
        recursive(&runtime, "fib", move |me, n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    return Ok::<_, ComputeError>(n);
                }
                Ok(*me.invoke(n - 1).await? + *me.invoke(n - 2).await?)
            }
        })
    };

    assert_eq!(*fib.invoke(30).await.unwrap(), 832_040);
    assert_eq!(calls.load(Ordering::SeqCst), 31);

    // fib(30) depends on every smaller value through the cascade.
    assert!(fib.invalidate(&0));
    assert!(fib.get_existing(&30).is_none());
    assert!(fib.get_existing(&1).is_some());
}
