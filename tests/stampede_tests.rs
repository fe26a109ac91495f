//! Stampede Protection Tests
//!
//! Concurrent misses on one key, loader failures fanned out to waiters,
//! handle-table reclamation, and cross-process coordination through the
//! distributed lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use cacheguard::config::StampedeConfig;
use cacheguard::{CacheEngine, EngineConfig, Error, InMemoryRemoteBackend};

const TTL: Duration = Duration::from_secs(60);

async fn slow_load(
    calls: Arc<AtomicUsize>,
    delay: Duration,
    value: &'static str,
) -> anyhow::Result<Option<Bytes>> {
    calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(delay).await;
    Ok(Some(Bytes::from_static(value.as_bytes())))
}

// =============================================================================
// In-Process Coalescing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_load_once() {
    let engine = CacheEngine::local().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let engine = engine.clone();
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            engine
                .get_or_load("Order:agg:sum:total:none", TTL, move || {
                    slow_load(calls, Duration::from_millis(50), "1999.98")
                })
                .await
        }));
    }
    for task in tasks {
        assert_eq!(
            task.await.unwrap().unwrap(),
            Some(Bytes::from_static(b"1999.98"))
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let metrics = engine.metrics();
    assert_eq!(metrics.loads, 1);
    assert_eq!(metrics.coalesced, 99);
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_loader_error_reaches_every_waiter() {
    let engine = CacheEngine::local().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let engine = engine.clone();
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            engine
                .get_or_load("Product:id:p-1", TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(anyhow::anyhow!("connection reset"))
                })
                .await
        }));
    }
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_matches!(&err, Error::Loader(_));
        assert!(err.to_string().contains("connection reset"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.metrics().load_failures, 1);

    // Nothing was cached, so the next caller loads again
    let value = engine
        .get_or_load("Product:id:p-1", TTL, {
            let calls = Arc::clone(&calls);
            move || slow_load(calls, Duration::ZERO, "ok")
        })
        .await
        .unwrap();
    assert_eq!(value, Some(Bytes::from_static(b"ok")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_handle_table_returns_to_zero() {
    let engine = CacheEngine::local().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for key in 0..500 {
        for _ in 0..4 {
            let engine = engine.clone();
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                engine
                    .get_or_load(&format!("Product:id:k-{}", key), TTL, move || {
                        slow_load(calls, Duration::from_millis(5), "v")
                    })
                    .await
            }));
        }
    }
    assert!(engine.in_flight() <= 500);
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 500);
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_callers_release_handle() {
    let engine = CacheEngine::local().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let engine = engine.clone();
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            engine
                .get_or_load("Product:id:slow", TTL, move || {
                    slow_load(calls, Duration::from_secs(3600), "v")
                })
                .await
        }));
    }
    tokio::task::yield_now().await;
    while engine.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        assert!(task.await.unwrap_err().is_cancelled());
    }
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_leader_abort_does_not_cancel_waiters() {
    let engine = CacheEngine::local().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let leader = {
        let engine = engine.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            engine
                .get_or_load("Product:id:shared", TTL, move || {
                    slow_load(calls, Duration::from_millis(100), "v")
                })
                .await
        })
    };
    while engine.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
    let follower = {
        let engine = engine.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            engine
                .get_or_load("Product:id:shared", TTL, move || {
                    slow_load(calls, Duration::from_millis(100), "other")
                })
                .await
        })
    };
    tokio::task::yield_now().await;

    leader.abort();
    let value = follower.await.unwrap().unwrap();
    assert_eq!(value, Some(Bytes::from_static(b"v")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Distributed Coordination
// =============================================================================

fn shared_engines(stampede: StampedeConfig) -> (CacheEngine, CacheEngine, Arc<InMemoryRemoteBackend>) {
    let backend = Arc::new(InMemoryRemoteBackend::new());
    let build = || {
        CacheEngine::builder()
            .config(EngineConfig {
                stampede: stampede.clone(),
                ..Default::default()
            })
            .remote(backend.clone())
            .build()
            .unwrap()
    };
    (build(), build(), backend)
}

#[tokio::test(start_paused = true)]
async fn test_second_process_waits_for_lock_holder() {
    let (first, second, _backend) = shared_engines(StampedeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let holder = {
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            first
                .get_or_load("Order:agg:count:none", TTL, move || {
                    slow_load(calls, Duration::from_millis(200), "42")
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let value = second
        .get_or_load("Order:agg:count:none", TTL, {
            let calls = Arc::clone(&calls);
            move || slow_load(calls, Duration::ZERO, "stale")
        })
        .await
        .unwrap();

    assert_eq!(value, Some(Bytes::from_static(b"42")));
    assert_eq!(holder.await.unwrap().unwrap(), Some(Bytes::from_static(b"42")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.metrics().lock_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_wait_bound_falls_back_to_direct_load() {
    let stampede = StampedeConfig {
        poll_wait: Duration::from_secs(1),
        ..Default::default()
    };
    let (first, second, _backend) = shared_engines(stampede);
    let calls = Arc::new(AtomicUsize::new(0));

    let holder = {
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            first
                .get_or_load("Order:agg:count:none", TTL, move || {
                    slow_load(calls, Duration::from_secs(5), "slow")
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    let value = second
        .get_or_load("Order:agg:count:none", TTL, {
            let calls = Arc::clone(&calls);
            move || slow_load(calls, Duration::ZERO, "direct")
        })
        .await
        .unwrap();

    assert_eq!(value, Some(Bytes::from_static(b"direct")));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(second.metrics().lock_timeouts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    holder.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lock_released_after_load() {
    let (engine, _other, backend) = shared_engines(StampedeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    engine
        .get_or_load("Product:id:p-1", TTL, {
            let calls = Arc::clone(&calls);
            move || slow_load(calls, Duration::from_millis(5), "v")
        })
        .await
        .unwrap();

    assert_eq!(engine.metrics().lock_acquired, 1);
    // Only the cached value remains; the lease key is gone
    assert_eq!(backend.stats().keys, 1);
}
