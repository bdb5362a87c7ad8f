mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tenant_runtime_quickjs::config::PoolConfig;
use tenant_runtime_quickjs::metrics::{self, InMemoryMetrics, NoopMetrics};
use tenant_runtime_quickjs::{PoolError, SandboxPool, ScriptError, ScriptRuntime, TimeoutCause};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn pool_config(max_size: usize) -> PoolConfig {
    common::init_tracing();
    PoolConfig {
        min_idle: 1,
        max_size: Some(max_size),
        ..PoolConfig::default()
    }
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(2)
}

#[tokio::test(flavor = "multi_thread")]
async fn released_sandbox_is_reused() {
    let pool = SandboxPool::new(pool_config(1), Arc::new(NoopMetrics)).unwrap();

    let first = pool.acquire(soon()).await.unwrap();
    let (id, created_at) = (first.id(), first.created_at());
    assert_eq!(first.use_count(), 1);
    assert_eq!(pool.stats().in_use, 1);
    drop(first);
    assert_eq!(pool.stats().in_use, 0);
    assert_eq!(pool.stats().idle, 1);

    let second = pool.acquire(soon()).await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.created_at(), created_at);
    assert_eq!(second.use_count(), 2);
    assert_eq!(pool.stats().created, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sandbox_is_retired_after_max_uses() {
    let sink = Arc::new(InMemoryMetrics::new());
    let config = PoolConfig {
        max_uses: 2,
        ..pool_config(1)
    };
    let pool = SandboxPool::new(config, sink.clone()).unwrap();

    let first_id = pool.acquire(soon()).await.unwrap().id();
    let again = pool.acquire(soon()).await.unwrap();
    assert_eq!(again.id(), first_id);
    assert_eq!(again.use_count(), 2);
    drop(again);

    let fresh = pool.acquire(soon()).await.unwrap();
    assert_ne!(fresh.id(), first_id);
    assert_eq!(fresh.use_count(), 1);
    assert_eq!(pool.stats().retired, 1);
    assert_eq!(sink.counter(metrics::POOL_RETIRED), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_idle_sandboxes_are_revalidated_away() {
    let config = PoolConfig {
        max_age_ms: 100,
        ..pool_config(1)
    };
    let pool = SandboxPool::new(config, Arc::new(NoopMetrics)).unwrap();
    let original = pool.acquire(soon()).await.unwrap().id();

    tokio::time::sleep(Duration::from_millis(150)).await;
    pool.revalidate_idle();
    assert!(pool.stats().retired >= 1);

    let lease = pool.acquire(soon()).await.unwrap();
    assert_ne!(lease.id(), original);
}

#[tokio::test(flavor = "multi_thread")]
async fn bounded_pool_reports_exhaustion() {
    let pool = SandboxPool::new(pool_config(1), Arc::new(NoopMetrics)).unwrap();
    let _held = pool.acquire(soon()).await.unwrap();

    let started = Instant::now();
    let err = pool
        .acquire(Instant::now() + Duration::from_millis(50))
        .await
        .unwrap_err();
    match err {
        PoolError::Exhausted { waited } => assert!(waited >= Duration::from_millis(40)),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let err = pool.acquire(Instant::now()).await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout));
}

#[tokio::test(flavor = "multi_thread")]
async fn waiter_is_woken_by_a_release() {
    let pool = SandboxPool::new(pool_config(1), Arc::new(NoopMetrics)).unwrap();
    let held = pool.acquire(soon()).await.unwrap();
    let held_id = held.id();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);
    });

    let lease = pool.acquire(soon()).await.unwrap();
    assert_eq!(lease.id(), held_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn elastic_pool_grows_past_min_idle() {
    let config = PoolConfig {
        min_idle: 1,
        max_size: None,
        acquire_grace_ms: 5,
        ..PoolConfig::default()
    };
    let pool = SandboxPool::new(config, Arc::new(NoopMetrics)).unwrap();

    let a = pool.acquire(soon()).await.unwrap();
    let b = pool.acquire(soon()).await.unwrap();
    let c = pool.acquire(soon()).await.unwrap();
    let ids: HashSet<u64> = [a.id(), b.id(), c.id()].into();
    assert_eq!(ids.len(), 3);
    assert_eq!(pool.stats().live, 3);
    assert_eq!(pool.stats().max_size, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_executions_get_distinct_sandboxes() {
    let runtime = Arc::new(ScriptRuntime::new(common::config()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let runtime = Arc::clone(&runtime);
        handles.push(tokio::spawn(async move {
            runtime
                .run(
                    common::request(
                        "acme",
                        "const end = Date.now() + 100; while (Date.now() < end) {} 'done'",
                    ),
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.output, json!("done"));
        ids.insert(result.sandbox_id.unwrap());
    }
    assert_eq!(ids.len(), 4);

    let stats = runtime.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.live <= 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_interrupts_running_scripts_and_refuses_new_ones() {
    let runtime = Arc::new(ScriptRuntime::new(common::config()).unwrap());

    let running = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            runtime
                .run(common::request("acme", "while (true) {}"), &CancellationToken::new())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.shutdown();

    let err = running.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err.error,
            ScriptError::Timeout {
                cause: TimeoutCause::Shutdown,
                ..
            }
        ),
        "got {err}"
    );

    let err = runtime
        .run(common::request("acme", "1"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.error,
        ScriptError::PoolExhausted(PoolError::Closed)
    ));

    let stats = runtime.pool_stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.in_use, 0);
}
