mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tenant_runtime_quickjs::bridge::KeyValueStore;
use tenant_runtime_quickjs::{
    Capabilities, CapabilityError, ExecutionStatus, LimitViolation, ScriptError, ScriptRuntime,
    TimeoutCause,
};
use tokio_util::sync::CancellationToken;

/// Storage backend whose reads block the interpreter thread.
struct StallingKv {
    stall: Duration,
}

#[async_trait]
impl KeyValueStore for StallingKv {
    async fn get(&self, _key: &str) -> Result<Option<serde_json::Value>, CapabilityError> {
        std::thread::sleep(self.stall);
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: serde_json::Value) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool, CapabilityError> {
        Ok(false)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn infinite_loop_is_stopped_at_the_deadline() {
    let runtime = ScriptRuntime::new(common::config()).unwrap();
    let request =
        common::request("acme", "while (true) {}").with_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let err = runtime.run(request, &CancellationToken::new()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        matches!(
            err.error,
            ScriptError::Timeout {
                cause: TimeoutCause::Deadline,
                ..
            }
        ),
        "got {err}"
    );
    assert_eq!(err.partial.status, ExecutionStatus::TimedOut);
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");

    // The interrupted sandbox is reset and usable again.
    let ok = runtime
        .run(common::request("acme", "'alive'"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.output, serde_json::json!("alive"));
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_cancellation_interrupts_the_script() {
    let runtime = ScriptRuntime::new(common::config()).unwrap();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = runtime
        .run(common::request("acme", "for (;;) {}"), &cancel)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.error,
            ScriptError::Timeout {
                cause: TimeoutCause::Cancelled,
                ..
            }
        ),
        "got {err}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn already_cancelled_token_never_acquires() {
    let runtime = ScriptRuntime::new(common::config()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runtime
        .run(common::request("acme", "1"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err.error,
        ScriptError::Timeout {
            cause: TimeoutCause::Cancelled,
            ..
        }
    ));
    assert_eq!(err.partial.sandbox_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn api_call_ceiling_fails_the_execution() {
    let mut config = common::config();
    config.limits.max_api_calls = 5;
    let runtime = ScriptRuntime::new(config).unwrap();

    let err = runtime
        .run(
            common::request("acme", "for (let i = 0; i < 1000; i++) console.log('tick', i); 'done'"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.error,
        ScriptError::ResourceLimit(LimitViolation::ApiCallLimitExceeded { calls: 6, limit: 5 })
    ));
    assert_eq!(err.partial.logs.len(), 5);
    assert_eq!(err.partial.logs[4].message, "tick 4");
    assert_eq!(err.partial.usage.api_calls, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn cpu_time_ceiling_is_enforced_by_the_watchdog() {
    let mut config = common::config();
    config.limits.max_cpu_time_ms = 40;
    let runtime = ScriptRuntime::new(config).unwrap();

    let err = runtime
        .run(common::request("acme", "while (true) {}"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err.error {
        ScriptError::ResourceLimit(LimitViolation::CpuTimeExceeded { used_ms, limit_ms }) => {
            assert_eq!(limit_ms, 40);
            assert!(used_ms > 40);
        }
        other => panic!("expected CPU limit, got {other:?}"),
    }
    assert_eq!(err.partial.status, ExecutionStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn heap_exhaustion_is_a_memory_limit() {
    let mut config = common::config();
    config.pool.memory_limit_bytes = 16 * 1024 * 1024;
    let runtime = ScriptRuntime::new(config).unwrap();

    let err = runtime
        .run(
            common::request(
                "acme",
                "const chunks = []; while (true) chunks.push('x'.repeat(1 << 20) + chunks.length);",
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err.error {
        ScriptError::ResourceLimit(LimitViolation::MemoryExceeded { limit, .. }) => {
            assert_eq!(limit, 16 * 1024 * 1024);
        }
        other => panic!("expected memory limit, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn caught_limit_error_still_fails_the_execution() {
    let mut config = common::config();
    config.limits.max_api_calls = 1;
    let runtime = ScriptRuntime::new(config).unwrap();

    let err = runtime
        .run(
            common::request(
                "acme",
                "try { console.log('a'); console.log('b'); } catch (e) {} 'swallowed'",
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.error,
        ScriptError::ResourceLimit(LimitViolation::ApiCallLimitExceeded { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_run_releases_its_sandbox() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();
    let request = common::request("acme", "while (true) {}").with_timeout(Duration::from_secs(30));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        runtime.run(request, &CancellationToken::new()),
    )
    .await;
    assert!(abandoned.is_err());

    let started = Instant::now();
    let ok = runtime
        .run(common::request("acme", "'free again'"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ok.output, json!("free again"));
    assert!(started.elapsed() < Duration::from_secs(2));

    let stats = runtime.pool_stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.live, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn limit_stop_past_the_grace_period_is_still_a_resource_limit() {
    let mut config = common::config();
    config.limits.max_cpu_time_ms = 40;
    config.executor.interrupt_grace_ms = 50;
    let runtime = ScriptRuntime::builder(config)
        .capabilities(Capabilities::new().with_storage(Arc::new(StallingKv {
            stall: Duration::from_millis(600),
        })))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = runtime
        .run(common::request("acme", "api.storage.get('slow')"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.error,
            ScriptError::ResourceLimit(LimitViolation::CpuTimeExceeded { limit_ms: 40, .. })
        ),
        "got {err}"
    );
    assert_eq!(err.partial.status, ExecutionStatus::Failed);
    assert!(started.elapsed() < Duration::from_millis(500));
}
