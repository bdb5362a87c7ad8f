use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use tenant_runtime_quickjs::bridge::MemoryKv;
use tenant_runtime_quickjs::{
    Capabilities, ExecutionContext, ExecutionRequest, ProgramCache, RuntimeConfig, Script,
    ScriptRuntime,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn request(source: &str) -> ExecutionRequest {
    ExecutionRequest::manual(
        Script::new("bench", source),
        ExecutionContext::new("acme", "Acme"),
        json!({ "items": [1, 2, 3, 4, 5] }),
    )
}

fn bench_runtime_new(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("ScriptRuntime/new", |b| {
        b.iter(|| {
            rt.block_on(async {
                let runtime = ScriptRuntime::new(RuntimeConfig::default()).unwrap();
                runtime.shutdown();
            })
        })
    });
}

fn bench_run_cached_expression(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let runtime = rt.block_on(async { ScriptRuntime::new(RuntimeConfig::default()).unwrap() });
    let cancel = CancellationToken::new();

    c.bench_function("ScriptRuntime/run_cached_expression", |b| {
        b.iter(|| {
            rt.block_on(async {
                runtime
                    .run(request("input.items.reduce((a, b) => a + b, 0)"), &cancel)
                    .await
                    .unwrap()
            })
        })
    });
}

fn bench_run_with_storage(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let runtime = rt.block_on(async {
        ScriptRuntime::builder(RuntimeConfig::default())
            .capabilities(Capabilities::new().with_storage(Arc::new(MemoryKv::new())))
            .build()
            .unwrap()
    });
    let cancel = CancellationToken::new();

    c.bench_function("ScriptRuntime/run_with_storage", |b| {
        b.iter(|| {
            rt.block_on(async {
                runtime
                    .run(
                        request(
                            r#"
                            const count = (api.storage.get('count') || 0) + 1;
                            api.storage.set('count', count);
                            console.log('count', count);
                            count
                            "#,
                        ),
                        &cancel,
                    )
                    .await
                    .unwrap()
            })
        })
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let cache = ProgramCache::new(64);
    let source: Arc<str> = Arc::from("const total = input.items.length; total * 2");
    cache.compile("bench", &source, |_| Ok(())).unwrap();

    c.bench_function("ProgramCache/hit", |b| {
        b.iter(|| cache.compile("bench", &source, |_| Ok(())).unwrap())
    });
}

criterion_group!(
    benches,
    bench_runtime_new,
    bench_run_cached_expression,
    bench_run_with_storage,
    bench_cache_hit,
);
criterion_main!(benches);
