mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tenant_runtime_quickjs::bridge::{
    HttpEgress, HttpRequest, HttpResponse, MemoryData, MemoryKv,
};
use tenant_runtime_quickjs::events::EventBus;
use tenant_runtime_quickjs::{
    Capabilities, CapabilityError, EgressPolicy, ExecutionResult, ScriptRuntime,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingEgress {
    calls: Mutex<Vec<HttpRequest>>,
}

impl RecordingEgress {
    fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpEgress for RecordingEgress {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        self.calls.lock().unwrap().push(request);
        Ok(HttpResponse {
            status: 201,
            status_text: "Created".to_string(),
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: r#"{"accepted":true}"#.to_string(),
        })
    }
}

fn runtime_with(capabilities: Capabilities) -> ScriptRuntime {
    ScriptRuntime::builder(common::config())
        .capabilities(capabilities)
        .build()
        .unwrap()
}

async fn run(runtime: &ScriptRuntime, tenant: &str, source: &str) -> ExecutionResult {
    runtime
        .run(common::request(tenant, source), &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_is_namespaced_per_tenant() {
    let kv = Arc::new(MemoryKv::new());
    let runtime = runtime_with(Capabilities::new().with_storage(kv.clone()));

    run(&runtime, "acme", "api.storage.set('plan', { tier: 'gold' }); 0").await;
    run(&runtime, "globex", "api.storage.set('plan', { tier: 'free' }); 0").await;

    assert_eq!(kv.keys(), ["t/acme/plan", "t/globex/plan"]);

    let acme = run(&runtime, "acme", "api.storage.get('plan').tier").await;
    assert_eq!(acme.output, json!("gold"));

    let missing = run(&runtime, "initech", "api.storage.get('plan')").await;
    assert_eq!(missing.output, serde_json::Value::Null);

    let removed = run(
        &runtime,
        "globex",
        "[api.storage.delete('plan'), api.storage.delete('plan')]",
    )
    .await;
    assert_eq!(removed.output, json!([true, false]));
    assert_eq!(kv.keys(), ["t/acme/plan"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_storage_key_is_rejected() {
    let runtime = runtime_with(Capabilities::new().with_storage(Arc::new(MemoryKv::new())));

    let result = run(
        &runtime,
        "acme",
        "try { api.storage.set('', 1); 'stored' } catch (e) { e.message }",
    )
    .await;
    assert_eq!(result.output, json!("invalid argument: storage key must not be empty"));
}

#[tokio::test(flavor = "multi_thread")]
async fn data_rows_are_scoped_and_stamped() {
    let data = Arc::new(MemoryData::new());
    data.seed(
        "orders",
        [
            json!({ "id": 1, "tenant_id": "acme", "status": "open" }),
            json!({ "id": 2, "tenant_id": "globex", "status": "open" }),
            json!({ "id": 3, "tenant_id": "acme", "status": "closed" }),
        ],
    );
    let runtime = runtime_with(Capabilities::new().with_data(data.clone()));

    let open = run(
        &runtime,
        "acme",
        "api.data.query('orders', { status: 'open' }).map(r => r.id)",
    )
    .await;
    assert_eq!(open.output, json!([1]));

    let all = run(&runtime, "acme", "api.data.query('orders').length").await;
    assert_eq!(all.output, json!(2));

    let inserted = run(
        &runtime,
        "acme",
        "api.data.insert('orders', { id: 4, tenant_id: 'globex', status: 'open' }).tenant_id",
    )
    .await;
    assert_eq!(inserted.output, json!("acme"));

    let stored = data.rows("orders");
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[3]["tenant_id"], json!("acme"));
}

#[tokio::test(flavor = "multi_thread")]
async fn http_fetch_goes_through_the_egress() {
    let egress = Arc::new(RecordingEgress::default());
    let runtime = runtime_with(Capabilities::new().with_http(egress.clone()));

    let result = run(
        &runtime,
        "acme",
        r#"
        const res = api.http.fetch('https://api.example.com/orders', {
            method: 'post',
            headers: { 'x-request': '1' },
            body: { total: 10 },
        });
        [res.status, res.ok, res.statusText, res.json().accepted]
        "#,
    )
    .await;
    assert_eq!(result.output, json!([201, true, "Created", true]));

    let calls = egress.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "POST");
    assert_eq!(calls[0].url, "https://api.example.com/orders");
    assert_eq!(calls[0].body.as_deref(), Some(r#"{"total":10}"#));
    assert_eq!(calls[0].headers.get("x-request").map(String::as_str), Some("1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn internal_destinations_are_denied() {
    let egress = Arc::new(RecordingEgress::default());
    let runtime = runtime_with(
        Capabilities::new()
            .with_http(egress.clone())
            .with_egress_policy(EgressPolicy::default().deny_host("ledger.internal.example")),
    );

    for url in [
        "http://127.0.0.1:8080/admin",
        "http://169.254.169.254/latest/meta-data/",
        "http://10.0.0.12/",
        "http://localhost/",
        "https://ledger.internal.example/",
        "file:///etc/passwd",
    ] {
        let source = format!(
            "try {{ api.http.fetch('{url}'); 'reached' }} catch (e) {{ e.message }}"
        );
        let result = run(&runtime, "acme", &source).await;
        let message = result.output.as_str().unwrap_or_default().to_string();
        assert!(message.starts_with("denied:"), "{url}: {message}");
    }
    assert!(egress.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn published_events_carry_the_executing_tenant() {
    let bus = Arc::new(EventBus::default());
    let mut receiver = bus.subscribe();
    let runtime = runtime_with(Capabilities::new().with_events(bus.clone()));

    run(
        &runtime,
        "acme",
        "api.events.publish('invoice.paid', { invoice: 'INV-9', tenantId: 'globex' }); 0",
    )
    .await;

    let event = receiver.recv().await.unwrap();
    assert_eq!(event.tenant_id, "acme");
    assert_eq!(event.event_type, "invoice.paid");
    assert_eq!(event.payload["invoice"], json!("INV-9"));
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_calls_count_against_the_api_budget() {
    let runtime = runtime_with(Capabilities::new().with_storage(Arc::new(MemoryKv::new())));

    let result = run(
        &runtime,
        "acme",
        "api.storage.set('a', 1); api.storage.get('a'); console.log('x'); 0",
    )
    .await;
    assert_eq!(result.usage.api_calls, 3);
    assert!(result.usage.memory_bytes > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_capabilities_are_absent() {
    let runtime = runtime_with(Capabilities::new().with_storage(Arc::new(MemoryKv::new())));

    let result = run(
        &runtime,
        "acme",
        "[typeof api.http, typeof api.data, typeof api.events, typeof api.storage]",
    )
    .await;
    assert_eq!(
        result.output,
        json!(["undefined", "undefined", "undefined", "object"])
    );

    let bare = ScriptRuntime::new(common::config()).unwrap();
    let result = run(&bare, "acme", "Object.keys(api).length").await;
    assert_eq!(result.output, json!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn api_object_is_frozen() {
    let runtime = runtime_with(Capabilities::new().with_storage(Arc::new(MemoryKv::new())));

    let result = run(
        &runtime,
        "acme",
        "api.storage.get = () => 'forged'; api.extra = 1; [typeof api.extra, api.storage.get('k')]",
    )
    .await;
    assert_eq!(result.output, json!(["undefined", null]));
}
