mod common;

use serde_json::{Value, json};
use tenant_runtime_quickjs::{ExecutionResult, ScriptError, ScriptRuntime};
use tokio_util::sync::CancellationToken;

async fn run(runtime: &ScriptRuntime, tenant: &str, source: &str) -> ExecutionResult {
    runtime
        .run(common::request(tenant, source), &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn globals_do_not_leak_between_executions() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    let first = run(
        &runtime,
        "acme",
        r#"
        var secret = 'acme-token';
        let scoped = 1;
        function helper() { return secret; }
        globalThis.stash = { card: '4242' };
        globalThis[Symbol.for('hidden')] = true;
        helper()
        "#,
    )
    .await;
    assert_eq!(first.output, json!("acme-token"));

    let second = run(
        &runtime,
        "globex",
        r#"
        [
            typeof secret,
            typeof scoped,
            typeof helper,
            typeof stash,
            globalThis[Symbol.for('hidden')] === undefined,
        ]
        "#,
    )
    .await;
    assert_eq!(
        second.output,
        json!(["undefined", "undefined", "undefined", "undefined", true])
    );
    assert_eq!(first.sandbox_id, second.sandbox_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn redeclaring_let_in_consecutive_runs_is_allowed() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    for expected in [1, 2] {
        let result = run(&runtime, "acme", &format!("let counter = {expected}; counter")).await;
        assert_eq!(result.output, json!(expected));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn builtin_prototypes_cannot_be_tampered_with() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    let first = run(
        &runtime,
        "acme",
        r#"
        Object.prototype.polluted = 'yes';
        Array.prototype.map = null;
        JSON.stringify = () => 'hijacked';
        ({}).polluted
        "#,
    )
    .await;
    assert_eq!(first.output, Value::Null);

    let second = run(
        &runtime,
        "globex",
        "[({}).polluted === undefined, typeof [].map, JSON.stringify({ a: 1 })]",
    )
    .await;
    assert_eq!(second.output, json!([true, "function", r#"{"a":1}"#]));
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_mode_tampering_throws() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    let err = runtime
        .run(
            common::request("acme", "'use strict'; Object.prototype.polluted = 1;"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err.error {
        ScriptError::Runtime { message, .. } => assert!(message.starts_with("TypeError")),
        other => panic!("expected TypeError, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn subclassed_errors_can_still_set_their_name() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    let result = run(
        &runtime,
        "acme",
        r#"
        class ValidationError extends Error {
            constructor(message) {
                super(message);
                this.name = 'ValidationError';
            }
        }
        const err = new ValidationError('total must be positive');
        [err.name, String(err), new Error('plain').name]
        "#,
    )
    .await;
    assert_eq!(
        result.output,
        json!(["ValidationError", "ValidationError: total must be positive", "Error"])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn console_cannot_be_replaced_for_the_next_tenant() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    run(&runtime, "acme", "console.log = function () {}; 0").await;
    let second = run(&runtime, "globex", "console.log('still captured'); 0").await;

    assert_eq!(second.logs.len(), 1);
    assert_eq!(second.logs[0].message, "still captured");
}

#[tokio::test(flavor = "multi_thread")]
async fn global_prototype_is_restored() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    run(
        &runtime,
        "acme",
        "try { Object.setPrototypeOf(globalThis, { injected: 'acme' }); } catch (e) {} 0",
    )
    .await;
    let second = run(&runtime, "globex", "typeof injected").await;
    assert_eq!(second.output, json!("undefined"));
}

#[tokio::test(flavor = "multi_thread")]
async fn context_is_per_execution_and_read_only() {
    let runtime = ScriptRuntime::new(common::single_sandbox_config()).unwrap();

    let first = run(
        &runtime,
        "acme",
        "context.tenant.id = 'globex'; context = null; context.tenant.id",
    )
    .await;
    assert_eq!(first.output, json!("acme"));

    let second = run(&runtime, "globex", "[context.tenant.id, context.tenant.name]").await;
    assert_eq!(second.output, json!(["globex", "globex inc"]));
    assert_eq!(first.sandbox_id, second.sandbox_id);

    let err = runtime
        .run(
            common::request("acme", "'use strict'; context.tenant.id = 'globex';"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err.error {
        ScriptError::Runtime { message, .. } => assert!(message.starts_with("TypeError")),
        other => panic!("expected TypeError, got {other:?}"),
    }
}
