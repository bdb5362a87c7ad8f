//! Execution-scoped globals and the capabilities exposed to scripts.
//!
//! Every capability is a native function taking and returning JSON text.
//! The JS side (`BRIDGE_JS`) wraps them into `api.*` and turns error replies
//! into thrown `Error`s, the way the fetch binding reports failures.

mod context;
mod data;
mod http;
mod publish;
mod session;
mod storage;

use std::sync::Arc;

use rquickjs::{Ctx, Function, Object, Value};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

pub use context::{ExecutionContext, TenantInfo, UserInfo, validate_tenant_id};
pub use data::{DataAccess, MemoryData, TENANT_COLUMN};
pub use http::{EgressPolicy, HttpEgress, HttpRequest, HttpResponse, ReqwestEgress};
pub use publish::EventPublisher;
pub use session::ExecutionSession;
pub(crate) use session::SessionParts;
pub use storage::{KeyValueStore, MemoryKv, namespaced_key};

use crate::events::DomainEvent;
use crate::governor::LimitViolation;
use crate::sandbox::{self, InterruptReason};
use crate::script::{LogLevel, TriggerKind};

/// Builds `api` from the native functions that were installed.
const BRIDGE_JS: &str = r#"
(function (natives) {
    const parse = JSON.parse;
    const stringify = JSON.stringify;

    const call = (native, args) => {
        const reply = parse(native(stringify(args)));
        if (reply.error !== undefined) {
            throw new Error(reply.error);
        }
        return reply.ok;
    };

    const api = {};

    if (natives.httpFetch) {
        api.http = {
            fetch(url, options = {}) {
                let body = null;
                if (options.body !== undefined && options.body !== null) {
                    body = typeof options.body === 'string' ? options.body : stringify(options.body);
                }
                const res = call(natives.httpFetch, {
                    url: String(url),
                    method: String(options.method || 'GET').toUpperCase(),
                    headers: options.headers || {},
                    body
                });
                return {
                    status: res.status,
                    statusText: res.statusText,
                    headers: res.headers,
                    ok: res.status >= 200 && res.status < 300,
                    body: res.body,
                    text: () => res.body,
                    json: () => parse(res.body)
                };
            }
        };
    }

    if (natives.kvGet) {
        api.storage = {
            get: (key) => call(natives.kvGet, { key: String(key) }),
            set: (key, value) => { call(natives.kvSet, { key: String(key), value }); },
            delete: (key) => call(natives.kvDelete, { key: String(key) })
        };
    }

    if (natives.dataQuery) {
        api.data = {
            query: (collection, filter = {}) => call(natives.dataQuery, { collection: String(collection), filter }),
            insert: (collection, row) => call(natives.dataInsert, { collection: String(collection), row })
        };
    }

    if (natives.publish) {
        api.events = {
            publish: (type, payload = {}) => { call(natives.publish, { type: String(type), payload }); }
        };
    }

    return api;
})
"#;

/// Why the bridge could not be installed. Raised before any user code runs.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("execution context has no tenant id")]
    MissingTenant,

    #[error("invalid tenant id '{0}'")]
    InvalidTenant(String),

    #[error("failed to install bindings: {0}")]
    Install(String),
}

/// Failure of a single capability call, reported to the script as a thrown `Error`.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Limit(#[from] LimitViolation),

    #[error("execution interrupted ({0:?})")]
    Interrupted(InterruptReason),

    #[error("denied: {0}")]
    Denied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("capability call timed out")]
    Timeout,

    #[error("{0}")]
    Backend(String),
}

/// Capability backends available to a tenant's scripts. Unset ones are absent from `api`.
#[derive(Clone, Default)]
pub struct Capabilities {
    http: Option<Arc<dyn HttpEgress>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    data: Option<Arc<dyn DataAccess>>,
    events: Option<Arc<dyn EventPublisher>>,
    egress_policy: EgressPolicy,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("http", &self.http.is_some())
            .field("storage", &self.storage.is_some())
            .field("data", &self.data.is_some())
            .field("events", &self.events.is_some())
            .field("egress_policy", &self.egress_policy)
            .finish()
    }
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(mut self, egress: Arc<dyn HttpEgress>) -> Self {
        self.http = Some(egress);
        self
    }

    pub fn with_storage(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(store);
        self
    }

    pub fn with_data(mut self, data: Arc<dyn DataAccess>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_events(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(publisher);
        self
    }

    pub fn with_egress_policy(mut self, policy: EgressPolicy) -> Self {
        self.egress_policy = policy;
        self
    }
}

/// What one execution sees: `context`, `input`, `event`, `console` and `api`.
#[derive(Clone, Debug)]
pub struct Bridge {
    context: ExecutionContext,
    trigger: TriggerKind,
    input: serde_json::Value,
    event: Option<serde_json::Value>,
    capabilities: Option<Capabilities>,
}

impl Bridge {
    pub fn new(
        context: ExecutionContext,
        trigger: TriggerKind,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            context,
            trigger,
            input: serde_json::Value::Null,
            event: None,
            capabilities: Some(capabilities),
        }
    }

    /// Context, `event` and console only; used for subscription filters.
    pub fn reduced(context: ExecutionContext, event: serde_json::Value) -> Self {
        Self {
            context,
            trigger: TriggerKind::Event,
            input: serde_json::Value::Null,
            event: Some(event),
            capabilities: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_event(mut self, event: serde_json::Value) -> Self {
        self.event = Some(event);
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Define this execution's globals in `ctx`.
    pub fn install(&self, ctx: &Ctx<'_>, session: &ExecutionSession) -> Result<(), SetupError> {
        self.context.validate()?;
        let engine =
            |e: rquickjs::Error| SetupError::Install(sandbox::describe_error(ctx, e).to_string());

        let log = native_log(ctx, session).map_err(engine)?;
        sandbox::define_readonly_value(ctx, "__native_log", log.into_value()).map_err(engine)?;

        let deadline_ms = session.remaining().as_millis() as u64;
        let context = self.context.to_script_value(deadline_ms, self.trigger);
        sandbox::define_readonly_json(ctx, "context", &context).map_err(engine)?;

        if self.capabilities.is_some() {
            sandbox::define_readonly_json(ctx, "input", &self.input).map_err(engine)?;
        }
        if let Some(event) = &self.event {
            sandbox::define_readonly_json(ctx, "event", event).map_err(engine)?;
        }

        if let Some(capabilities) = &self.capabilities {
            let natives = self
                .natives(ctx, session, capabilities)
                .map_err(engine)?;
            let factory: Function = ctx.eval(BRIDGE_JS).map_err(engine)?;
            let api: Value = factory.call((natives,)).map_err(engine)?;
            sandbox::define_readonly_value(ctx, "api", api).map_err(engine)?;
        }

        tracing::trace!(
            execution_id = %session.execution_id(),
            tenant_id = %self.context.tenant_id(),
            trigger = self.trigger.as_str(),
            full = self.capabilities.is_some(),
            "bridge installed"
        );
        Ok(())
    }

    fn natives<'js>(
        &self,
        ctx: &Ctx<'js>,
        session: &ExecutionSession,
        capabilities: &Capabilities,
    ) -> rquickjs::Result<Object<'js>> {
        let natives = Object::new(ctx.clone())?;
        let tenant = self.context.tenant_id().to_string();

        if let Some(egress) = &capabilities.http {
            let egress = Arc::clone(egress);
            let policy = capabilities.egress_policy.clone();
            natives.set(
                "httpFetch",
                json_native(ctx, session, move |session, args| {
                    let request: HttpRequest = parse_args(args)?;
                    policy.check(&request.url)?;
                    let response = session.block_on(egress.send(request))??;
                    session.track_bytes(response.body.len())?;
                    to_reply(&response)
                })?,
            )?;
        }

        if let Some(store) = &capabilities.storage {
            #[derive(Deserialize)]
            struct KeyArgs {
                key: String,
            }
            #[derive(Deserialize)]
            struct SetArgs {
                key: String,
                #[serde(default)]
                value: serde_json::Value,
            }

            let (s, t) = (Arc::clone(store), tenant.clone());
            natives.set(
                "kvGet",
                json_native(ctx, session, move |session, args| {
                    let KeyArgs { key } = parse_args(args)?;
                    let key = namespaced_key(&t, &key)?;
                    let value = session.block_on(s.get(&key))??;
                    Ok(value.unwrap_or(serde_json::Value::Null))
                })?,
            )?;

            let (s, t) = (Arc::clone(store), tenant.clone());
            natives.set(
                "kvSet",
                json_native(ctx, session, move |session, args| {
                    let SetArgs { key, value } = parse_args(args)?;
                    let key = namespaced_key(&t, &key)?;
                    session.block_on(s.set(&key, value))??;
                    Ok(serde_json::Value::Null)
                })?,
            )?;

            let (s, t) = (Arc::clone(store), tenant.clone());
            natives.set(
                "kvDelete",
                json_native(ctx, session, move |session, args| {
                    let KeyArgs { key } = parse_args(args)?;
                    let key = namespaced_key(&t, &key)?;
                    let removed = session.block_on(s.delete(&key))??;
                    Ok(serde_json::Value::Bool(removed))
                })?,
            )?;
        }

        if let Some(data) = &capabilities.data {
            #[derive(Deserialize)]
            struct QueryArgs {
                collection: String,
                #[serde(default)]
                filter: serde_json::Value,
            }
            #[derive(Deserialize)]
            struct InsertArgs {
                collection: String,
                row: serde_json::Value,
            }

            let (d, t) = (Arc::clone(data), tenant.clone());
            natives.set(
                "dataQuery",
                json_native(ctx, session, move |session, args| {
                    let QueryArgs { collection, filter } = parse_args(args)?;
                    let rows = session.block_on(d.query(&t, &collection, &filter))??;
                    let rows = data::scope_rows(&t, rows);
                    to_reply(&rows)
                })?,
            )?;

            let (d, t) = (Arc::clone(data), tenant.clone());
            natives.set(
                "dataInsert",
                json_native(ctx, session, move |session, args| {
                    let InsertArgs { collection, row } = parse_args(args)?;
                    let row = data::stamp_row(&t, row)?;
                    let stored = session.block_on(d.insert(&t, &collection, row))??;
                    Ok(stored)
                })?,
            )?;
        }

        if let Some(publisher) = &capabilities.events {
            #[derive(Deserialize)]
            struct PublishArgs {
                #[serde(rename = "type")]
                event_type: String,
                #[serde(default)]
                payload: serde_json::Value,
            }

            let (p, t) = (Arc::clone(publisher), tenant);
            natives.set(
                "publish",
                json_native(ctx, session, move |session, args| {
                    let PublishArgs { event_type, payload } = parse_args(args)?;
                    if event_type.is_empty() {
                        return Err(CapabilityError::InvalidArgument(
                            "event type is required".into(),
                        ));
                    }
                    let event = DomainEvent::new(t.clone(), event_type, payload);
                    session.block_on(p.publish(event))??;
                    Ok(serde_json::Value::Null)
                })?,
            )?;
        }

        Ok(natives)
    }
}

fn parse_args<T: DeserializeOwned>(args: serde_json::Value) -> Result<T, CapabilityError> {
    serde_json::from_value(args).map_err(|e| CapabilityError::InvalidArgument(e.to_string()))
}

fn to_reply<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, CapabilityError> {
    serde_json::to_value(value).map_err(|e| CapabilityError::Backend(e.to_string()))
}

/// Wrap `op` as a JSON-in/JSON-out native; every call is charged before `op` runs.
fn json_native<'js, F>(
    ctx: &Ctx<'js>,
    session: &ExecutionSession,
    op: F,
) -> rquickjs::Result<Function<'js>>
where
    F: Fn(&ExecutionSession, serde_json::Value) -> Result<serde_json::Value, CapabilityError>
        + Send
        + 'static,
{
    let session = session.clone();
    Function::new(ctx.clone(), move |payload: String| -> String {
        let reply = session
            .charge_api_call()
            .and_then(|()| session.track_bytes(payload.len()))
            .and_then(|()| {
                serde_json::from_str(&payload)
                    .map_err(|e| CapabilityError::InvalidArgument(e.to_string()))
            })
            .and_then(|args| op(&session, args));

        match reply {
            Ok(value) => json!({ "ok": value }).to_string(),
            Err(err) => {
                tracing::debug!(
                    execution_id = %session.execution_id(),
                    error = %err,
                    "capability call failed"
                );
                json!({ "error": err.to_string() }).to_string()
            }
        }
    })
}

/// `__native_log(level, message)`, the sink behind `console.*`.
fn native_log<'js>(ctx: &Ctx<'js>, session: &ExecutionSession) -> rquickjs::Result<Function<'js>> {
    let session = session.clone();
    Function::new(ctx.clone(), move |level: String, message: String| {
        if session.charge_api_call().is_err() {
            return;
        }
        if session.track_bytes(message.len()).is_err() {
            return;
        }
        session.log(LogLevel::parse(&level), message);
    })
}
