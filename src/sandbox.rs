use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, Exception, FromJs, Function, Object, Runtime, Value, qjs};

use crate::config::PoolConfig;
use crate::governor::LimitViolation;

/// Host helpers and console, evaluated once per instance before the baseline is recorded.
///
/// Intrinsics are captured in the closure so later tampering with globals
/// cannot redirect the helpers the host relies on.
const PRELUDE_JS: &str = r#"
(function () {
    const indirectEval = eval;
    const stringify = JSON.stringify;
    const parse = JSON.parse;
    const freeze = Object.freeze;
    const isFrozen = Object.isFrozen;
    const ownKeys = Reflect.ownKeys;
    const apply = Reflect.apply;
    const defineProperty = Reflect.defineProperty;
    const deleteProperty = Reflect.deleteProperty;
    const getPrototypeOf = Reflect.getPrototypeOf;
    const setPrototypeOf = Reflect.setPrototypeOf;
    const SetCtor = Set;
    const setHas = Set.prototype.has;
    const setAdd = Set.prototype.add;
    const toStr = String;
    const globalProto = getPrototypeOf(globalThis);
    let baseline = null;

    const format = (args) => args.map(a =>
        typeof a === 'object' && a !== null ? stringify(a) : toStr(a)
    ).join(' ');

    const emit = (level, args) => {
        const sink = globalThis.__native_log;
        if (typeof sink === 'function') {
            sink(level, format(args));
        }
    };

    const console = {
        log: (...args) => emit('info', args),
        info: (...args) => emit('info', args),
        debug: (...args) => emit('debug', args),
        warn: (...args) => emit('warn', args),
        error: (...args) => emit('error', args)
    };

    const freezeDeep = (value) => {
        if ((typeof value !== 'object' && typeof value !== 'function') || value === null) {
            return value;
        }
        if (isFrozen(value)) {
            return value;
        }
        freeze(value);
        for (const key of ownKeys(value)) {
            freezeDeep(value[key]);
        }
        return value;
    };

    const host = {
        run(source) {
            const value = indirectEval(source);
            try {
                const text = stringify(value);
                return text === undefined ? null : text;
            } catch (e) {
                return null;
            }
        },
        freezeDeep,
        defineReadonly(name, value) {
            defineProperty(globalThis, name, {
                value,
                writable: false,
                enumerable: false,
                configurable: true
            });
        },
        defineJson(name, text) {
            host.defineReadonly(name, freezeDeep(parse(text)));
        },
        seal() {
            if (baseline !== null) {
                throw new TypeError('baseline already recorded');
            }
            baseline = new SetCtor(ownKeys(globalThis));
            return ownKeys(globalThis).map(k => toStr(k));
        },
        strip() {
            if (getPrototypeOf(globalThis) !== globalProto) {
                setPrototypeOf(globalThis, globalProto);
            }
            const leftover = [];
            for (const key of ownKeys(globalThis)) {
                if (apply(setHas, baseline, [key])) {
                    continue;
                }
                if (!deleteProperty(globalThis, key)) {
                    leftover.push(toStr(key));
                }
            }
            if (getPrototypeOf(globalThis) !== globalProto) {
                leftover.push('[[Prototype]]');
            }
            return leftover;
        }
    };

    defineProperty(globalThis, 'console', { value: console, writable: true, enumerable: false, configurable: true });
    defineProperty(globalThis, '__sandbox', {
        value: freeze(host),
        writable: false,
        enumerable: false,
        configurable: false
    });
})();
"#;

/// Locks down builtins so one tenant cannot leave modified intrinsics for the next.
///
/// Baseline globals become read-only and every builtin reachable from them is
/// frozen. Common prototype data properties are turned into accessors first,
/// so assigning e.g. `this.name` on an instance still creates an own property.
const HARDEN_JS: &str = r#"
(function () {
    const ownKeys = Reflect.ownKeys;
    const getOwnPropertyDescriptor = Reflect.getOwnPropertyDescriptor;
    const defineProperty = Reflect.defineProperty;
    const getPrototypeOf = Reflect.getPrototypeOf;
    const freeze = Object.freeze;
    const overridable = ['constructor', 'name', 'message', 'toString', 'valueOf', 'toLocaleString', 'toJSON'];
    const seen = new Set([globalThis]);

    const tame = (proto) => {
        for (const key of overridable) {
            const desc = getOwnPropertyDescriptor(proto, key);
            if (!desc || !('value' in desc) || !desc.configurable) {
                continue;
            }
            const value = desc.value;
            defineProperty(proto, key, {
                get() { return value; },
                set(next) {
                    if (this === proto) {
                        throw new TypeError('Cannot assign to read only property ' + key);
                    }
                    defineProperty(this, key, { value: next, writable: true, enumerable: true, configurable: true });
                },
                enumerable: desc.enumerable,
                configurable: false
            });
        }
    };

    const harden = (value) => {
        if ((typeof value !== 'object' && typeof value !== 'function') || value === null) {
            return;
        }
        if (seen.has(value)) {
            return;
        }
        seen.add(value);
        if (typeof value === 'function') {
            const proto = getOwnPropertyDescriptor(value, 'prototype');
            if (proto && typeof proto.value === 'object' && proto.value !== null) {
                tame(proto.value);
            }
        }
        freeze(value);
        for (const key of ownKeys(value)) {
            const desc = getOwnPropertyDescriptor(value, key);
            if (!desc) {
                continue;
            }
            if ('value' in desc) {
                harden(desc.value);
            } else {
                harden(desc.get);
                harden(desc.set);
            }
        }
        harden(getPrototypeOf(value));
    };

    tame(Object.prototype);
    for (const key of ownKeys(globalThis)) {
        if (key === 'globalThis') {
            continue;
        }
        const desc = getOwnPropertyDescriptor(globalThis, key);
        if ('value' in desc) {
            harden(desc.value);
            defineProperty(globalThis, key, { writable: false, configurable: false });
        } else {
            harden(desc.get);
            harden(desc.set);
            defineProperty(globalThis, key, { configurable: false });
        }
    }
    harden(getPrototypeOf(globalThis));
})();
"#;

/// Trivial deterministic expression used as the liveness probe.
const PROBE_JS: &str = "[1, 2, 3, 4, 5, 6, 7].reduce((a, b) => a + b, 0)";
const PROBE_EXPECTED: i32 = 28;

/// File name reported in syntax errors raised by the compile-only parse.
const SCRIPT_FILE: &CStr = c"<script>";

/// Identity of a sandbox, unique within the process.
pub type SandboxId = u64;

/// Errors raised while creating or recycling a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("QuickJS engine error: {0}")]
    Engine(String),

    #[error("globals could not be stripped: {0:?}")]
    Dirty(Vec<String>),

    #[error("promise jobs still pending after reset")]
    PendingJobs,
}

impl From<rquickjs::Error> for SandboxError {
    fn from(err: rquickjs::Error) -> Self {
        SandboxError::Engine(err.to_string())
    }
}

/// Why the interpreter was asked to stop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterruptReason {
    Deadline,
    Cancelled,
    Limit(LimitViolation),
    Shutdown,
}

/// Shared between the QuickJS interrupt handler and the host side.
#[derive(Debug)]
struct InterruptState {
    origin: Instant,
    flag: AtomicBool,
    /// Nanoseconds since `origin` after which the handler interrupts; 0 = unarmed.
    deadline_ns: AtomicU64,
    epoch: AtomicU64,
    reason: Mutex<Option<InterruptReason>>,
}

impl InterruptState {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            flag: AtomicBool::new(false),
            deadline_ns: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            reason: Mutex::new(None),
        }
    }

    fn should_interrupt(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        let deadline = self.deadline_ns.load(Ordering::Acquire);
        if deadline == 0 || (self.origin.elapsed().as_nanos() as u64) < deadline {
            return false;
        }
        if let Ok(mut reason) = self.reason.try_lock() {
            reason.get_or_insert(InterruptReason::Deadline);
        }
        true
    }

    fn arm(&self, bound: Duration) {
        let at = self.origin.elapsed().saturating_add(bound).as_nanos() as u64;
        self.deadline_ns.store(at.max(1), Ordering::Release);
    }

    fn disarm(&self) {
        self.deadline_ns.store(0, Ordering::Release);
    }

    /// Invalidate outstanding handles and clear any pending interrupt.
    fn advance_epoch(&self) -> u64 {
        let mut reason = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *reason = None;
        self.flag.store(false, Ordering::Release);
        epoch
    }
}

/// Interrupts one binding of a sandbox.
///
/// A handle is tied to the epoch it was issued for; tripping it after the
/// sandbox moved on to another execution has no effect.
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    state: Arc<InterruptState>,
    epoch: u64,
}

impl InterruptHandle {
    /// Record `reason` and raise the interrupt flag; the first reason wins.
    pub fn trip(&self, reason: InterruptReason) -> bool {
        let mut current = self.state.reason.lock().unwrap_or_else(|e| e.into_inner());
        if self.state.epoch.load(Ordering::Acquire) != self.epoch || current.is_some() {
            return false;
        }
        *current = Some(reason);
        self.state.flag.store(true, Ordering::Release);
        true
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        let current = self.state.reason.lock().unwrap_or_else(|e| e.into_inner());
        if self.state.epoch.load(Ordering::Acquire) != self.epoch {
            return None;
        }
        current.clone()
    }

    pub fn is_tripped(&self) -> bool {
        self.reason().is_some()
    }
}

/// An exception raised by guest code, or an engine failure shaped like one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsException {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl JsException {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            name: "InternalError".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    fn syntax(message: impl Into<String>) -> Self {
        Self {
            name: "SyntaxError".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn is_syntax_error(&self) -> bool {
        self.name == "SyntaxError"
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.message.contains("out of memory")
    }
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Turn an rquickjs error into a [`JsException`], consuming the pending exception if any.
pub(crate) fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> JsException {
    match err {
        rquickjs::Error::Exception => describe_value(ctx, ctx.catch()),
        rquickjs::Error::Allocation => JsException::internal("out of memory"),
        other => JsException::internal(other.to_string()),
    }
}

fn describe_value<'js>(ctx: &Ctx<'js>, thrown: Value<'js>) -> JsException {
    if let Some(obj) = thrown.as_object() {
        let name: Option<String> = obj.get("name").ok();
        if let Some(exception) = Exception::from_object(obj.clone()) {
            return JsException {
                name: name.unwrap_or_else(|| "Error".to_string()),
                message: exception.message().unwrap_or_default(),
                stack: exception.stack().filter(|s| !s.is_empty()),
            };
        }
    }

    let message = match Coerced::<String>::from_js(ctx, thrown) {
        Ok(value) => value.0,
        Err(err) => format!("uncaught value could not be stringified: {err}"),
    };
    JsException {
        name: "Error".to_string(),
        message,
        stack: None,
    }
}

fn host_helpers<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    ctx.globals().get("__sandbox")
}

/// Define a frozen copy of `value` as the read-only global `name`.
pub(crate) fn define_readonly_json(
    ctx: &Ctx<'_>,
    name: &str,
    value: &serde_json::Value,
) -> rquickjs::Result<()> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    let define: Function = host_helpers(ctx)?.get("defineJson")?;
    define.call::<_, ()>((name, text))
}

/// Define an already-built JS value as the read-only global `name`, deep-freezing it.
pub(crate) fn define_readonly_value<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    value: Value<'js>,
) -> rquickjs::Result<()> {
    let helpers = host_helpers(ctx)?;
    let freeze: Function = helpers.get("freezeDeep")?;
    let frozen: Value = freeze.call((value,))?;
    let define: Function = helpers.get("defineReadonly")?;
    define.call::<_, ()>((name, frozen))
}

/// One QuickJS runtime + context, reused across executions by the pool.
///
/// A sandbox is a single-threaded actor: it is bound to at most one execution
/// and only touched by the thread holding its lease.
pub struct Sandbox {
    id: SandboxId,
    pool_id: u64,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    healthy: AtomicBool,
    baseline: HashSet<String>,
    interrupt: Arc<InterruptState>,
    context: Context,
    runtime: Runtime,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("use_count", &self.use_count)
            .field("healthy", &self.is_healthy())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl Sandbox {
    /// Create a sandbox, run the prelude, optionally harden builtins and record the baseline.
    pub fn new(id: SandboxId, pool_id: u64, config: &PoolConfig) -> Result<Self, SandboxError> {
        let runtime = Runtime::new()?;
        if config.memory_limit_bytes > 0 {
            runtime.set_memory_limit(config.memory_limit_bytes);
        }
        if config.max_stack_bytes > 0 {
            runtime.set_max_stack_size(config.max_stack_bytes);
        }

        let interrupt = Arc::new(InterruptState::new());
        let handler_state = Arc::clone(&interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || handler_state.should_interrupt())));

        let context = Context::full(&runtime)?;
        let harden = config.harden_builtins;

        let baseline = context.with(|ctx| -> Result<HashSet<String>, SandboxError> {
            ctx.eval::<(), _>(PRELUDE_JS)
                .map_err(|e| SandboxError::Engine(describe_error(&ctx, e).to_string()))?;
            if harden {
                ctx.eval::<(), _>(HARDEN_JS)
                    .map_err(|e| SandboxError::Engine(describe_error(&ctx, e).to_string()))?;
            }
            let seal: Function = host_helpers(&ctx)?.get("seal")?;
            let names: Vec<String> = seal
                .call(())
                .map_err(|e| SandboxError::Engine(describe_error(&ctx, e).to_string()))?;
            Ok(names.into_iter().collect())
        })?;

        let now = Instant::now();
        tracing::debug!(sandbox_id = id, globals = baseline.len(), harden, "sandbox created");

        Ok(Self {
            id,
            pool_id,
            created_at: now,
            last_used: now,
            use_count: 0,
            healthy: AtomicBool::new(true),
            baseline,
            interrupt,
            context,
            runtime,
        })
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn baseline(&self) -> &HashSet<String> {
        &self.baseline
    }

    /// Whether the instance crossed its age or use-count ceiling.
    pub fn is_expired(&self, config: &PoolConfig) -> bool {
        if let Some(max_age) = config.max_age() {
            if self.age() >= max_age {
                return true;
            }
        }
        config.max_uses > 0 && self.use_count >= config.max_uses
    }

    /// Bind to a new execution: bump the use count and issue a fresh interrupt handle.
    pub(crate) fn bind(&mut self) -> InterruptHandle {
        self.use_count += 1;
        self.last_used = Instant::now();
        let epoch = self.interrupt.advance_epoch();
        InterruptHandle {
            state: Arc::clone(&self.interrupt),
            epoch,
        }
    }

    /// Interrupt the current binding once `bound` elapses, whether or not a
    /// watchdog is still observing it. Cleared by the next reset or probe.
    pub(crate) fn arm_deadline(&self, bound: Duration) {
        self.interrupt.arm(bound);
    }

    /// Run `f` inside the interpreter context.
    ///
    /// A panic in `f` marks the sandbox unhealthy and is resumed only after
    /// the engine lock has been released, so the lock is never poisoned.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        let outcome = self
            .context
            .with(|ctx| catch_unwind(AssertUnwindSafe(move || f(ctx))));
        outcome.unwrap_or_else(|panic| {
            self.healthy.store(false, Ordering::Release);
            resume_unwind(panic)
        })
    }

    /// Parse `source` as a global script without running any of it.
    ///
    /// The text is parsed exactly as [`evaluate`](Self::evaluate) receives it.
    pub fn check_syntax(&self, source: &str) -> Result<(), JsException> {
        let text = CString::new(source)
            .map_err(|_| JsException::syntax("source contains a NUL byte"))?;
        self.with(|ctx| {
            let raw_ctx = ctx.as_raw().as_ptr();
            let flags = (qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY) as _;
            // SAFETY: `text` is NUL-terminated and outlives the call. The
            // compiled function is owned here and freed before returning.
            let failed = unsafe {
                let compiled = qjs::JS_Eval(
                    raw_ctx,
                    text.as_ptr(),
                    text.as_bytes().len() as _,
                    SCRIPT_FILE.as_ptr(),
                    flags,
                );
                let failed = qjs::JS_IsException(compiled);
                if !failed {
                    qjs::JS_FreeValue(raw_ctx, compiled);
                }
                failed
            };
            if failed {
                Err(describe_error(&ctx, rquickjs::Error::Exception))
            } else {
                Ok(())
            }
        })
    }

    /// Evaluate `source` as a global program and return its completion value as JSON.
    ///
    /// `let`/`const` declarations stay scoped to the evaluation and `var`s
    /// become deletable globals, so [`reset`](Self::reset) can strip them.
    pub fn evaluate(&self, source: &str) -> Result<serde_json::Value, JsException> {
        let text = self.with(|ctx| {
            let run: Function = host_helpers(&ctx)
                .and_then(|h| h.get("run"))
                .map_err(|e| describe_error(&ctx, e))?;
            run.call::<_, Option<String>>((source,))
                .map_err(|e| describe_error(&ctx, e))
        })?;

        self.drain_jobs();

        Ok(text
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or(serde_json::Value::Null))
    }

    /// Run queued promise jobs until the queue is empty or an interrupt is raised.
    pub fn drain_jobs(&self) {
        while self.runtime.is_job_pending() {
            if self.interrupt.should_interrupt() {
                break;
            }
            let job = catch_unwind(AssertUnwindSafe(|| self.runtime.execute_pending_job()));
            match job {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => break,
                Ok(Err(_)) => {
                    tracing::debug!(sandbox_id = self.id, "promise job threw");
                }
                Err(panic) => {
                    self.healthy.store(false, Ordering::Release);
                    resume_unwind(panic);
                }
            }
        }
    }

    /// Return to the recorded baseline: drop queued jobs and strip added globals.
    pub fn reset(&mut self, bound: Duration) -> Result<(), SandboxError> {
        self.interrupt.advance_epoch();
        self.interrupt.arm(bound);
        self.drain_jobs();
        let pending = self.runtime.is_job_pending();

        let stripped = self.context.with(|ctx| -> Result<Vec<String>, SandboxError> {
            let strip: Function = host_helpers(&ctx)?.get("strip")?;
            strip
                .call(())
                .map_err(|e| SandboxError::Engine(describe_error(&ctx, e).to_string()))
        });
        self.interrupt.disarm();

        if pending {
            self.healthy.store(false, Ordering::Release);
            return Err(SandboxError::PendingJobs);
        }
        let leftover = stripped.inspect_err(|_| self.healthy.store(false, Ordering::Release))?;
        if !leftover.is_empty() {
            self.healthy.store(false, Ordering::Release);
            return Err(SandboxError::Dirty(leftover));
        }
        Ok(())
    }

    /// Evaluate a trivial expression under `bound`; failure marks the sandbox unhealthy.
    pub fn probe(&mut self, bound: Duration) -> bool {
        self.interrupt.advance_epoch();
        self.interrupt.arm(bound);
        let ok = self.context.with(|ctx| {
            ctx.eval::<i32, _>(PROBE_JS)
                .map(|v| v == PROBE_EXPECTED)
                .unwrap_or_else(|e| {
                    let _ = describe_error(&ctx, e);
                    false
                })
        });
        self.interrupt.disarm();
        self.healthy.store(ok, Ordering::Release);
        ok
    }
}
