//! Policy sandbox
//!
//! Runs hot-swappable policy scripts under a per-call deadline.
//!
//! A [`PolicyGeneration`] is the compiled form of one complete set of
//! scripts. Activation builds and validates the next generation off to the
//! side, then swaps a single `Arc`. Each worker thread keeps its own
//! interpreter and rebuilds it lazily the first time it runs a check after
//! a swap, by comparing its generation stamp with the active one.

mod engine;
pub mod loader;
pub mod tokenize;

pub use engine::{PluginHandle, TIMEOUT_CHECK_INTERVAL};
pub use loader::{
    load_scripts, reload_policies, PolicyWatcher, MAX_SCRIPT_BYTES, PLUGIN_DIR_NAME, RELOAD_DEBOUNCE,
    SCRIPT_EXTENSION,
};
pub use tokenize::sql_tokenize;

use crate::config::{ConfigStore, Settings};
use crate::context::RequestContext;
use crate::error::{RaspError, Result, ScriptFailure};
use crate::types::{Action, CheckRequest, DetectionType, Verdict, VerdictSource};
use engine::{build_engine, is_timeout, DeadlineGuard, LoadGuard, LoadPhase, Registration};
use rhai::{Dynamic, Engine, FnPtr, Scope, AST};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INTERPRETERS: RefCell<HashMap<u64, ThreadInterpreter>> = RefCell::new(HashMap::new());
}

/// One policy script as loaded from disk or supplied by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyScript {
    pub name: String,
    pub source: String,
}

impl PolicyScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Immutable, versioned set of compiled policy scripts
#[derive(Debug)]
pub struct PolicyGeneration {
    id: u64,
    scripts: Vec<PolicyScript>,
    asts: Vec<Arc<AST>>,
    /// Detection types with at least one handler
    handled: BTreeSet<DetectionType>,
    handler_count: usize,
}

impl PolicyGeneration {
    fn empty() -> Self {
        Self {
            id: 0,
            scripts: Vec::new(),
            asts: Vec::new(),
            handled: BTreeSet::new(),
            handler_count: 0,
        }
    }

    /// Monotonic generation id; 0 is the empty generation
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scripts(&self) -> &[PolicyScript] {
        &self.scripts
    }

    pub fn script_names(&self) -> Vec<&str> {
        self.scripts.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn handles(&self, detection_type: DetectionType) -> bool {
        self.handled.contains(&detection_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handler_count
    }
}

/// Outcome of running the handlers for one check
///
/// Verdicts returned before a failure or timeout are kept.
#[derive(Debug, Default)]
pub struct PolicyRun {
    pub verdicts: Vec<Verdict>,
    /// One entry per handler that errored, returned a malformed result or
    /// ran out of time
    pub failures: Vec<RaspError>,
}

impl PolicyRun {
    pub fn timed_out(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, RaspError::Timeout { .. }))
    }
}

struct Handler {
    plugin: String,
    script: usize,
    func: FnPtr,
}

/// A worker thread's private interpreter for one sandbox
struct ThreadInterpreter {
    stamp: u64,
    engine: Engine,
    asts: Vec<Arc<AST>>,
    handlers: HashMap<DetectionType, Vec<Handler>>,
}

impl ThreadInterpreter {
    fn run(&self, request: &CheckRequest<'_>, settings: &Settings) -> Result<PolicyRun> {
        let Some(handlers) = self.handlers.get(&request.detection_type) else {
            return Ok(PolicyRun::default());
        };

        let params = rhai::serde::to_dynamic(request.params.to_field_map(settings.plugin_max_stack))
            .map_err(|e| RaspError::Sandbox(e.to_string()))?;
        let context = rhai::serde::to_dynamic(script_context(request.request))
            .map_err(|e| RaspError::Sandbox(e.to_string()))?;

        let _deadline = DeadlineGuard::arm(settings.plugin_timeout_ms);
        let started = Instant::now();
        let mut run = PolicyRun::default();

        for handler in handlers {
            let Some(ast) = self.asts.get(handler.script) else {
                continue;
            };
            let result = handler
                .func
                .call::<Dynamic>(&self.engine, ast, (params.clone(), context.clone()));
            match result {
                Ok(value) => match parse_verdict(value, &handler.plugin) {
                    Ok(Some(verdict)) => run.verdicts.push(verdict),
                    Ok(None) => {}
                    Err(reason) => {
                        tracing::warn!(plugin = %handler.plugin, detection_type = %request.detection_type, reason = %reason, "Ignoring malformed policy result");
                        run.failures.push(RaspError::Script {
                            plugin: handler.plugin.clone(),
                            reason,
                        });
                    }
                },
                Err(e) if is_timeout(&e) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::warn!(plugin = %handler.plugin, detection_type = %request.detection_type, elapsed_ms, "Policy execution timed out");
                    // The deadline covers the whole call, so later handlers would fail too
                    run.failures.push(RaspError::Timeout { elapsed_ms });
                    break;
                }
                Err(e) => {
                    tracing::warn!(plugin = %handler.plugin, detection_type = %request.detection_type, error = %e, "Policy handler failed");
                    run.failures.push(RaspError::Script {
                        plugin: handler.plugin.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(run)
    }
}

/// Turn a handler's return value into a verdict
///
/// `()` means the handler has no opinion. Otherwise a map with optional
/// `action`, `message` and `confidence` entries is expected.
fn parse_verdict(value: Dynamic, plugin: &str) -> std::result::Result<Option<Verdict>, String> {
    if value.is_unit() {
        return Ok(None);
    }
    if !value.is_map() {
        return Err(format!("expected a map, got {}", value.type_name()));
    }
    let map: serde_json::Value = rhai::serde::from_dynamic(&value).map_err(|e| e.to_string())?;

    let action = match map.get("action") {
        None | Some(serde_json::Value::Null) => Action::Ignore,
        Some(serde_json::Value::String(s)) => s.parse::<Action>()?,
        Some(other) => return Err(format!("action must be a string, got {}", other)),
    };
    let message = match map.get("message") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let confidence = map
        .get("confidence")
        .and_then(serde_json::Value::as_f64)
        .map(|c| c.clamp(0.0, 100.0) as u8)
        .unwrap_or(0);

    Ok(Some(Verdict::new(
        action,
        message,
        confidence,
        VerdictSource::Plugin(plugin.to_string()),
    )))
}

/// Request details handed to handlers as their second argument
fn script_context(request: Option<&RequestContext>) -> serde_json::Value {
    let Some(ctx) = request else {
        return serde_json::json!({});
    };
    let req = ctx.request();
    let mut value = serde_json::json!({
        "request_id": ctx.id(),
        "method": req.method().map(|m| m.to_ascii_lowercase()),
        "url": req.request_url(),
        "path": req.request_uri(),
        "querystring": req.query_string(),
        "remote_addr": req.remote_addr(),
        "server_name": req.server_name(),
        "header": req.headers(),
        "body": String::from_utf8_lossy(ctx.body()),
    });
    if ctx.can_get_parameter() {
        value["parameter"] = serde_json::json!(ctx.parameters());
    }
    value
}

/// Holds the active policy generation and runs its handlers
pub struct PolicySandbox {
    id: u64,
    config: Arc<ConfigStore>,
    active: RwLock<Arc<PolicyGeneration>>,
    generations: AtomicU64,
    /// Serialises activations so generation ids go live in order
    activation: Mutex<()>,
}

impl PolicySandbox {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            id: NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed),
            config,
            active: RwLock::new(Arc::new(PolicyGeneration::empty())),
            generations: AtomicU64::new(0),
            activation: Mutex::new(()),
        }
    }

    /// The active generation
    pub fn current(&self) -> Arc<PolicyGeneration> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Compile, validate and atomically activate a new set of scripts
    ///
    /// Every script is compiled and its top level evaluated in a fresh
    /// engine. If any script fails the current generation stays active and
    /// all failures are returned. On success, `algorithm.config` is reset
    /// and the `config_set` calls made by the scripts are applied.
    pub fn activate(&self, scripts: Vec<PolicyScript>) -> Result<u64> {
        let _activation = self.activation.lock().unwrap_or_else(PoisonError::into_inner);
        let settings = self.config.snapshot();
        let engine = build_engine(Arc::clone(&self.config));
        let mut asts = Vec::with_capacity(scripts.len());
        let mut failures = Vec::new();

        let load = LoadGuard::begin(LoadPhase::Validate);
        for (idx, script) in scripts.iter().enumerate() {
            let mut ast = match engine.compile(&script.source) {
                Ok(ast) => ast,
                Err(e) => {
                    failures.push(ScriptFailure {
                        script: script.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            ast.set_source(script.name.as_str());

            load.set_script(idx);
            let _deadline = DeadlineGuard::arm(settings.plugin_timeout_ms);
            if let Err(e) = engine.run_ast_with_scope(&mut Scope::new(), &ast) {
                load.discard_script(idx);
                failures.push(ScriptFailure {
                    script: script.name.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            asts.push(Arc::new(ast));
        }
        let state = load.finish();

        if !failures.is_empty() {
            for failure in &failures {
                tracing::warn!(script = %failure.script, reason = %failure.reason, "Policy script rejected");
            }
            tracing::warn!(
                active_generation = self.current().id,
                "Policy activation rejected, keeping active generation"
            );
            return Err(RaspError::Activation { failures });
        }

        let mut updates = vec![("algorithm.config".to_string(), "{}".to_string())];
        updates.extend(state.deferred_config);
        self.config.set_many(&updates);

        let handled = state.registrations.iter().map(|r| r.detection_type).collect();
        let id = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::new(PolicyGeneration {
            id,
            scripts,
            asts,
            handled,
            handler_count: state.registrations.len(),
        });

        tracing::info!(
            generation = id,
            scripts = generation.scripts.len(),
            handlers = generation.handler_count,
            "Policy generation activated"
        );
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = generation;
        Ok(id)
    }

    /// Run every handler registered for the request's detection type
    ///
    /// Handlers run in registration order. A handler that errors yields no
    /// verdict. A timeout stops the remaining handlers; verdicts already
    /// returned are kept.
    pub fn invoke(&self, request: &CheckRequest<'_>) -> Result<PolicyRun> {
        let generation = self.current();
        if !generation.handles(request.detection_type) {
            return Ok(PolicyRun::default());
        }
        let settings = self.config.snapshot();

        // Taken out of the map so a nested call can never alias it
        let cached = INTERPRETERS.with(|map| map.borrow_mut().remove(&self.id));
        let interpreter = match cached {
            Some(interpreter) if interpreter.stamp == generation.id => interpreter,
            _ => self.build_interpreter(&generation, &settings),
        };

        let result = interpreter.run(request, &settings);
        INTERPRETERS.with(|map| map.borrow_mut().insert(self.id, interpreter));
        result
    }

    fn build_interpreter(&self, generation: &PolicyGeneration, settings: &Settings) -> ThreadInterpreter {
        let engine = build_engine(Arc::clone(&self.config));

        let load = LoadGuard::begin(LoadPhase::Rebuild);
        for (idx, ast) in generation.asts.iter().enumerate() {
            load.set_script(idx);
            let _deadline = DeadlineGuard::arm(settings.plugin_timeout_ms);
            if let Err(e) = engine.run_ast_with_scope(&mut Scope::new(), ast) {
                load.discard_script(idx);
                tracing::warn!(
                    script = ast.source().unwrap_or(""),
                    error = %e,
                    "Policy script failed while rebuilding thread interpreter"
                );
            }
        }
        let state = load.finish();

        let mut handlers: HashMap<DetectionType, Vec<Handler>> = HashMap::new();
        for Registration {
            plugin,
            detection_type,
            handler,
            script,
        } in state.registrations
        {
            handlers.entry(detection_type).or_default().push(Handler {
                plugin,
                script,
                func: handler,
            });
        }

        tracing::debug!(generation = generation.id, "Thread interpreter rebuilt");
        ThreadInterpreter {
            stamp: generation.id,
            engine,
            asts: generation.asts.clone(),
            handlers,
        }
    }
}

impl Drop for PolicySandbox {
    fn drop(&mut self) {
        // Only this thread's copy can be reached; others go with their threads
        let _ = INTERPRETERS.try_with(|map| {
            if let Ok(mut map) = map.try_borrow_mut() {
                map.remove(&self.id);
            }
        });
    }
}
