//! Rhai engine construction and the script-facing API
//!
//! Scripts see:
//!
//! ```text
//! let p = plugin("demo");
//! p.register("file-read", |params, context| {
//!     if params.realpath == "/etc/passwd" {
//!         return #{ action: "block", message: "read of passwd", confidence: 100 };
//!     }
//! });
//! config_set("block.status_code", 403);
//! let tokens = sql_tokenize("select 1");
//! let tuning = algorithm_config();
//! ```
//!
//! `register` is only accepted while a generation is loading. The
//! registrations it records land in a thread-local [`LoadState`] that the
//! sandbox collects once every script has run.

use crate::config::ConfigStore;
use crate::types::DetectionType;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::tokenize::sql_tokenize;

/// Operations between two deadline checks
pub const TIMEOUT_CHECK_INTERVAL: u64 = 10_000;

const MAX_CALL_LEVELS: usize = 48;
const MAX_EXPR_DEPTH: usize = 128;
const MAX_FN_EXPR_DEPTH: usize = 64;
const MAX_STRING_SIZE: usize = 4 * 1024 * 1024;
const MAX_ARRAY_SIZE: usize = 100_000;
const MAX_MAP_SIZE: usize = 100_000;

/// Marker value returned from the progress hook when the deadline passes
const TIMEOUT_TOKEN: &str = "a3s-rasp:timeout";

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
    static LOAD: RefCell<Option<LoadState>> = const { RefCell::new(None) };
}

/// Handle returned by `plugin(name)` in scripts
#[derive(Debug, Clone)]
pub struct PluginHandle {
    name: String,
}

/// One `register` call recorded while loading
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub plugin: String,
    pub detection_type: DetectionType,
    pub handler: FnPtr,
    pub script: usize,
}

/// What loading is being done for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadPhase {
    /// First evaluation of a candidate generation; `config_set` is
    /// validated and deferred until the generation activates
    Validate,
    /// Per-thread re-evaluation of an already active generation;
    /// `config_set` was applied at activation and is not repeated
    Rebuild,
}

#[derive(Debug, Default)]
pub(crate) struct LoadState {
    pub phase: Option<LoadPhase>,
    pub script: usize,
    pub registrations: Vec<Registration>,
    pub deferred_config: Vec<(String, String)>,
}

/// Marks the current thread as loading scripts until dropped
pub(crate) struct LoadGuard;

impl LoadGuard {
    pub fn begin(phase: LoadPhase) -> Self {
        LOAD.with(|load| {
            *load.borrow_mut() = Some(LoadState {
                phase: Some(phase),
                ..Default::default()
            })
        });
        LoadGuard
    }

    /// Index of the script whose top level is about to run
    pub fn set_script(&self, script: usize) {
        LOAD.with(|load| {
            if let Some(state) = load.borrow_mut().as_mut() {
                state.script = script;
            }
        });
    }

    /// Drop registrations made by a script that failed part way
    pub fn discard_script(&self, script: usize) {
        LOAD.with(|load| {
            if let Some(state) = load.borrow_mut().as_mut() {
                state.registrations.retain(|r| r.script != script);
            }
        });
    }

    pub fn finish(self) -> LoadState {
        LOAD.with(|load| load.borrow_mut().take()).unwrap_or_default()
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        LOAD.with(|load| load.borrow_mut().take());
    }
}

fn load_phase() -> Option<LoadPhase> {
    LOAD.with(|load| load.borrow().as_ref().and_then(|s| s.phase))
}

/// Arms the evaluation deadline for the current thread until dropped
pub(crate) struct DeadlineGuard {
    previous: Option<Instant>,
}

impl DeadlineGuard {
    /// `timeout_ms == 0` disables the deadline
    pub fn arm(timeout_ms: u64) -> Self {
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let previous = DEADLINE.with(|d| d.replace(deadline));
        Self { previous }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        DEADLINE.with(|d| d.set(self.previous));
    }
}

/// Whether `err` (possibly wrapped in call frames) came from the deadline
pub(crate) fn is_timeout(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_timeout(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => is_timeout(inner),
        _ => false,
    }
}

/// Build a locked-down engine bound to `config`
pub(crate) fn build_engine(config: Arc<ConfigStore>) -> Engine {
    let mut engine = Engine::new();

    engine
        .set_max_call_levels(MAX_CALL_LEVELS)
        .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH)
        .set_max_string_size(MAX_STRING_SIZE)
        .set_max_array_size(MAX_ARRAY_SIZE)
        .set_max_map_size(MAX_MAP_SIZE)
        .set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new())
        .disable_symbol("eval");

    engine.on_progress(|ops| {
        if ops % TIMEOUT_CHECK_INTERVAL != 0 {
            return None;
        }
        let expired = DEADLINE.with(|d| d.get().is_some_and(|deadline| Instant::now() >= deadline));
        expired.then(|| Dynamic::from(TIMEOUT_TOKEN))
    });

    engine.on_print(|text| tracing::info!(target: "rasp::plugin", "{}", text));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "rasp::plugin", source = source.unwrap_or(""), position = %pos, "{}", text)
    });

    engine
        .register_type_with_name::<PluginHandle>("Plugin")
        .register_fn("plugin", |name: &str| PluginHandle {
            name: name.to_string(),
        })
        .register_get("name", |p: &mut PluginHandle| p.name.clone())
        .register_fn("register", register_handler)
        .register_fn("sql_tokenize", |query: &str| -> rhai::Array {
            sql_tokenize(query).into_iter().map(Dynamic::from).collect()
        })
        .register_fn("get_jsengine", || "rhai".to_string());

    let store = Arc::clone(&config);
    engine.register_fn("config_set", move |key: &str, value: Dynamic| -> bool {
        config_set(&store, key, value)
    });

    let store = config;
    engine.register_fn("algorithm_config", move || -> Dynamic {
        rhai::serde::to_dynamic(&store.snapshot().algorithm_config).unwrap_or(Dynamic::UNIT)
    });

    engine
}

fn register_handler(
    plugin: &mut PluginHandle,
    kind: &str,
    handler: FnPtr,
) -> Result<(), Box<EvalAltResult>> {
    let detection_type: DetectionType = kind.parse().map_err(|e: String| -> Box<EvalAltResult> { e.into() })?;

    LOAD.with(|load| -> Result<(), Box<EvalAltResult>> {
        let mut load = load.borrow_mut();
        let state = load
            .as_mut()
            .filter(|s| s.phase.is_some())
            .ok_or_else(|| -> Box<EvalAltResult> { "handlers can only be registered while policies load".into() })?;
        let script = state.script;
        state.registrations.push(Registration {
            plugin: plugin.name.clone(),
            detection_type,
            handler,
            script,
        });
        Ok(())
    })
}

/// Coerce a script value into the property-file form of a setting
fn setting_text(value: &Dynamic) -> Option<String> {
    if value.is_string() {
        return value.clone().into_string().ok();
    }
    if value.is_map() || value.is_array() {
        return rhai::serde::from_dynamic::<serde_json::Value>(value)
            .ok()
            .map(|v| v.to_string());
    }
    if value.is_unit() {
        return None;
    }
    Some(value.to_string())
}

fn config_set(store: &ConfigStore, key: &str, value: Dynamic) -> bool {
    let Some(text) = setting_text(&value) else {
        tracing::info!(key = %key, "config_set called without a usable value");
        return false;
    };

    match load_phase() {
        Some(LoadPhase::Validate) => match store.check(key, &text) {
            Ok(()) => {
                LOAD.with(|load| {
                    if let Some(state) = load.borrow_mut().as_mut() {
                        state.deferred_config.push((key.to_string(), text));
                    }
                });
                true
            }
            Err(e) => {
                tracing::info!(key = %key, error = %e, "config_set rejected");
                false
            }
        },
        Some(LoadPhase::Rebuild) => store.check(key, &text).is_ok(),
        None => store.set(key, &text),
    }
}
