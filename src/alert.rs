//! Alert assembly and delivery
//!
//! An [`AlertRecord`] is built for every log or block verdict. It carries
//! the interception parameters, a trimmed call stack, the verdict and,
//! when the check ran inside a request, the request details. Records are
//! handed to an [`AlertSink`]; transport beyond that is up to the host.

use crate::config::ConfigStore;
use crate::context::RequestContext;
use crate::types::{Action, CheckRequest, DetectionType, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Frames whose symbol starts with one of these never reach an alert
const RUNTIME_FRAME_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "rhai::",
    "backtrace::",
    "<std::",
    "<core::",
    "<alloc::",
    "<rhai::",
    "__rust",
    "rust_begin_unwind",
    "__libc_start",
    "_start",
    "start_thread",
    "__clone",
];

const OWN_CRATE_PREFIX: &str = concat!(env!("CARGO_CRATE_NAME"), "::");
const OWN_CRATE_IMPL_PREFIX: &str = concat!("<", env!("CARGO_CRATE_NAME"), "::");

/// Structured description of one detected attack or policy violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    event_type: String,
    event_time: String,
    server_hostname: String,
    attack_type: DetectionType,
    attack_params: serde_json::Value,
    stack_trace: String,
    plugin_name: String,
    plugin_message: String,
    plugin_confidence: u8,
    intercept_state: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attack_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    referer: Option<String>,
}

impl AlertRecord {
    /// `"attack"`, or `"policy"` for baseline violations
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_time(&self) -> &str {
        &self.event_time
    }

    pub fn attack_type(&self) -> DetectionType {
        self.attack_type
    }

    pub fn attack_params(&self) -> &serde_json::Value {
        &self.attack_params
    }

    /// Frames, innermost first, one per line
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn plugin_message(&self) -> &str {
        &self.plugin_message
    }

    pub fn plugin_confidence(&self) -> u8 {
        self.plugin_confidence
    }

    pub fn intercept_state(&self) -> Action {
        self.intercept_state
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Replace the human-readable message before the record is sent
    pub fn with_plugin_message(mut self, message: impl Into<String>) -> Self {
        self.plugin_message = message.into();
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds alert records from verdicts
pub struct AlertAssembler {
    config: Arc<ConfigStore>,
    hostname: String,
}

impl AlertAssembler {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            hostname: detect_hostname(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Build the record for one verdict
    ///
    /// Never fails: fields the context cannot provide are left absent.
    pub fn assemble(&self, request: &CheckRequest<'_>, verdict: &Verdict) -> AlertRecord {
        let settings = self.config.snapshot();
        let max_stack = settings.log_max_stack;

        let frames = match request.params.host_stack() {
            Some(stack) => stack.iter().take(max_stack).cloned().collect(),
            None => capture_stack(max_stack),
        };

        let event_type = match request.detection_type {
            DetectionType::Policy => "policy",
            _ => "attack",
        };

        let mut record = AlertRecord {
            event_type: event_type.to_string(),
            event_time: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string(),
            server_hostname: self.hostname.clone(),
            attack_type: request.detection_type,
            attack_params: request.params.to_field_map(max_stack),
            stack_trace: frames.join("\n"),
            plugin_name: verdict.source.plugin_name(),
            plugin_message: verdict.message.clone(),
            plugin_confidence: verdict.confidence,
            intercept_state: verdict.action,
            request_id: None,
            attack_source: None,
            target: None,
            server_ip: None,
            url: None,
            path: None,
            body: None,
            user_agent: None,
            referer: None,
        };

        if let Some(ctx) = request.request {
            fill_request_fields(&mut record, ctx);
        }
        record
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn fill_request_fields(record: &mut AlertRecord, ctx: &RequestContext) {
    let req = ctx.request();
    record.request_id = Some(ctx.id().to_string());
    record.attack_source = non_empty(req.remote_addr());
    record.target = non_empty(req.server_name());
    record.server_ip = non_empty(req.local_addr());
    record.url = non_empty(req.request_url()).map(|url| match req.query_string() {
        Some(q) if !q.is_empty() => format!("{}?{}", url, q),
        _ => url,
    });
    record.path = non_empty(req.request_uri());
    record.body = (!ctx.body().is_empty()).then(|| String::from_utf8_lossy(ctx.body()).into_owned());
    record.user_agent = non_empty(req.header("user-agent"));
    record.referer = non_empty(req.header("referer"));
}

fn detect_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Stack of the current thread, trimmed to the host's own frames
pub fn capture_stack(max_frames: usize) -> Vec<String> {
    let backtrace = std::backtrace::Backtrace::force_capture();
    trim_frames(&backtrace.to_string(), max_frames)
}

/// Extract symbol names from rendered backtrace text
///
/// Drops frames of this crate, the standard library, the script runtime
/// and process start-up, then keeps at most `max_frames`.
pub fn trim_frames(rendered: &str, max_frames: usize) -> Vec<String> {
    rendered
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (index, symbol) = line.split_once(": ")?;
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(strip_hash(symbol.trim()))
        })
        .filter(|symbol| !is_internal_frame(symbol))
        .take(max_frames)
        .map(str::to_string)
        .collect()
}

fn strip_hash(symbol: &str) -> &str {
    match symbol.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit()) => head,
        _ => symbol,
    }
}

fn is_internal_frame(symbol: &str) -> bool {
    symbol == "<unknown>"
        || symbol.starts_with(OWN_CRATE_PREFIX)
        || symbol.starts_with(OWN_CRATE_IMPL_PREFIX)
        || RUNTIME_FRAME_PREFIXES.iter().any(|p| symbol.starts_with(p))
}

/// Destination for alert records
pub trait AlertSink: Send + Sync {
    fn emit(&self, record: &AlertRecord);
}

/// Writes each record as JSON on the `rasp::alarm` tracing target
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, record: &AlertRecord) {
        let json = match record.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize alert record");
                return;
            }
        };
        match record.intercept_state {
            Action::Block => tracing::warn!(
                target: "rasp::alarm",
                attack_type = %record.attack_type,
                intercept_state = %record.intercept_state,
                "{}",
                json
            ),
            _ => tracing::info!(
                target: "rasp::alarm",
                attack_type = %record.attack_type,
                intercept_state = %record.intercept_state,
                "{}",
                json
            ),
        }
    }
}

/// Bounded in-memory sink
#[derive(Debug)]
pub struct MemoryAlertSink {
    records: Mutex<VecDeque<AlertRecord>>,
    capacity: usize,
}

impl MemoryAlertSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Retained records, oldest first
    pub fn records(&self) -> Vec<AlertRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AlertRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryAlertSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl AlertSink for MemoryAlertSink {
    fn emit(&self, record: &AlertRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::FakeRequest;
    use crate::types::{CheckParams, VerdictSource};

    fn assembler() -> AlertAssembler {
        AlertAssembler::new(Arc::new(ConfigStore::in_memory()))
    }

    fn block_verdict() -> Verdict {
        Verdict::new(
            Action::Block,
            "Reading /etc/passwd",
            100,
            VerdictSource::Plugin("passwd".to_string()),
        )
    }

    #[test]
    fn test_hostname_comes_from_the_os() {
        let expected = hostname::get()
            .map(|h| h.to_string_lossy().trim().to_string())
            .unwrap_or_default();
        let assembler = assembler();
        if expected.is_empty() {
            assert_eq!(assembler.hostname(), "unknown");
        } else {
            assert_eq!(assembler.hostname(), expected);
        }

        let request = CheckRequest::new(CheckParams::file_read("/etc/passwd"), None);
        let record = assembler.assemble(&request, &block_verdict());
        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["server_hostname"], assembler.hostname());
    }

    #[test]
    fn test_record_without_request() {
        let request = CheckRequest::new(CheckParams::file_read("/etc/passwd"), None);
        let record = assembler().assemble(&request, &block_verdict());

        assert_eq!(record.event_type(), "attack");
        assert_eq!(record.attack_type(), DetectionType::FileRead);
        assert_eq!(record.attack_params()["path"], "/etc/passwd");
        assert_eq!(record.plugin_name(), "passwd");
        assert_eq!(record.intercept_state(), Action::Block);
        assert!(record.request_id().is_none());

        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["attack_type"], "file-read");
        assert_eq!(json["intercept_state"], "block");
        assert!(json.get("request_id").is_none());
        assert!(json.get("user_agent").is_none());
    }

    #[test]
    fn test_record_with_request() {
        let mut req = FakeRequest::get("/download");
        req.query = Some("file=../../etc/passwd".to_string());
        req.headers
            .insert("user-agent".to_string(), "curl/8.0".to_string());
        let mut ctx = RequestContext::new(Box::new(req), None, 64);
        ctx.append_body(b"a=1");

        let request = CheckRequest::new(CheckParams::file_read("/etc/passwd"), Some(&ctx));
        let record = assembler().assemble(&request, &block_verdict());

        assert_eq!(record.request_id(), Some(ctx.id()));
        assert_eq!(
            record.url(),
            Some("http://localhost/download?file=../../etc/passwd")
        );
        assert_eq!(record.body(), Some("a=1"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["attack_source"], "10.0.0.7");
        assert_eq!(json["server_ip"], "10.0.0.1");
        assert_eq!(json["user_agent"], "curl/8.0");
        assert!(json.get("referer").is_none());
    }

    #[test]
    fn test_policy_event_type() {
        let request = CheckRequest::new(
            CheckParams::Policy {
                policy_id: 3002,
                message: "default password".to_string(),
                details: serde_json::Map::new(),
            },
            None,
        );
        let verdict = Verdict::new(Action::Log, "m", 100, VerdictSource::Builtin("security_policy".into()));
        let record = assembler().assemble(&request, &verdict);
        assert_eq!(record.event_type(), "policy");
        assert_eq!(record.plugin_name(), "builtin.security_policy");
    }

    #[test]
    fn test_host_stack_takes_precedence_and_is_capped() {
        let config = Arc::new(ConfigStore::in_memory());
        config.set("log.maxstack", "2");
        let request = CheckRequest::new(
            CheckParams::Command {
                command: "whoami".to_string(),
                stack: vec!["a.A.run".into(), "b.B.call".into(), "c.C.main".into()],
            },
            None,
        );
        let record = AlertAssembler::new(config).assemble(&request, &block_verdict());
        assert_eq!(record.stack_trace(), "a.A.run\nb.B.call");
        assert_eq!(record.attack_params()["stack"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_plugin_message_override() {
        let request = CheckRequest::new(CheckParams::file_read("/x"), None);
        let record = assembler()
            .assemble(&request, &block_verdict())
            .with_plugin_message("custom");
        assert_eq!(record.plugin_message(), "custom");
    }

    #[test]
    fn test_trim_frames() {
        let rendered = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/library/std/src/backtrace.rs:312:9
   1: a3s_rasp::alert::capture_stack::h0123456789abcdef
   2: <a3s_rasp::guard::Guard>::check
   3: rhai::eval::stmt::eval_stmt
   4: myapp::files::read_config::h0123456789abcdef
             at ./src/files.rs:10:5
   5: myapp::main
   6: core::ops::function::FnOnce::call_once
   7: <unknown>
   8: __libc_start_main
";
        assert_eq!(
            trim_frames(rendered, 10),
            vec!["myapp::files::read_config", "myapp::main"]
        );
        assert_eq!(trim_frames(rendered, 1), vec!["myapp::files::read_config"]);
        assert!(trim_frames(rendered, 0).is_empty());
    }

    #[test]
    fn test_memory_sink_is_bounded() {
        let sink = MemoryAlertSink::new(2);
        let request = CheckRequest::new(CheckParams::file_read("/x"), None);
        let assembler = assembler();
        for msg in ["one", "two", "three"] {
            sink.emit(&assembler.assemble(&request, &block_verdict()).with_plugin_message(msg));
        }
        let messages: Vec<_> = sink
            .records()
            .iter()
            .map(|r| r.plugin_message().to_string())
            .collect();
        assert_eq!(messages, vec!["two", "three"]);
    }
}
