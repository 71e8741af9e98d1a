//! # a3s-rasp
//!
//! In-process runtime application self-protection for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-rasp` sits between a host application and its sensitive operations
//! (SQL execution, file access, command spawning, outbound requests,
//! deserialization, ...). The host's interception layer describes each
//! operation as [`CheckParams`] and asks the agent for a decision. Built-in
//! checks and hot-reloadable policy scripts produce [`Verdict`]s; blocking
//! verdicts abort the operation and replace the response with a block page,
//! while every log or block verdict is reported as an [`AlertRecord`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_rasp::{Agent, AgentOptions, CheckParams};
//!
//! # fn example() -> a3s_rasp::Result<()> {
//! let agent = Agent::start("/opt/rasp", AgentOptions::default())?;
//!
//! // Inside the host's file-read hook
//! match agent.check(CheckParams::file_read("/etc/passwd")) {
//!     Ok(_) => { /* proceed with the read */ }
//!     Err(block) => eprintln!("blocked: {}", block),
//! }
//!
//! agent.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Policy scripts
//!
//! Scripts live in `<base>/plugins/*.rhai` and register handlers per
//! detection type:
//!
//! ```text
//! let p = plugin("file-guard");
//! p.register("file-read", |params, context| {
//!     if params.realpath == "/etc/passwd" {
//!         #{ action: "block", message: "sensitive file", confidence: 90 }
//!     }
//! });
//! ```
//!
//! ## Architecture
//!
//! - **Agent**: process-wide context, owns everything below
//! - **Guard**: request lifecycle, thread-local enablement and shielding
//! - **Dispatcher**: built-in checks then policy handlers, verdict aggregation
//! - **PolicySandbox**: script generations with atomic activation and timeouts
//! - **ConfigStore**: hot-reloaded `rasp.properties` settings
//! - **FileMonitor**: directory watching with create/change/delete callbacks

pub mod agent;
pub mod alert;
pub mod checks;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod logging;
pub mod monitor;
pub mod response;
pub mod sandbox;
pub mod types;

// Re-export core types
pub use agent::{Agent, AgentOptions};
pub use alert::{AlertAssembler, AlertRecord, AlertSink, MemoryAlertSink, TracingAlertSink};
pub use checks::{default_checks, BuiltinCheck, SecurityPolicyCheck, SlowQueryCheck};
pub use config::{ConfigKey, ConfigStore, Settings};
pub use context::{HttpRequest, HttpResponse, RequestContext};
pub use dispatch::Dispatcher;
pub use error::{RaspError, Result, ScriptFailure, SecurityBlock};
pub use guard::{shield, Disposition, Guard, ShieldGuard};
pub use monitor::{Debouncer, FileListener, FileMonitor, WatchHandle};
pub use response::{BlockResponder, CustomBlockPage};
pub use sandbox::{PolicyGeneration, PolicyRun, PolicySandbox, PolicyScript, PolicyWatcher};
pub use types::{
    Action, CheckParams, CheckRequest, DetectionOutcome, DetectionType, Verdict, VerdictSource,
};
