//! Core detection types
//!
//! Detection types, per-type check parameters, verdicts and the aggregate
//! outcome of one detection pass. Wire names are kebab-case for detection
//! types and snake_case for fields.

use crate::context::RequestContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Category of sensitive operation being checked
///
/// Closed set: policy scripts register handlers by these names and a
/// registration for any other name is rejected when the script loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionType {
    /// A tracked HTTP request started
    RequestEntry,
    /// SQL statement about to execute
    SqlQuery,
    /// SQL result set exceeded the slow-query row threshold
    SqlSlowQuery,
    /// Outbound request to a URL (server-side request forgery)
    Ssrf,
    /// Directory listing
    DirectoryList,
    /// File read
    FileRead,
    /// File write
    FileWrite,
    /// Multipart file upload
    FileUpload,
    /// File rename or move
    FileRename,
    /// Dynamic include of a file or URL
    Include,
    /// WebDAV copy/move
    Webdav,
    /// OS command execution
    Command,
    /// XML external entity resolution
    Xxe,
    /// OGNL expression evaluation
    Ognl,
    /// Object deserialization
    Deserialization,
    /// Reflective method invocation
    Reflection,
    /// Server security baseline check
    Policy,
}

impl DetectionType {
    /// Every detection type, in declaration order
    pub const ALL: [DetectionType; 17] = [
        DetectionType::RequestEntry,
        DetectionType::SqlQuery,
        DetectionType::SqlSlowQuery,
        DetectionType::Ssrf,
        DetectionType::DirectoryList,
        DetectionType::FileRead,
        DetectionType::FileWrite,
        DetectionType::FileUpload,
        DetectionType::FileRename,
        DetectionType::Include,
        DetectionType::Webdav,
        DetectionType::Command,
        DetectionType::Xxe,
        DetectionType::Ognl,
        DetectionType::Deserialization,
        DetectionType::Reflection,
        DetectionType::Policy,
    ];

    /// Wire name (`file-read`, `sql-query`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::RequestEntry => "request-entry",
            DetectionType::SqlQuery => "sql-query",
            DetectionType::SqlSlowQuery => "sql-slow-query",
            DetectionType::Ssrf => "ssrf",
            DetectionType::DirectoryList => "directory-list",
            DetectionType::FileRead => "file-read",
            DetectionType::FileWrite => "file-write",
            DetectionType::FileUpload => "file-upload",
            DetectionType::FileRename => "file-rename",
            DetectionType::Include => "include",
            DetectionType::Webdav => "webdav",
            DetectionType::Command => "command",
            DetectionType::Xxe => "xxe",
            DetectionType::Ognl => "ognl",
            DetectionType::Deserialization => "deserialization",
            DetectionType::Reflection => "reflection",
            DetectionType::Policy => "policy",
        }
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown detection type '{}'", s))
    }
}

/// Parameters of one interception, one variant per [`DetectionType`]
///
/// Each variant carries exactly the fields that its detectors inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CheckParams {
    RequestEntry,
    SqlQuery {
        server: String,
        query: String,
    },
    SqlSlowQuery {
        server: String,
        query: String,
        row_count: u64,
    },
    Ssrf {
        url: String,
        hostname: String,
        #[serde(default)]
        ip: Vec<String>,
    },
    DirectoryList {
        path: String,
        realpath: String,
    },
    FileRead {
        path: String,
        realpath: String,
    },
    FileWrite {
        path: String,
        realpath: String,
        content: String,
    },
    FileUpload {
        filename: String,
        content: String,
    },
    FileRename {
        source: String,
        dest: String,
    },
    Include {
        url: String,
        function: String,
        realpath: String,
    },
    Webdav {
        source: String,
        dest: String,
    },
    Command {
        command: String,
        #[serde(default)]
        stack: Vec<String>,
    },
    Xxe {
        entity: String,
    },
    Ognl {
        expression: String,
    },
    Deserialization {
        class_name: String,
    },
    Reflection {
        class_name: String,
        method: String,
        #[serde(default)]
        stack: Vec<String>,
    },
    Policy {
        policy_id: u32,
        message: String,
        #[serde(default)]
        details: serde_json::Map<String, serde_json::Value>,
    },
}

impl CheckParams {
    /// Shorthand for a file-read interception where path and realpath agree
    pub fn file_read(path: impl Into<String>) -> Self {
        let path = path.into();
        CheckParams::FileRead {
            realpath: path.clone(),
            path,
        }
    }

    /// Shorthand for a SQL interception
    pub fn sql(server: impl Into<String>, query: impl Into<String>) -> Self {
        CheckParams::SqlQuery {
            server: server.into(),
            query: query.into(),
        }
    }

    /// The detection type these parameters belong to
    pub fn detection_type(&self) -> DetectionType {
        match self {
            CheckParams::RequestEntry => DetectionType::RequestEntry,
            CheckParams::SqlQuery { .. } => DetectionType::SqlQuery,
            CheckParams::SqlSlowQuery { .. } => DetectionType::SqlSlowQuery,
            CheckParams::Ssrf { .. } => DetectionType::Ssrf,
            CheckParams::DirectoryList { .. } => DetectionType::DirectoryList,
            CheckParams::FileRead { .. } => DetectionType::FileRead,
            CheckParams::FileWrite { .. } => DetectionType::FileWrite,
            CheckParams::FileUpload { .. } => DetectionType::FileUpload,
            CheckParams::FileRename { .. } => DetectionType::FileRename,
            CheckParams::Include { .. } => DetectionType::Include,
            CheckParams::Webdav { .. } => DetectionType::Webdav,
            CheckParams::Command { .. } => DetectionType::Command,
            CheckParams::Xxe { .. } => DetectionType::Xxe,
            CheckParams::Ognl { .. } => DetectionType::Ognl,
            CheckParams::Deserialization { .. } => DetectionType::Deserialization,
            CheckParams::Reflection { .. } => DetectionType::Reflection,
            CheckParams::Policy { .. } => DetectionType::Policy,
        }
    }

    /// Call stack captured by the interception layer, when it supplies one
    pub fn host_stack(&self) -> Option<&[String]> {
        match self {
            CheckParams::Command { stack, .. } | CheckParams::Reflection { stack, .. }
                if !stack.is_empty() =>
            {
                Some(stack)
            }
            _ => None,
        }
    }

    /// Field map without the variant tag, as seen by policy scripts and
    /// alert records
    ///
    /// Host stacks are cut to `max_stack` frames.
    pub fn to_field_map(&self, max_stack: usize) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        match value.as_object_mut() {
            Some(map) => {
                map.remove("type");
                if let Some(serde_json::Value::Array(frames)) = map.get_mut("stack") {
                    frames.truncate(max_stack);
                }
                value
            }
            None => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// What a check wants done with the operation
///
/// Ordered so that the aggregate of several verdicts is their maximum.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Ignore,
    Log,
    Block,
}

impl Action {
    /// block if any block, else log if any log, else ignore
    pub fn aggregate<I: IntoIterator<Item = Action>>(actions: I) -> Action {
        actions.into_iter().max().unwrap_or(Action::Ignore)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ignore => "ignore",
            Action::Log => "log",
            Action::Block => "block",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Action::Ignore),
            "log" => Ok(Action::Log),
            "block" => Ok(Action::Block),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Which detector produced a verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum VerdictSource {
    /// Compiled-in check, by check name
    Builtin(String),
    /// Policy script, by plugin name
    Plugin(String),
}

impl VerdictSource {
    /// Name reported as `plugin_name` in alert records
    pub fn plugin_name(&self) -> String {
        match self {
            VerdictSource::Builtin(name) => format!("builtin.{}", name),
            VerdictSource::Plugin(name) => name.clone(),
        }
    }
}

/// A single check's opinion about one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    pub message: String,
    /// 0–100
    pub confidence: u8,
    pub source: VerdictSource,
}

impl Verdict {
    /// Create a verdict, clamping confidence into 0–100
    pub fn new(
        action: Action,
        message: impl Into<String>,
        confidence: u8,
        source: VerdictSource,
    ) -> Self {
        Self {
            action,
            message: message.into(),
            confidence: confidence.min(100),
            source,
        }
    }

    pub fn blocked(&self) -> bool {
        self.action == Action::Block
    }
}

/// One interception, ready to be run through the detection pipeline
#[derive(Debug)]
pub struct CheckRequest<'a> {
    pub detection_type: DetectionType,
    pub params: CheckParams,
    pub created_at: DateTime<Utc>,
    /// The request being serviced by this thread, if any
    pub request: Option<&'a RequestContext>,
}

impl<'a> CheckRequest<'a> {
    pub fn new(params: CheckParams, request: Option<&'a RequestContext>) -> Self {
        Self {
            detection_type: params.detection_type(),
            params,
            created_at: Utc::now(),
            request,
        }
    }

    /// Request id of the originating request, if any
    pub fn request_id(&self) -> Option<&str> {
        self.request.map(|r| r.id())
    }
}

/// Aggregated result of running every check for one [`CheckRequest`]
///
/// Keeps every contributing verdict so alerting can report each detector
/// that fired, not only the blocking one.
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub detection_type: DetectionType,
    pub verdicts: Vec<Verdict>,
    /// Checks that raised an error or timed out and so produced no verdict
    pub failures: usize,
    pub elapsed: Duration,
}

impl DetectionOutcome {
    pub fn empty(detection_type: DetectionType) -> Self {
        Self {
            detection_type,
            verdicts: Vec::new(),
            failures: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Aggregate action over all verdicts
    pub fn action(&self) -> Action {
        Action::aggregate(self.verdicts.iter().map(|v| v.action))
    }

    pub fn is_blocked(&self) -> bool {
        self.action() == Action::Block
    }

    /// First blocking verdict, if any
    pub fn blocking(&self) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.blocked())
    }

    /// Verdicts that should produce an alert record (log or block)
    pub fn reportable(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| v.action != Action::Ignore)
    }
}
