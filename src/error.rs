//! Error types for a3s-rasp

use crate::types::DetectionType;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur inside the detection core
///
/// None of these ever escape [`Guard::check`](crate::guard::Guard::check):
/// detection failures are logged and treated as "no verdict". The only
/// outcome that reaches the framework adapter is [`SecurityBlock`].
#[derive(Debug, Error)]
pub enum RaspError {
    /// Generic configuration failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// A recognised setting was given a value that cannot be coerced
    #[error("Invalid value for '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    /// A setting key that the store does not recognise
    #[error("Unknown configuration key: {0}")]
    UnknownSetting(String),

    /// Filesystem failure
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A directory could not be watched for changes
    #[error("Failed to watch {}: {reason}", path.display())]
    Watch { path: PathBuf, reason: String },

    /// A policy script failed to parse
    #[error("Failed to compile policy script '{script}': {reason}")]
    Compile { script: String, reason: String },

    /// A policy generation was rejected; the previous one stays active
    #[error("Policy activation rejected: {} script(s) failed", failures.len())]
    Activation { failures: Vec<ScriptFailure> },

    /// A policy handler raised an error
    #[error("Policy script error in '{plugin}': {reason}")]
    Script { plugin: String, reason: String },

    /// Script evaluation exceeded the configured deadline
    #[error("Policy execution timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Interpreter-level failure that is not attributable to one script
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RaspError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for detection-core operations
pub type Result<T> = std::result::Result<T, RaspError>;

/// One script that failed while a policy generation was being built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    /// Script name (file name for scripts loaded from disk)
    pub script: String,
    /// Compiler or evaluator message
    pub reason: String,
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.script, self.reason)
    }
}

/// The request was blocked by a detection verdict
///
/// Returned from [`Guard::check`](crate::guard::Guard::check) after the
/// block page has been written to the response. Framework adapters turn it
/// into an aborted request.
#[derive(Debug, Clone, Error)]
#[error("Request blocked by a3s-rasp ({detection_type}): {message}")]
pub struct SecurityBlock {
    /// Id of the blocked request, if the check ran inside one
    pub request_id: Option<String>,
    /// The kind of operation that was blocked
    pub detection_type: DetectionType,
    /// Name of the detector that returned the blocking verdict
    pub plugin: String,
    /// Message from the blocking verdict
    pub message: String,
}
