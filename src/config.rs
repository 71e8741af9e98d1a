//! Hot-reloadable agent settings
//!
//! Settings live in a Java-style properties file (`conf/rasp.properties`).
//! Readers take an `Arc<Settings>` snapshot; every write builds a complete
//! replacement off to the side and swaps the `Arc`, so a reader never sees
//! a half-applied reload.

use crate::error::{RaspError, Result};
use crate::monitor::FileListener;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Directory under the agent base dir holding the settings file
pub const CONFIG_DIR_NAME: &str = "conf";

/// Settings file name
pub const CONFIG_FILE_NAME: &str = "rasp.properties";

const DEFAULT_BLOCK_URL: &str = "https://rasp.baidu.com/blocked";
const DEFAULT_BLOCK_STATUS: u16 = 302;

/// Every recognised setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    PluginTimeoutMillis,
    HooksIgnore,
    BlockUrl,
    InjectUrlPrefix,
    BodyMaxBytes,
    LogMaxStack,
    PluginMaxStack,
    EnforcePolicy,
    OgnlMinLength,
    SqlSlowQueryMinRows,
    BlockStatusCode,
    DebugLevel,
    AlgorithmConfig,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 13] = [
        ConfigKey::PluginTimeoutMillis,
        ConfigKey::HooksIgnore,
        ConfigKey::BlockUrl,
        ConfigKey::InjectUrlPrefix,
        ConfigKey::BodyMaxBytes,
        ConfigKey::LogMaxStack,
        ConfigKey::PluginMaxStack,
        ConfigKey::EnforcePolicy,
        ConfigKey::OgnlMinLength,
        ConfigKey::SqlSlowQueryMinRows,
        ConfigKey::BlockStatusCode,
        ConfigKey::DebugLevel,
        ConfigKey::AlgorithmConfig,
    ];

    /// Property name
    pub fn key(&self) -> &'static str {
        match self {
            ConfigKey::PluginTimeoutMillis => "plugin.timeout.millis",
            ConfigKey::HooksIgnore => "hooks.ignore",
            ConfigKey::BlockUrl => "block.url",
            ConfigKey::InjectUrlPrefix => "inject.urlprefix",
            ConfigKey::BodyMaxBytes => "body.maxbytes",
            ConfigKey::LogMaxStack => "log.maxstack",
            ConfigKey::PluginMaxStack => "plugin.maxstack",
            ConfigKey::EnforcePolicy => "security.enforce_policy",
            ConfigKey::OgnlMinLength => "ognl.expression.minlength",
            ConfigKey::SqlSlowQueryMinRows => "sql.slowquery.min_rows",
            ConfigKey::BlockStatusCode => "block.status_code",
            ConfigKey::DebugLevel => "debug.level",
            ConfigKey::AlgorithmConfig => "algorithm.config",
        }
    }

    /// Built-in default, in property-file form
    pub fn default_value(&self) -> &'static str {
        match self {
            ConfigKey::PluginTimeoutMillis => "100",
            ConfigKey::HooksIgnore => "",
            ConfigKey::BlockUrl => DEFAULT_BLOCK_URL,
            ConfigKey::InjectUrlPrefix => "",
            ConfigKey::BodyMaxBytes => "4096",
            ConfigKey::LogMaxStack => "20",
            ConfigKey::PluginMaxStack => "100",
            ConfigKey::EnforcePolicy => "false",
            ConfigKey::OgnlMinLength => "30",
            ConfigKey::SqlSlowQueryMinRows => "500",
            ConfigKey::BlockStatusCode => "302",
            ConfigKey::DebugLevel => "0",
            ConfigKey::AlgorithmConfig => "{}",
        }
    }

    /// Whether the key is read from the settings file
    ///
    /// `algorithm.config` is owned by policy scripts and only set through
    /// [`ConfigStore::set`].
    pub fn from_file(&self) -> bool {
        !matches!(self, ConfigKey::AlgorithmConfig)
    }

    pub fn parse(key: &str) -> Option<ConfigKey> {
        ConfigKey::ALL.iter().copied().find(|k| k.key() == key)
    }
}

/// Immutable snapshot of every setting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Script evaluation deadline; 0 disables it
    pub plugin_timeout_ms: u64,
    /// Detection type names whose checks are skipped
    pub ignore_hooks: Vec<String>,
    pub block_url: String,
    /// Responses to URLs under this prefix get the custom fragment
    /// appended; empty disables injection
    pub inject_url_prefix: String,
    pub body_max_bytes: usize,
    /// Frames kept in alert stack traces
    pub log_max_stack: usize,
    /// Frames handed to policy scripts
    pub plugin_max_stack: usize,
    pub enforce_policy: bool,
    pub ognl_min_length: usize,
    pub sql_slow_query_min_rows: u64,
    pub block_status_code: u16,
    pub debug_level: u32,
    pub algorithm_config: serde_json::Value,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plugin_timeout_ms: 100,
            ignore_hooks: Vec::new(),
            block_url: DEFAULT_BLOCK_URL.to_string(),
            inject_url_prefix: String::new(),
            body_max_bytes: 4096,
            log_max_stack: 20,
            plugin_max_stack: 100,
            enforce_policy: false,
            ognl_min_length: 30,
            sql_slow_query_min_rows: 500,
            block_status_code: DEFAULT_BLOCK_STATUS,
            debug_level: 0,
            algorithm_config: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl Settings {
    /// Coerce, clamp and store one value
    ///
    /// Leaves `self` untouched when the value cannot be coerced.
    pub fn apply(&mut self, key: ConfigKey, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            ConfigKey::PluginTimeoutMillis => {
                self.plugin_timeout_ms = non_negative(key, value)?;
            }
            ConfigKey::HooksIgnore => {
                self.ignore_hooks = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            ConfigKey::BlockUrl => {
                self.block_url = if value.is_empty() {
                    DEFAULT_BLOCK_URL.to_string()
                } else {
                    value.to_string()
                };
            }
            ConfigKey::InjectUrlPrefix => {
                self.inject_url_prefix = value.trim_end_matches('/').to_string();
            }
            ConfigKey::BodyMaxBytes => self.body_max_bytes = non_negative(key, value)? as usize,
            ConfigKey::LogMaxStack => self.log_max_stack = non_negative(key, value)? as usize,
            ConfigKey::PluginMaxStack => self.plugin_max_stack = non_negative(key, value)? as usize,
            ConfigKey::EnforcePolicy => {
                // Anything but a literal "true" is false
                self.enforce_policy = value.eq_ignore_ascii_case("true");
            }
            ConfigKey::OgnlMinLength => self.ognl_min_length = non_negative(key, value)? as usize,
            ConfigKey::SqlSlowQueryMinRows => self.sql_slow_query_min_rows = non_negative(key, value)?,
            ConfigKey::BlockStatusCode => {
                let code = parse_int(key, value)?;
                self.block_status_code = if (100..=999).contains(&code) {
                    code as u16
                } else {
                    DEFAULT_BLOCK_STATUS
                };
            }
            ConfigKey::DebugLevel => {
                self.debug_level = non_negative(key, value)?.min(u64::from(u32::MAX)) as u32;
            }
            ConfigKey::AlgorithmConfig => {
                let parsed: serde_json::Value =
                    serde_json::from_str(value).map_err(|e| invalid(key, e.to_string()))?;
                if !parsed.is_object() {
                    return Err(invalid(key, "expected a JSON object".to_string()));
                }
                self.algorithm_config = parsed;
            }
        }
        Ok(())
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug_level > 0
    }

    /// Whether checks for the named detection type are switched off
    pub fn is_hook_ignored(&self, name: &str) -> bool {
        self.ignore_hooks.iter().any(|h| h == name)
    }
}

fn invalid(key: ConfigKey, reason: String) -> RaspError {
    RaspError::InvalidSetting {
        key: key.key().to_string(),
        reason,
    }
}

fn parse_int(key: ConfigKey, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| invalid(key, format!("'{}' is not an integer ({})", value, e)))
}

fn non_negative(key: ConfigKey, value: &str) -> Result<u64> {
    Ok(parse_int(key, value)?.max(0) as u64)
}

/// Parse properties-file text into key/value pairs
///
/// Supports `key=value`, `key: value` and `key value`, `#`/`!` comments and
/// trailing-backslash line continuation. Later duplicates win.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut pending = String::new();

    for raw in text.lines() {
        let line = if pending.is_empty() {
            raw.trim_start()
        } else {
            raw.trim()
        };
        if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            pending.push_str(stripped);
            continue;
        }
        pending.push_str(line);
        let logical = std::mem::take(&mut pending);

        let split_at = logical.find(['=', ':', ' ', '\t']);
        let (key, value) = match split_at {
            Some(i) => {
                let rest = logical[i..].trim_start_matches([' ', '\t']);
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                (logical[..i].trim(), rest.trim())
            }
            None => (logical.trim(), ""),
        };
        if !key.is_empty() {
            out.insert(key.to_string(), value.to_string());
        }
    }

    out
}

/// Process-wide settings store
///
/// Safe for concurrent reads from request threads and writes from the file
/// monitor thread or policy scripts.
pub struct ConfigStore {
    current: RwLock<Arc<Settings>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Store holding only built-in defaults, not backed by a file
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Arc::new(Settings::default())),
            path: None,
        }
    }

    /// Load settings from `path`
    ///
    /// A missing file yields all defaults. Individual invalid values fall
    /// back to their defaults with a warning; they never abort the load.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            current: RwLock::new(Arc::new(Settings::default())),
            path: Some(path.clone()),
        };
        store.load_from(&path, true)?;
        Ok(store)
    }

    /// Path of the backing settings file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the backing file
    ///
    /// Keys with invalid values keep their previous value; keys absent from
    /// the file return to their defaults.
    pub fn reload(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.load_from(path, false),
            None => Ok(()),
        }
    }

    /// Reload if `changed` is the backing settings file
    ///
    /// Returns whether a reload happened.
    pub fn reload_if_matches(&self, changed: &Path) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        if changed.file_name() != path.file_name() {
            return false;
        }
        if let Err(e) = self.reload() {
            tracing::warn!(path = %path.display(), error = %e, "Settings reload failed");
        }
        true
    }

    fn load_from(&self, path: &Path, initial: bool) -> Result<()> {
        let properties = match std::fs::read_to_string(path) {
            Ok(text) => parse_properties(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if initial {
                    tracing::info!(path = %path.display(), "Settings file not found, using defaults");
                }
                BTreeMap::new()
            }
            Err(e) => return Err(RaspError::io(path, e)),
        };

        for key in properties.keys() {
            if ConfigKey::parse(key).map_or(true, |k| !k.from_file()) {
                tracing::warn!(key = %key, "Ignoring unrecognised setting");
            }
        }

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = Arc::clone(&guard);
        let mut next = (*previous).clone();

        for key in ConfigKey::ALL.iter().filter(|k| k.from_file()) {
            let value = properties
                .get(key.key())
                .map(String::as_str)
                .unwrap_or_else(|| key.default_value());
            if let Err(e) = next.apply(*key, value) {
                if initial {
                    // Default values are always valid
                    let _ = next.apply(*key, key.default_value());
                    tracing::warn!(key = key.key(), error = %e, "Invalid setting, using default");
                } else {
                    tracing::warn!(key = key.key(), error = %e, "Invalid setting, keeping previous value");
                }
            }
        }

        log_changes(&previous, &next, initial);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Validate a value without applying it
    pub fn check(&self, key: &str, value: &str) -> Result<()> {
        let key = ConfigKey::parse(key).ok_or_else(|| RaspError::UnknownSetting(key.to_string()))?;
        let mut scratch = (*self.snapshot()).clone();
        scratch.apply(key, value)
    }

    /// Set one value at runtime
    ///
    /// Unknown keys and invalid values are rejected and logged; the return
    /// value reports whether the setting changed.
    pub fn set(&self, key: &str, value: &str) -> bool {
        match self.try_set(key, value) {
            Ok(()) => {
                tracing::info!(key = %key, value = %value, "Configuration item changed");
                true
            }
            Err(RaspError::UnknownSetting(_)) => {
                tracing::info!(key = %key, "Configuration item does not exist");
                false
            }
            Err(e) => {
                tracing::info!(key = %key, value = %value, error = %e, "Configuration item change rejected");
                false
            }
        }
    }

    /// Set one value at runtime, reporting why it was rejected
    pub fn try_set(&self, key: &str, value: &str) -> Result<()> {
        let key = ConfigKey::parse(key).ok_or_else(|| RaspError::UnknownSetting(key.to_string()))?;
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        next.apply(key, value)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Apply several values as one snapshot swap
    ///
    /// Readers see either none or all of the accepted values. Rejected
    /// entries are logged and skipped; returns how many were applied.
    pub fn set_many<K, V>(&self, updates: &[(K, V)]) -> usize
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        let mut applied = 0;
        for (key, value) in updates {
            let (key, value) = (key.as_ref(), value.as_ref());
            let result = ConfigKey::parse(key)
                .ok_or_else(|| RaspError::UnknownSetting(key.to_string()))
                .and_then(|k| next.apply(k, value));
            match result {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::info!(key = %key, value = %value, error = %e, "Configuration item change rejected");
                }
            }
        }
        *guard = Arc::new(next);
        tracing::info!(applied, total = updates.len(), "Configuration items changed");
        applied
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn log_changes(previous: &Settings, next: &Settings, initial: bool) {
    if initial {
        tracing::info!(
            plugin_timeout_ms = next.plugin_timeout_ms,
            body_max_bytes = next.body_max_bytes,
            block_status_code = next.block_status_code,
            debug_level = next.debug_level,
            "Settings loaded"
        );
    } else if previous != next {
        tracing::info!("Settings reloaded");
    }
    if next.debug_level > 0 && previous.debug_level != next.debug_level {
        tracing::info!(debug_level = next.debug_level, "Debug output enabled");
    }
}

/// Reloads a [`ConfigStore`] when its settings file changes
///
/// Events for other files in the watched directory are ignored.
pub struct ConfigFileListener {
    store: Arc<ConfigStore>,
}

impl ConfigFileListener {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }
}

impl FileListener for ConfigFileListener {
    fn on_file_create(&self, path: &Path) {
        self.store.reload_if_matches(path);
    }

    fn on_file_change(&self, path: &Path) {
        self.store.reload_if_matches(path);
    }

    fn on_file_delete(&self, path: &Path) {
        self.store.reload_if_matches(path);
    }
}
