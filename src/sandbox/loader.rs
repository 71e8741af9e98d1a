//! Policy script discovery and hot reload

use super::{PolicyScript, PolicySandbox};
use crate::error::{RaspError, Result};
use crate::monitor::{Debouncer, FileListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Policy directory under the agent base dir
pub const PLUGIN_DIR_NAME: &str = "plugins";

/// Extension of policy script files
pub const SCRIPT_EXTENSION: &str = "rhai";

/// Larger files are skipped
pub const MAX_SCRIPT_BYTES: u64 = 10 * 1024 * 1024;

/// Quiet window before a burst of script changes triggers a reload
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

fn is_script(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION)
}

/// Read every policy script in `dir`, sorted by file name
///
/// Creates the directory when it does not exist. Oversized and unreadable
/// files are skipped with a warning.
pub fn load_scripts(dir: &Path) -> Result<Vec<PolicyScript>> {
    std::fs::create_dir_all(dir).map_err(|e| RaspError::io(dir, e))?;

    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| RaspError::io(dir, e))? {
        let entry = entry.map_err(|e| RaspError::io(dir, e))?;
        let path = entry.path();
        if !is_script(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if meta.len() > MAX_SCRIPT_BYTES {
            tracing::warn!(path = %path.display(), size = meta.len(), "Skipping oversized policy script");
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                let name = entry.file_name().to_string_lossy().into_owned();
                scripts.push(PolicyScript { name, source });
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable policy script");
            }
        }
    }

    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scripts)
}

/// Load `dir` and activate it as the next generation
pub fn reload_policies(dir: &Path, sandbox: &PolicySandbox) -> Result<u64> {
    let scripts = load_scripts(dir)?;
    tracing::info!(path = %dir.display(), count = scripts.len(), "Loading policy scripts");
    sandbox.activate(scripts)
}

/// Reloads the policy directory after script changes settle
pub struct PolicyWatcher {
    debouncer: Debouncer,
}

impl PolicyWatcher {
    pub fn new(dir: impl Into<PathBuf>, sandbox: Arc<PolicySandbox>) -> Self {
        Self::with_window(dir, sandbox, RELOAD_DEBOUNCE)
    }

    pub fn with_window(dir: impl Into<PathBuf>, sandbox: Arc<PolicySandbox>, window: Duration) -> Self {
        let dir = dir.into();
        let debouncer = Debouncer::new(window, move || {
            let scripts = match load_scripts(&dir) {
                Ok(scripts) => scripts,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Policy reload failed");
                    return;
                }
            };
            if sandbox.current().scripts() == scripts.as_slice() {
                tracing::debug!(path = %dir.display(), "Policy scripts unchanged");
                return;
            }
            tracing::info!(path = %dir.display(), count = scripts.len(), "Policy scripts changed, reloading");
            if let Err(e) = sandbox.activate(scripts) {
                tracing::warn!(path = %dir.display(), error = %e, "Policy reload failed");
            }
        });
        Self { debouncer }
    }

    fn touched(&self, path: &Path) {
        if is_script(path) {
            self.debouncer.trigger();
        }
    }
}

impl FileListener for PolicyWatcher {
    fn on_file_create(&self, path: &Path) {
        self.touched(path);
    }

    fn on_file_change(&self, path: &Path) {
        self.touched(path);
    }

    fn on_file_delete(&self, path: &Path) {
        self.touched(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    #[test]
    fn test_load_scripts_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.rhai"), "let b = 1;").unwrap();
        std::fs::write(dir.path().join("a.rhai"), "let a = 1;").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("dir.rhai")).unwrap();

        let scripts = load_scripts(dir.path()).unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a.rhai", "b.rhai"]);
        assert_eq!(scripts[0].source, "let a = 1;");
    }

    #[test]
    fn test_load_scripts_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join(PLUGIN_DIR_NAME);
        assert!(load_scripts(&plugins).unwrap().is_empty());
        assert!(plugins.is_dir());
    }

    #[test]
    fn test_oversized_script_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let big = std::fs::File::create(dir.path().join("big.rhai")).unwrap();
        big.set_len(MAX_SCRIPT_BYTES + 1).unwrap();
        std::fs::write(dir.path().join("small.rhai"), "1;").unwrap();

        let scripts = load_scripts(dir.path()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "small.rhai");
    }

    #[test]
    fn test_watcher_reloads_once_after_burst() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(PolicySandbox::new(Arc::new(ConfigStore::in_memory())));
        let watcher = PolicyWatcher::with_window(dir.path(), Arc::clone(&sandbox), Duration::from_millis(150));

        let script = dir.path().join("p.rhai");
        std::fs::write(&script, r#"plugin("p").register("xxe", |p, c| ());"#).unwrap();
        for _ in 0..3 {
            watcher.on_file_change(&script);
            std::thread::sleep(Duration::from_millis(20));
        }
        watcher.on_file_change(&dir.path().join("readme.md"));

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(sandbox.current().id(), 1);
        assert_eq!(sandbox.current().script_names(), vec!["p.rhai"]);

        // Same content again: nothing to activate
        watcher.on_file_change(&script);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(sandbox.current().id(), 1);
    }
}
