//! Process-wide agent context
//!
//! [`Agent`] owns every shared component and is passed by reference to
//! framework adapters. It lays out the base directory:
//!
//! ```text
//! <base>/conf/rasp.properties   settings
//! <base>/plugins/*.rhai         policy scripts
//! <base>/assets/inject.html     optional block page fragment
//! ```
//!
//! All three directories are watched. If one is deleted and created again
//! the watch is re-established.

use crate::alert::{AlertSink, TracingAlertSink};
use crate::checks::{default_checks, BuiltinCheck};
use crate::config::{ConfigFileListener, ConfigStore, CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use crate::context::{HttpRequest, HttpResponse};
use crate::dispatch::Dispatcher;
use crate::error::{RaspError, Result, SecurityBlock};
use crate::guard::{Disposition, Guard};
use crate::monitor::{FileListener, FileMonitor, WatchHandle};
use crate::response::{BlockResponder, CustomBlockPage, ASSETS_DIR_NAME, BLOCK_PAGE_FILE_NAME};
use crate::sandbox::{self, PolicySandbox, PolicyWatcher, PLUGIN_DIR_NAME, RELOAD_DEBOUNCE};
use crate::types::CheckParams;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// How an agent is assembled
pub struct AgentOptions {
    /// Destination of alert records
    pub sink: Arc<dyn AlertSink>,
    /// Compiled-in checks
    pub builtins: Vec<Box<dyn BuiltinCheck>>,
    /// Quiet window before policy changes are reloaded
    pub policy_debounce: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            sink: Arc::new(TracingAlertSink),
            builtins: default_checks(),
            policy_debounce: RELOAD_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WatchTarget {
    Config,
    Plugins,
    Assets,
}

impl WatchTarget {
    const ALL: [WatchTarget; 3] = [WatchTarget::Config, WatchTarget::Plugins, WatchTarget::Assets];

    fn dir_name(&self) -> &'static str {
        match self {
            WatchTarget::Config => CONFIG_DIR_NAME,
            WatchTarget::Plugins => PLUGIN_DIR_NAME,
            WatchTarget::Assets => ASSETS_DIR_NAME,
        }
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        WatchTarget::ALL.into_iter().find(|t| t.dir_name() == name)
    }
}

/// The running agent
pub struct Agent {
    base_dir: PathBuf,
    config: Arc<ConfigStore>,
    sandbox: Arc<PolicySandbox>,
    block_page: Arc<CustomBlockPage>,
    guard: Guard,
    monitor: FileMonitor,
    listeners: HashMap<WatchTarget, Arc<dyn FileListener>>,
    watches: Mutex<HashMap<WatchTarget, WatchHandle>>,
    base_watch: Mutex<Option<WatchHandle>>,
}

impl Agent {
    /// Load everything under `base_dir`, start watching and enable detection
    ///
    /// Policy script failures are logged and leave the agent running with
    /// no policies. Failing to watch a directory is fatal.
    pub fn start(base_dir: impl Into<PathBuf>, options: AgentOptions) -> Result<Arc<Agent>> {
        let base_dir = base_dir.into();
        for target in WatchTarget::ALL {
            let dir = base_dir.join(target.dir_name());
            std::fs::create_dir_all(&dir).map_err(|e| RaspError::io(&dir, e))?;
        }

        let config = Arc::new(ConfigStore::load(
            base_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        )?);

        let block_page = Arc::new(CustomBlockPage::new(
            base_dir.join(ASSETS_DIR_NAME).join(BLOCK_PAGE_FILE_NAME),
        ));
        if let Err(e) = block_page.reload() {
            tracing::warn!(error = %e, "Failed to load custom block page");
        }

        let sandbox = Arc::new(PolicySandbox::new(Arc::clone(&config)));
        let plugin_dir = base_dir.join(PLUGIN_DIR_NAME);
        if let Err(e) = sandbox::reload_policies(&plugin_dir, &sandbox) {
            tracing::warn!(path = %plugin_dir.display(), error = %e, "Initial policy load failed");
        }

        let dispatcher = Dispatcher::new(Arc::clone(&config), Arc::clone(&sandbox), options.builtins);
        let responder = BlockResponder::new(Arc::clone(&config), Arc::clone(&block_page));
        let guard = Guard::new(Arc::clone(&config), dispatcher, options.sink, responder);

        let mut listeners: HashMap<WatchTarget, Arc<dyn FileListener>> = HashMap::new();
        listeners.insert(
            WatchTarget::Config,
            Arc::new(ConfigFileListener::new(Arc::clone(&config))),
        );
        listeners.insert(
            WatchTarget::Plugins,
            Arc::new(PolicyWatcher::with_window(
                plugin_dir,
                Arc::clone(&sandbox),
                options.policy_debounce,
            )),
        );
        listeners.insert(WatchTarget::Assets, block_page.clone());

        let agent = Arc::new(Agent {
            base_dir,
            config,
            sandbox,
            block_page,
            guard,
            monitor: FileMonitor::new(),
            listeners,
            watches: Mutex::new(HashMap::new()),
            base_watch: Mutex::new(None),
        });

        for target in WatchTarget::ALL {
            agent.watch(target)?;
        }
        let base_listener = Arc::new(BaseDirListener {
            agent: Arc::downgrade(&agent),
        });
        let handle = agent.monitor.watch(&agent.base_dir, base_listener)?;
        *agent.base_watch.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        agent.guard.set_enabled(true);
        tracing::info!(
            base_dir = %agent.base_dir.display(),
            generation = agent.sandbox.current().id(),
            "RASP agent started"
        );
        Ok(agent)
    }

    fn watch(&self, target: WatchTarget) -> Result<()> {
        let Some(listener) = self.listeners.get(&target) else {
            return Ok(());
        };
        let dir = self.base_dir.join(target.dir_name());
        let handle = self.monitor.watch(&dir, Arc::clone(listener))?;
        let previous = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target, handle);
        if let Some(previous) = previous {
            self.monitor.unwatch(previous);
        }
        Ok(())
    }

    fn directory_created(&self, target: WatchTarget) {
        let watched = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&target);
        if watched || !self.guard.is_enabled() {
            return;
        }
        match self.watch(target) {
            Ok(()) => tracing::info!(dir = target.dir_name(), "Directory re-created, watching again"),
            Err(e) => tracing::warn!(dir = target.dir_name(), error = %e, "Failed to re-watch directory"),
        }
    }

    fn directory_deleted(&self, target: WatchTarget) {
        let handle = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&target);
        if let Some(handle) = handle {
            self.monitor.unwatch(handle);
            tracing::warn!(dir = target.dir_name(), "Watched directory deleted");
        }
    }

    /// Disable detection and stop every watch
    pub fn shutdown(&self) {
        self.guard.set_enabled(false);
        self.base_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.monitor.unwatch_all();
        tracing::info!(base_dir = %self.base_dir.display(), "RASP agent stopped");
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn sandbox(&self) -> &Arc<PolicySandbox> {
        &self.sandbox
    }

    pub fn block_page(&self) -> &Arc<CustomBlockPage> {
        &self.block_page
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn is_enabled(&self) -> bool {
        self.guard.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.guard.set_enabled(enabled);
    }

    /// Reload policy scripts immediately, bypassing the debounce window
    pub fn reload_policies(&self) -> Result<u64> {
        sandbox::reload_policies(&self.base_dir.join(PLUGIN_DIR_NAME), &self.sandbox)
    }

    // Interception surface

    pub fn enter_request(
        &self,
        request: Box<dyn HttpRequest>,
        response: Option<Box<dyn HttpResponse>>,
    ) -> std::result::Result<Disposition, SecurityBlock> {
        self.guard.enter_request(request, response)
    }

    pub fn exit_request(&self) {
        self.guard.exit_request();
    }

    pub fn on_body_bytes_read(&self, buf: &[u8], offset: usize, len: usize) {
        self.guard.on_body_bytes_read(buf, offset, len);
    }

    pub fn on_parameter_access_enabled(&self) {
        self.guard.on_parameter_access_enabled();
    }

    /// Call just before the response output stream is closed
    pub fn on_response_close(&self) -> bool {
        self.guard.on_response_close()
    }

    pub fn check(&self, params: CheckParams) -> std::result::Result<Disposition, SecurityBlock> {
        self.guard.check(params)
    }

    pub fn check_without_request(
        &self,
        params: CheckParams,
    ) -> std::result::Result<Disposition, SecurityBlock> {
        self.guard.check_without_request(params)
    }

    /// See [`guard::shield`](crate::guard::shield)
    pub fn shield<T>(&self, op: impl FnOnce() -> T) -> T {
        crate::guard::shield(op)
    }
}

/// Notices the agent's own directories being removed and re-created
struct BaseDirListener {
    agent: Weak<Agent>,
}

impl BaseDirListener {
    fn target(path: &Path) -> Option<WatchTarget> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(WatchTarget::from_dir_name)
    }
}

impl FileListener for BaseDirListener {
    fn on_file_create(&self, _path: &Path) {}

    fn on_file_change(&self, _path: &Path) {}

    fn on_file_delete(&self, _path: &Path) {}

    fn on_directory_create(&self, path: &Path) {
        if let (Some(target), Some(agent)) = (Self::target(path), self.agent.upgrade()) {
            agent.directory_created(target);
        }
    }

    fn on_directory_delete(&self, path: &Path) {
        if let (Some(target), Some(agent)) = (Self::target(path), self.agent.upgrade()) {
            agent.directory_deleted(target);
        }
    }
}
