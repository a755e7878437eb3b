//! The plugin host: registry, discovery worker, daemons and change
//! notification wired together.
//!
//! A [`PluginHost`] is cheap to clone; all clones share one registry and
//! one worker. Queries that need a plugin list call
//! [`prepare`](PluginHost::prepare) first, so the first query triggers the
//! first discovery pass.
//!
//! # Example
//! ```no_run
//! use bioimage_plugins::{config::HostConfig, host::PluginHost};
//!
//! # async fn demo() -> bioimage_plugins::error::AppResult<()> {
//! let host = PluginHost::builder(HostConfig::load()?).start()?;
//! host.add_listener(std::sync::Arc::new(|event: &bioimage_plugins::notify::PluginListChanged| {
//!     tracing::info!(generation = event.generation, "Rebuilding menus");
//! }));
//!
//! for plugin in host.actionable_plugins(false).await {
//!     println!("{} {}", plugin.name(), plugin.version());
//! }
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, watch};

use crate::config::HostConfig;
use crate::daemons::DaemonManager;
use crate::discovery::{Discovery, DiscoveryWorker, PassHooks, WorkerState};
use crate::error::{AppResult, PluginError};
use crate::notify::{ChangeNotifier, ListenerId, PluginListChanged, PluginListener};
use crate::plugin::{
    BuiltinClass, BuiltinClasses, PluginClass, PluginDescriptor, PluginIdent, Resource,
};
use crate::preferences::{DaemonPreferences, InactiveDaemons};
use crate::registry::{Generation, PluginFilter, PluginRegistry};

/// Configures and starts a [`PluginHost`].
pub struct PluginHostBuilder {
    config: HostConfig,
    builtins: BuiltinClasses,
    preferences: Option<Arc<dyn DaemonPreferences>>,
}

impl PluginHostBuilder {
    /// Replaces the builtin class table.
    pub fn builtins(mut self, builtins: BuiltinClasses) -> Self {
        self.builtins = builtins;
        self
    }

    /// Adds one builtin plugin class.
    pub fn register(mut self, class: BuiltinClass) -> Self {
        self.builtins = self.builtins.register(class);
        self
    }

    /// Source of disabled daemon classes. Defaults to the
    /// `daemons.inactive` list from the configuration.
    pub fn preferences(mut self, preferences: Arc<dyn DaemonPreferences>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// Validates the configuration and spawns the discovery worker. Must
    /// be called inside a tokio runtime. No pass runs until one is
    /// requested.
    pub fn start(self) -> AppResult<PluginHost> {
        self.config.validate().map_err(PluginError::Configuration)?;
        tokio::runtime::Handle::try_current().map_err(|e| PluginError::Runtime(e.to_string()))?;

        let preferences = self.preferences.unwrap_or_else(|| {
            Arc::new(InactiveDaemons::new(self.config.daemons.inactive.iter().cloned()))
                as Arc<dyn DaemonPreferences>
        });
        let discovery = Arc::new(Discovery::new(Arc::new(self.builtins), &self.config.discovery));
        let registry = Arc::new(PluginRegistry::new());

        let core = Arc::new(HostCore {
            autostart: self.config.daemons.autostart,
            config: self.config,
            registry: Arc::clone(&registry),
            notifier: ChangeNotifier::new(),
            daemons: DaemonManager::new(),
            discovery: Arc::clone(&discovery),
            preferences,
            initialized: AtomicBool::new(false),
        });

        let hooks = Arc::downgrade(&core) as Weak<dyn PassHooks>;
        let worker = Arc::new(DiscoveryWorker::spawn(discovery, registry, hooks));

        tracing::info!(
            plugin_dir = %core.discovery.plugin_dir().display(),
            package = %core.config.discovery.package,
            "Plugin host started"
        );
        Ok(PluginHost { core, worker })
    }
}

/// State shared between the host handle and the worker's pass hooks.
struct HostCore {
    config: HostConfig,
    autostart: bool,
    registry: Arc<PluginRegistry>,
    notifier: ChangeNotifier,
    daemons: DaemonManager,
    discovery: Arc<Discovery>,
    preferences: Arc<dyn DaemonPreferences>,
    initialized: AtomicBool,
}

impl HostCore {
    fn start_daemons(&self) -> usize {
        let generation = self.registry.snapshot();
        let inactive = self.preferences.inactive_daemons();
        self.daemons.start(&generation.daemon_plugins(), &inactive)
    }

    /// Starts daemons and notifies listeners, unless a newer generation has
    /// already been dispatched.
    fn dispatch(&self, event: PluginListChanged) {
        if !self.notifier.claim(&event) {
            tracing::debug!(generation = event.generation, "Skipping stale plugin list change");
            return;
        }
        if self.autostart {
            self.start_daemons();
        }
        self.notifier.fan_out(&event);
    }

    fn changed(&self, generation: u64) {
        self.initialized.store(true, Ordering::SeqCst);
        if let Some(event) = self.notifier.changed(PluginListChanged { generation }) {
            self.dispatch(event);
        }
    }
}

impl PassHooks for HostCore {
    fn before_pass(&self) {
        // Failures are logged by the manager.
        let _ = self.daemons.stop();
    }

    fn installed(&self, generation: u64) {
        self.changed(generation);
    }
}

/// Handle to a running plugin subsystem.
#[derive(Clone)]
pub struct PluginHost {
    core: Arc<HostCore>,
    worker: Arc<DiscoveryWorker>,
}

impl PluginHost {
    pub fn builder(config: HostConfig) -> PluginHostBuilder {
        PluginHostBuilder {
            config,
            builtins: BuiltinClasses::new(),
            preferences: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.core.config
    }

    /// Makes sure a plugin list is available: waits for a pass in progress,
    /// or runs the first one.
    pub async fn prepare(&self) -> AppResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if self.is_loading() {
            self.wait_while_loading().await;
            Ok(())
        } else {
            self.reload().await
        }
    }

    /// Requests a pass and waits for it to finish.
    pub async fn reload(&self) -> AppResult<()> {
        if !self.worker.request() {
            return Err(PluginError::HostStopped);
        }
        self.wait_while_loading().await;
        Ok(())
    }

    /// Requests a pass without waiting. Inside an update batch the request
    /// is deferred to the end of the batch.
    pub fn reload_async(&self) {
        if self.core.notifier.defer_reload() {
            tracing::debug!("Reload deferred until the update batch ends");
            return;
        }
        if !self.worker.request() {
            tracing::warn!("Reload requested after the plugin host stopped");
        }
    }

    /// True while a pass is pending or running.
    pub fn is_loading(&self) -> bool {
        self.worker.is_loading()
    }

    pub async fn wait_while_loading(&self) {
        self.worker.wait_while_loading().await;
    }

    /// True once the first plugin list change has been raised.
    pub fn is_initialized(&self) -> bool {
        self.core.initialized.load(Ordering::SeqCst)
    }

    /// Worker progress updates.
    pub fn worker_state(&self) -> watch::Receiver<WorkerState> {
        self.worker.subscribe()
    }

    /// Stops and restarts every daemon of the current generation. Does
    /// nothing while loading, since the running pass restarts them anyway.
    pub fn reset_daemons(&self) {
        if self.is_loading() {
            return;
        }
        let _ = self.core.daemons.stop();
        self.core.start_daemons();
    }

    /// Stops every running daemon. Stop failures are logged.
    pub fn stop_daemons(&self) {
        let _ = self.core.daemons.stop();
    }

    pub fn active_daemons(&self) -> Vec<PluginDescriptor> {
        self.core.daemons.active_daemons()
    }

    pub fn add_listener(&self, listener: Arc<dyn PluginListener>) -> ListenerId {
        self.core.notifier.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.notifier.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginListChanged> {
        self.core.notifier.subscribe()
    }

    pub fn begin_update(&self) {
        self.core.notifier.begin_update();
    }

    /// Closes one batch level. The outermost call dispatches the held-back
    /// change and runs a deferred reload.
    pub fn end_update(&self) {
        let end = self.core.notifier.end_update();
        if let Some(event) = end.event {
            self.core.dispatch(event);
        }
        if end.reload {
            self.reload_async();
        }
    }

    pub fn is_updating(&self) -> bool {
        self.core.notifier.is_updating()
    }

    /// Opens a batch closed when the guard drops.
    pub fn update_batch(&self) -> UpdateBatch<'_> {
        self.begin_update();
        UpdateBatch { host: self }
    }

    /// The installed generation, without preparing.
    pub fn current(&self) -> Arc<Generation> {
        self.core.registry.snapshot()
    }

    async fn prepared(&self) -> Arc<Generation> {
        if let Err(e) = self.prepare().await {
            tracing::warn!("Plugin list not refreshed: {}", e);
        }
        self.current()
    }

    pub async fn plugins(&self, want_bundled: bool) -> Vec<PluginDescriptor> {
        self.prepared().await.plugins(want_bundled)
    }

    pub async fn plugins_implementing(
        &self,
        capability: &str,
        filter: PluginFilter,
    ) -> Vec<PluginDescriptor> {
        self.prepared().await.plugins_implementing(capability, filter)
    }

    pub async fn actionable_plugins(&self, want_bundled: bool) -> Vec<PluginDescriptor> {
        self.prepared().await.actionable_plugins(want_bundled)
    }

    pub async fn daemon_plugins(&self) -> Vec<PluginDescriptor> {
        self.prepared().await.daemon_plugins()
    }

    pub async fn plugin(&self, ident: &PluginIdent, accept_newer: bool) -> Option<PluginDescriptor> {
        self.prepared().await.plugin(ident, accept_newer)
    }

    pub async fn plugin_by_class(&self, class_name: &str) -> Option<PluginDescriptor> {
        self.prepared().await.plugin_by_class(class_name)
    }

    pub async fn is_loaded(&self, ident: &PluginIdent, accept_newer: bool) -> bool {
        self.prepared().await.is_loaded(ident, accept_newer)
    }

    pub async fn plugin_class(&self, class_name: &str) -> Option<Arc<dyn PluginClass>> {
        self.prepared().await.plugin_class(class_name)
    }

    /// Resolves any class through the current loader, plugin or not.
    pub async fn load_class(&self, class_name: &str) -> AppResult<Arc<dyn PluginClass>> {
        Ok(self.prepared().await.load_class(class_name)?)
    }

    pub async fn resource(&self, name: &str) -> Option<Resource> {
        self.prepared().await.resource(name)
    }

    pub async fn all_resources(&self) -> BTreeMap<String, Resource> {
        self.prepared().await.all_resources()
    }

    pub async fn all_classes(&self) -> BTreeMap<String, Arc<dyn PluginClass>> {
        self.prepared().await.all_classes()
    }

    /// Checks that `plugins` still resolve through the current loader.
    pub fn verify_plugins_are_valid(&self, plugins: &[PluginDescriptor]) -> AppResult<()> {
        self.current()
            .verify_plugins_are_valid(plugins)
            .map_err(PluginError::Verification)
    }

    pub fn log_errors(&self) -> bool {
        self.core.discovery.log_errors()
    }

    /// Whether per-class load failures are logged. Takes effect on the
    /// next pass.
    pub fn set_log_errors(&self, value: bool) {
        self.core.discovery.set_log_errors(value);
    }

    pub fn archives_disabled(&self) -> bool {
        self.core.discovery.archives_disabled()
    }

    /// Restricts discovery to builtin classes. Takes effect on the next
    /// pass.
    pub fn set_archives_disabled(&self, value: bool) {
        self.core.discovery.set_archives_disabled(value);
    }

    pub fn plugin_dir(&self) -> &Path {
        self.core.discovery.plugin_dir()
    }

    /// Stops the discovery worker and the daemons. Further reload requests
    /// are refused.
    ///
    /// Every daemon is asked to stop even if some fail; the failures are
    /// returned together as [`PluginError::ShutdownFailed`].
    pub async fn shutdown(&self) -> AppResult<()> {
        self.worker.shutdown().await;
        let failures = self.core.daemons.stop();
        tracing::info!("Plugin host stopped");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PluginError::ShutdownFailed(failures))
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("generation", &self.current().number())
            .field("worker", &self.worker)
            .field("daemons", &self.core.daemons)
            .field("notifier", &self.core.notifier)
            .finish()
    }
}

/// RAII guard from [`PluginHost::update_batch`].
#[must_use = "the batch ends when the guard is dropped"]
pub struct UpdateBatch<'a> {
    host: &'a PluginHost,
}

impl Drop for UpdateBatch<'_> {
    fn drop(&mut self) {
        self.host.end_update();
    }
}
