//! Discovery passes and the background worker that serializes them.
//!
//! [`Discovery`] holds the pass logic: build a fresh class loader, list the
//! candidate names under the plugin package and try each one. The
//! [`DiscoveryWorker`] runs at most one pass at a time on the blocking pool
//! and publishes its progress through a `watch` channel.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DiscoveryConfig;
use crate::plugin::{
    sort_by_name, ArchiveClassLoader, BuiltinClasses, ClassLoader, PluginDescriptor, ScanOptions,
};
use crate::registry::{Generation, PluginRegistry};

/// Builds one generation per pass.
pub struct Discovery {
    builtins: Arc<BuiltinClasses>,
    plugin_dir: PathBuf,
    package: String,
    scan: ScanOptions,
    log_errors: AtomicBool,
    archives_disabled: AtomicBool,
}

impl Discovery {
    pub fn new(builtins: Arc<BuiltinClasses>, config: &DiscoveryConfig) -> Self {
        Self {
            builtins,
            plugin_dir: config.plugin_dir.clone(),
            package: config.package.clone(),
            scan: config.scan_options(),
            log_errors: AtomicBool::new(config.log_errors),
            archives_disabled: AtomicBool::new(config.archives_disabled),
        }
    }

    pub fn log_errors(&self) -> bool {
        self.log_errors.load(Ordering::Relaxed)
    }

    /// Takes effect on the next pass.
    pub fn set_log_errors(&self, value: bool) {
        self.log_errors.store(value, Ordering::Relaxed);
    }

    pub fn archives_disabled(&self) -> bool {
        self.archives_disabled.load(Ordering::Relaxed)
    }

    /// Takes effect on the next pass.
    pub fn set_archives_disabled(&self, value: bool) {
        self.archives_disabled.store(value, Ordering::Relaxed);
    }

    pub fn plugin_dir(&self) -> &std::path::Path {
        &self.plugin_dir
    }

    /// A loader for a new generation: the builtin table alone, or the
    /// builtins plus every archive under the plugin directory.
    pub fn build_loader(&self) -> Arc<dyn ClassLoader> {
        if self.archives_disabled() {
            tracing::debug!("Archive loading disabled, using builtin classes only");
            return Arc::clone(&self.builtins) as Arc<dyn ClassLoader>;
        }
        Arc::new(ArchiveClassLoader::from_directory(
            Arc::clone(&self.builtins),
            &self.plugin_dir,
            &self.scan,
        ))
    }

    /// Runs one pass for generation `number`.
    ///
    /// `cancelled` is polled before and between candidates; once it
    /// returns true the pass stops and yields `None`.
    pub fn run_pass(&self, number: u64, cancelled: &dyn Fn() -> bool) -> Option<Generation> {
        if cancelled() {
            return None;
        }

        let loader = self.build_loader();
        let mut names = BTreeSet::new();
        loader.find_class_names_in_package(&self.package, &mut names);
        tracing::debug!(
            generation = number,
            candidates = names.len(),
            package = %self.package,
            "Scanning plugin candidates"
        );

        let log_errors = self.log_errors();
        let mut plugins = Vec::new();
        for name in &names {
            if cancelled() {
                tracing::debug!(generation = number, "Discovery pass cancelled");
                return None;
            }
            match loader.load_class(name) {
                Ok(class) => plugins.push(PluginDescriptor::new(class, number)),
                Err(err) => err.report(log_errors),
            }
        }

        sort_by_name(&mut plugins);
        tracing::info!(generation = number, plugins = plugins.len(), "Plugin list loaded");
        Some(Generation::new(number, loader, plugins))
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("plugin_dir", &self.plugin_dir)
            .field("package", &self.package)
            .field("log_errors", &self.log_errors())
            .field("archives_disabled", &self.archives_disabled())
            .finish()
    }
}

/// Callbacks around each pass.
pub trait PassHooks: Send + Sync {
    /// Runs on the blocking pool before the loader is built.
    fn before_pass(&self);

    /// Runs once `generation` is installed and the worker no longer reports
    /// loading.
    fn installed(&self, generation: u64);
}

/// Worker progress as seen through [`DiscoveryWorker::subscribe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerState {
    /// A pass has been requested and not yet started.
    pub pending: bool,
    /// A pass is running.
    pub loading: bool,
    /// The change notification of the last installed pass is being raised.
    pub notifying: bool,
    pub shutdown: bool,
    /// Completed (installed) passes.
    pub passes: u64,
}

impl WorkerState {
    pub fn is_loading(&self) -> bool {
        self.pending || self.loading
    }
}

/// Single background task executing discovery passes one after another.
pub struct DiscoveryWorker {
    state: Arc<watch::Sender<WorkerState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryWorker {
    /// Spawns the worker on the current tokio runtime.
    ///
    /// The worker keeps only a weak reference to `hooks`; it exits once they
    /// are dropped.
    pub fn spawn(
        discovery: Arc<Discovery>,
        registry: Arc<PluginRegistry>,
        hooks: Weak<dyn PassHooks>,
    ) -> Self {
        let (sender, _) = watch::channel(WorkerState::default());
        let state = Arc::new(sender);
        let task = tokio::spawn(run_worker(Arc::clone(&state), discovery, registry, hooks));
        Self {
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Asks for a pass. Returns false when the worker has shut down.
    ///
    /// Requests made while one is already pending coalesce. A request made
    /// while a pass runs leaves that pass alone; one more pass follows once
    /// its change notification has been raised.
    pub fn request(&self) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|state| {
            if state.shutdown {
                return false;
            }
            accepted = true;
            if state.pending {
                return false;
            }
            state.pending = true;
            true
        });
        accepted
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Waits until no pass is pending or running and the change
    /// notification of the last pass has been raised.
    pub async fn wait_while_loading(&self) {
        let mut rx = self.state.subscribe();
        // Only fails if the sender is gone, which cannot happen while `self` lives.
        let _ = rx
            .wait_for(|s| (!s.is_loading() && !s.notifying) || s.shutdown)
            .await;
    }

    /// Stops accepting requests and waits for the worker task to end. A pass
    /// in progress is abandoned at the next candidate.
    pub async fn shutdown(&self) {
        self.state.send_modify(|state| state.shutdown = true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Discovery worker failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for DiscoveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryWorker")
            .field("state", &self.state())
            .finish()
    }
}

async fn run_worker(
    state: Arc<watch::Sender<WorkerState>>,
    discovery: Arc<Discovery>,
    registry: Arc<PluginRegistry>,
    hooks: Weak<dyn PassHooks>,
) {
    let mut rx = state.subscribe();
    tracing::debug!("Discovery worker started");

    loop {
        let next = match rx.wait_for(|s| s.pending || s.shutdown).await {
            Ok(s) => *s,
            Err(_) => break,
        };
        if next.shutdown {
            break;
        }

        let Some(hooks) = hooks.upgrade() else {
            tracing::debug!("Plugin host dropped, stopping discovery worker");
            break;
        };

        state.send_modify(|s| {
            s.pending = false;
            s.loading = true;
        });

        let number = registry.next_generation();
        let pass_state = Arc::clone(&state);
        let pass_discovery = Arc::clone(&discovery);
        let pass_registry = Arc::clone(&registry);
        let probe = state.subscribe();

        let result = tokio::task::spawn_blocking(move || {
            hooks.before_pass();

            // Only shutdown cancels a pass; newer requests stay pending.
            let cancelled = || probe.borrow().shutdown;
            let Some(generation) = pass_discovery.run_pass(number, &cancelled) else {
                pass_state.send_modify(|s| s.loading = false);
                return;
            };

            let installed = pass_registry.install(generation);
            pass_state.send_modify(|s| {
                s.loading = false;
                if installed {
                    s.passes += 1;
                    s.notifying = true;
                }
            });
            if installed {
                hooks.installed(number);
                pass_state.send_modify(|s| s.notifying = false);
            }
        })
        .await;

        if let Err(e) = result {
            tracing::error!(generation = number, "Discovery pass failed: {}", e);
            state.send_modify(|s| {
                s.loading = false;
                s.notifying = false;
            });
        }
    }

    state.send_modify(|s| {
        s.pending = false;
        s.loading = false;
        s.notifying = false;
    });
    tracing::debug!("Discovery worker stopped");
}
