//! Daemon plugin lifecycle.
//!
//! Each started daemon runs on its own named thread. Stopping is
//! cooperative: every daemon is asked to stop and its thread is left to
//! finish on its own.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;

use crate::error::PluginError;
use crate::plugin::{DaemonPlugin, PluginDescriptor, PluginInstance};

struct ActiveDaemon {
    descriptor: PluginDescriptor,
    daemon: Arc<dyn DaemonPlugin>,
    thread: thread::JoinHandle<()>,
}

/// Owns the set of running daemons.
#[derive(Default)]
pub struct DaemonManager {
    active: Mutex<Vec<ActiveDaemon>>,
}

impl DaemonManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts every concrete daemon in `plugins` whose class is not listed
    /// in `inactive`. Daemons still running from a previous start are
    /// stopped first. Returns the number of daemons started.
    pub fn start(&self, plugins: &[PluginDescriptor], inactive: &BTreeSet<String>) -> usize {
        let mut active = self.active.lock();
        if !active.is_empty() {
            // Already logged per daemon.
            let _ = stop_all(&mut active);
        }

        for descriptor in plugins.iter().filter(|p| p.is_daemon()) {
            if inactive.contains(descriptor.class_name()) {
                tracing::debug!(class = descriptor.class_name(), "Daemon is inactive, not starting");
                continue;
            }

            let started = catch_unwind(AssertUnwindSafe(|| start_one(descriptor)))
                .unwrap_or_else(|_| Err(anyhow!("panicked while starting")));
            match started {
                Ok(daemon) => {
                    tracing::info!(class = descriptor.class_name(), "Started daemon plugin");
                    active.push(daemon);
                }
                Err(e) => {
                    tracing::error!(
                        class = descriptor.class_name(),
                        "Cannot start daemon plugin: {:#}",
                        e
                    );
                }
            }
        }

        active.len()
    }

    /// Asks every active daemon to stop and forgets them. Does not wait for
    /// their threads. Returns the daemons that failed to stop cleanly; each
    /// failure has already been logged.
    pub fn stop(&self) -> Vec<PluginError> {
        stop_all(&mut self.active.lock())
    }

    /// Descriptors of the running daemons, in start order.
    pub fn active_daemons(&self) -> Vec<PluginDescriptor> {
        self.active
            .lock()
            .iter()
            .map(|d| d.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

impl std::fmt::Debug for DaemonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .active_daemons()
            .iter()
            .map(|d| d.class_name().to_string())
            .collect();
        f.debug_struct("DaemonManager").field("active", &names).finish()
    }
}

fn start_one(descriptor: &PluginDescriptor) -> anyhow::Result<ActiveDaemon> {
    let daemon = match descriptor.instantiate()? {
        PluginInstance::Daemon(daemon) => daemon,
        other => return Err(anyhow!("expected a daemon instance, got {:?}", other.kind())),
    };

    daemon.init().context("init failed")?;

    let runner = Arc::clone(&daemon);
    let class = descriptor.class_name().to_string();
    let thread = thread::Builder::new()
        .name(descriptor.name().to_string())
        .spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| runner.run())).is_err() {
                tracing::error!(class = %class, "Daemon plugin panicked");
            } else {
                tracing::debug!(class = %class, "Daemon plugin finished");
            }
        })
        .context("cannot spawn daemon thread")?;

    Ok(ActiveDaemon {
        descriptor: descriptor.clone(),
        daemon,
        thread,
    })
}

fn stop_all(active: &mut Vec<ActiveDaemon>) -> Vec<PluginError> {
    let mut failures = Vec::new();
    for entry in active.drain(..) {
        let class = entry.descriptor.class_name();
        let message = match catch_unwind(AssertUnwindSafe(|| entry.daemon.stop())) {
            Ok(Ok(())) => {
                tracing::info!(class, "Stopped daemon plugin");
                None
            }
            Ok(Err(e)) => {
                tracing::error!(class, "Error while stopping daemon plugin: {:#}", e);
                Some(format!("{e:#}"))
            }
            Err(_) => {
                tracing::error!(class, "Daemon plugin panicked while stopping");
                Some("panicked".to_string())
            }
        };
        if let Some(message) = message {
            failures.push(PluginError::DaemonStop {
                class: class.to_string(),
                message,
            });
        }
        // Detach: the thread ends when `run` returns.
        drop(entry.thread);
    }
    failures
}
