//! Plugin directory watching for development.
//!
//! Watches the plugin directory and requests a discovery pass when an
//! archive is added, rewritten or removed.
//!
//! # Feature Gate
//!
//! This module is only available with the `plugins_hot_reload` feature:
//! ```bash
//! cargo build --features plugins_hot_reload
//! ```
//!
//! # Notes
//!
//! - Only archive files (by configured extension) trigger a reload
//! - Bursts of events are debounced into a single `reload_async()`
//! - Reload requests made inside an update batch are deferred as usual

use anyhow::Result;
use notify::{
    event::ModifyKind, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::host::PluginHost;

/// Watches plugin directories and asks the host to reload.
pub struct PluginWatcher {
    host: PluginHost,
    extensions: Vec<String>,
    debounce: Duration,
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
}

impl PluginWatcher {
    /// Creates a watcher reloading `host` after `debounce` of quiet
    /// following the last archive event.
    pub fn new(host: PluginHost, extensions: Vec<String>, debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(100);

        let watcher = notify::recommended_watcher(move |res| {
            // Called on the notify thread, outside the runtime.
            let _ = tx.blocking_send(res);
        })?;

        Ok(Self {
            host,
            extensions,
            debounce,
            watcher,
            rx,
        })
    }

    /// Starts watching a directory for archive changes.
    pub fn watch<P: AsRef<Path>>(&mut self, path: P, recursive: bool) -> Result<()> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher.watch(path.as_ref(), mode)?;
        tracing::info!("Plugin hot-reload watching: {}", path.as_ref().display());
        Ok(())
    }

    /// Processes file system events until the task is aborted.
    pub async fn run(mut self) {
        tracing::info!("Plugin hot-reload started");
        let mut deadline: Option<Instant> = None;

        loop {
            let quiet = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(Ok(event)) => {
                        if is_archive_event(&event, &self.extensions) {
                            tracing::debug!(paths = ?event.paths, "Plugin archive changed");
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(Err(e)) => tracing::warn!("File watcher error: {}", e),
                    None => break,
                },
                _ = quiet => {
                    deadline = None;
                    tracing::info!("Plugin archives changed, reloading plugin list");
                    self.host.reload_async();
                }
            }
        }

        tracing::info!("Plugin hot-reload stopped");
    }
}

/// True for create, write, rename and remove events touching an archive.
pub fn is_archive_event(event: &Event, extensions: &[String]) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    );
    relevant_kind
        && event.paths.iter().any(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        })
}

/// Watches the host's plugin directory using its configuration.
///
/// # Returns
/// A join handle for the background task; abort it to stop watching.
pub fn start_hot_reload(host: &PluginHost) -> Result<tokio::task::JoinHandle<()>> {
    let config = host.config();
    let mut watcher = PluginWatcher::new(
        host.clone(),
        config.discovery.archive_extensions.clone(),
        Duration::from_millis(config.hot_reload.debounce_ms),
    )?;

    let dir = host.plugin_dir().to_path_buf();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    watcher.watch(&dir, config.discovery.recursive)?;

    Ok(tokio::spawn(watcher.run()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        vec!["zip".to_string(), "plugin".to_string()]
    }

    fn host_in(dir: &Path) -> PluginHost {
        let mut config = HostConfig::default();
        config.discovery.plugin_dir = dir.to_path_buf();
        PluginHost::builder(config).start().unwrap()
    }

    #[test]
    fn test_archive_event_filter() {
        let archive = PathBuf::from("plugins/acme.zip");
        let other = PathBuf::from("plugins/readme.txt");

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(archive.clone());
        assert!(is_archive_event(&created, &extensions()));

        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("plugins/ACME.PLUGIN"));
        assert!(is_archive_event(&written, &extensions()));

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(archive.clone());
        assert!(is_archive_event(&removed, &extensions()));

        let touched =
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)))
                .add_path(archive);
        assert!(!is_archive_event(&touched, &extensions()));

        let text = Event::new(EventKind::Create(CreateKind::File)).add_path(other);
        assert!(!is_archive_event(&text, &extensions()));
    }

    #[tokio::test]
    async fn test_watch_nonexistent_path() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher =
            PluginWatcher::new(host_in(temp_dir.path()), extensions(), Duration::from_millis(10))
                .unwrap();
        let result = watcher.watch("/nonexistent/path/that/does/not/exist", false);
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_archive_triggers_reload() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = HostConfig::default();
        config.discovery.plugin_dir = temp_dir.path().to_path_buf();
        config.hot_reload.debounce_ms = 50;
        let host = PluginHost::builder(config).start().unwrap();
        host.prepare().await.unwrap();
        let first = host.current().number();

        let handle = start_hot_reload(&host).unwrap();
        let mut changes = host.subscribe();
        crate::plugin::archive::testing::write_archive(
            &temp_dir.path().join("late.zip"),
            Some(
                r#"
[archive]
name = "Late"

[[class]]
name = "plugins.late.Palette"
kind = "library"
"#,
            ),
            &[],
        );

        // A pass may catch the archive half written; wait for the one that sees it.
        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = changes.recv().await.unwrap();
                if host.current().plugin_by_class("plugins.late.Palette").is_some() {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert!(event.generation > first);

        handle.abort();
        host.shutdown().await.unwrap();
    }
}
