//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bioimage_plugins::config::HostConfig;
use bioimage_plugins::plugin::{BuiltinClass, ClassInfo, DaemonPlugin, Version};
use zip::write::SimpleFileOptions;

/// Writes a plugin archive with a `plugin.toml` manifest and extra entries.
pub fn write_archive(path: &Path, manifest: &str, entries: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    zip.start_file("plugin.toml", options).unwrap();
    zip.write_all(manifest.as_bytes()).unwrap();
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Configuration pointing discovery at `dir`.
pub fn config_for(dir: &Path) -> HostConfig {
    let mut config = HostConfig::default();
    config.discovery.plugin_dir = dir.to_path_buf();
    config
}

pub fn version(s: &str) -> Version {
    Version::parse(s).unwrap()
}

/// Counters shared between a test and the daemons it starts.
#[derive(Default)]
pub struct DaemonProbe {
    pub running: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
}

impl DaemonProbe {
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// A daemon that loops until asked to stop.
pub struct PollingDaemon {
    probe: Arc<DaemonProbe>,
    stop: AtomicBool,
}

impl DaemonPlugin for PollingDaemon {
    fn run(&self) {
        self.probe.started.fetch_add(1, Ordering::SeqCst);
        self.probe.running.fetch_add(1, Ordering::SeqCst);
        while !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.probe.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.probe.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A builtin daemon class reporting to `probe`.
pub fn polling_daemon(class_name: &str, probe: &Arc<DaemonProbe>) -> BuiltinClass {
    let probe = Arc::clone(probe);
    let name = class_name.rsplit('.').next().unwrap_or(class_name).to_string();
    BuiltinClass::daemon(ClassInfo::new(class_name, name, version("1.0.0")), move || {
        PollingDaemon {
            probe: Arc::clone(&probe),
            stop: AtomicBool::new(false),
        }
    })
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

pub fn plugin_dir(root: &Path) -> PathBuf {
    root.join("plugins")
}
