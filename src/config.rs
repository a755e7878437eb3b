//! Host configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/plugins.toml` (base configuration)
//! 2. Environment variables prefixed with `BIOPLUG_`; nested keys are
//!    separated by a double underscore
//!
//! Every section has defaults, so a missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use bioimage_plugins::config::HostConfig;
//!
//! let config = HostConfig::load()?;
//! println!("Plugin directory: {}", config.discovery.plugin_dir.display());
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::logging::OutputFormat;
use crate::plugin::ScanOptions;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/plugins.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BIOPLUG_";

/// Top-level host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Plugin discovery settings
    pub discovery: DiscoveryConfig,
    /// Daemon start-up settings
    pub daemons: DaemonConfig,
    /// Plugin directory watching
    pub hot_reload: HotReloadConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "bioimage-plugins".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Plugin discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directory scanned for plugin archives
    pub plugin_dir: PathBuf,
    /// Package every plugin class lives under
    pub package: String,
    /// Descend into subdirectories of the plugin directory
    pub recursive: bool,
    /// File extensions treated as archives
    pub archive_extensions: Vec<String>,
    /// Only load builtin classes
    pub archives_disabled: bool,
    /// Report per-class load failures
    pub log_errors: bool,
    /// Archive entries above this size are never read
    pub max_entry_bytes: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let scan = ScanOptions::default();
        Self {
            plugin_dir: PathBuf::from("plugins"),
            package: "plugins".to_string(),
            recursive: scan.recursive,
            archive_extensions: scan.extensions,
            archives_disabled: false,
            log_errors: true,
            max_entry_bytes: scan.max_entry_bytes,
        }
    }
}

impl DiscoveryConfig {
    /// Scan options for the archive loader.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            recursive: self.recursive,
            extensions: self.archive_extensions.clone(),
            max_entry_bytes: self.max_entry_bytes,
        }
    }
}

/// Daemon start-up configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Start daemons after each discovery pass
    pub autostart: bool,
    /// Daemon class names that are never started
    pub inactive: BTreeSet<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            inactive: BTreeSet::new(),
        }
    }
}

/// Plugin directory watching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Watch the plugin directory (needs the `plugins_hot_reload` feature)
    pub enabled: bool,
    /// Quiet period before a burst of file events triggers a reload
    pub debounce_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 500,
        }
    }
}

impl HostConfig {
    /// Load configuration from `config/plugins.toml` and environment variables
    ///
    /// Example: `BIOPLUG_DISCOVERY__LOG_ERRORS=false`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack: defaults, then the file, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.discovery.package.trim().is_empty() {
            return Err("discovery.package must not be empty".to_string());
        }

        if self.discovery.archive_extensions.is_empty()
            || self
                .discovery
                .archive_extensions
                .iter()
                .any(|ext| ext.is_empty() || ext.starts_with('.'))
        {
            return Err(
                "discovery.archive_extensions must list extensions without a leading dot"
                    .to_string(),
            );
        }

        if self.discovery.max_entry_bytes == 0 {
            return Err("discovery.max_entry_bytes must be greater than zero".to_string());
        }

        Ok(())
    }
}
