//! CLI Entry Point for bioimage-plugins
//!
//! Provides command-line interface for:
//! - Listing the plugins found in the plugin directory
//! - Inspecting and running daemon plugins
//! - Verifying that every discovered plugin still loads
//!
//! # Usage
//!
//! List actionable plugins, bundled ones included:
//! ```bash
//! bioimage-plugins list --actionable --bundled
//! ```
//!
//! Run daemons until Ctrl+C, reloading when archives change:
//! ```bash
//! bioimage-plugins --config config/plugins.toml run --watch
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use bioimage_plugins::config::{HostConfig, DEFAULT_CONFIG_PATH};
use bioimage_plugins::host::PluginHost;
use bioimage_plugins::logging;
use bioimage_plugins::plugin::PluginDescriptor;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser)]
#[command(name = "bioimage-plugins")]
#[command(about = "Plugin discovery and daemon host", long_about = None)]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered plugins
    List {
        /// Include bundled plugins
        #[arg(long)]
        bundled: bool,

        /// Only plugins that can be invoked as tools
        #[arg(long)]
        actionable: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show daemon plugins and whether they are enabled
    Daemons,

    /// Check that every discovered plugin loads
    Verify,

    /// Start the host and keep daemons running until Ctrl+C
    Run {
        /// Reload when plugin archives change (needs the plugins_hot_reload feature)
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Serialize)]
struct PluginRow<'a> {
    class: &'a str,
    name: &'a str,
    version: String,
    kind: String,
    bundled: bool,
    archive: Option<String>,
}

impl<'a> From<&'a PluginDescriptor> for PluginRow<'a> {
    fn from(plugin: &'a PluginDescriptor) -> Self {
        Self {
            class: plugin.class_name(),
            name: plugin.name(),
            version: plugin.version().to_string(),
            kind: plugin.kind().to_string(),
            bundled: plugin.is_bundled(),
            archive: plugin.archive_path().map(|p| p.display().to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = HostConfig::load_from(&cli.config)
        .with_context(|| format!("cannot load configuration from {}", cli.config.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let host = PluginHost::builder(config).start()?;
    let result = match cli.command {
        Commands::List {
            bundled,
            actionable,
            json,
        } => list(&host, bundled, actionable, json).await,
        Commands::Daemons => daemons(&host).await,
        Commands::Verify => verify(&host).await,
        Commands::Run { watch } => run(&host, watch).await,
    };

    if let Err(e) = host.shutdown().await {
        tracing::error!("{}", e.summary());
    }
    result
}

async fn list(host: &PluginHost, bundled: bool, actionable: bool, json: bool) -> Result<()> {
    let plugins = if actionable {
        host.actionable_plugins(bundled).await
    } else {
        host.plugins(bundled).await
    };

    if json {
        let rows: Vec<PluginRow<'_>> = plugins.iter().map(PluginRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if plugins.is_empty() {
        println!("No plugins found in {}", host.plugin_dir().display());
        return Ok(());
    }
    for plugin in &plugins {
        let origin = plugin
            .archive_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "builtin".to_string());
        println!(
            "{:<32} {:<10} {:<8} {:<48} {}",
            plugin.name(),
            plugin.version().to_string(),
            plugin.kind().to_string(),
            plugin.class_name(),
            origin
        );
    }
    println!();
    println!("{} plugin(s), generation {}", plugins.len(), host.current().number());
    Ok(())
}

async fn daemons(host: &PluginHost) -> Result<()> {
    let inactive = &host.config().daemons.inactive;
    let daemons = host.daemon_plugins().await;
    if daemons.is_empty() {
        println!("No daemon plugins found");
        return Ok(());
    }
    for daemon in &daemons {
        let state = if inactive.contains(daemon.class_name()) {
            "disabled"
        } else {
            "enabled"
        };
        println!("{:<32} {:<10} {}", daemon.name(), state, daemon.class_name());
    }
    Ok(())
}

async fn verify(host: &PluginHost) -> Result<()> {
    let plugins = host.plugins(true).await;
    host.verify_plugins_are_valid(&plugins)?;
    println!("✅ {} plugin(s) verified", plugins.len());
    Ok(())
}

async fn run(host: &PluginHost, watch: bool) -> Result<()> {
    host.prepare().await?;
    let active = host.active_daemons();
    println!("🚀 Plugin host running with {} daemon(s)", active.len());
    for daemon in &active {
        println!("   - {}", daemon.name());
    }

    let watcher = watcher_for(host, watch)?;

    println!("Press Ctrl+C to stop");
    signal::ctrl_c().await?;
    println!("\n👋 Shutting down...");

    if let Some(handle) = watcher {
        handle.abort();
    }
    Ok(())
}

/// Starts the plugin directory watcher when `--watch` is given or the
/// configuration enables hot reload. Only an explicit `--watch` makes a
/// missing watcher an error.
fn watcher_for(
    host: &PluginHost,
    explicit: bool,
) -> Result<Option<tokio::task::JoinHandle<()>>> {
    if explicit {
        return start_watcher(host);
    }
    if !host.config().hot_reload.enabled {
        return Ok(None);
    }
    match start_watcher(host) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            tracing::warn!("Hot reload enabled in configuration but not started: {:#}", e);
            Ok(None)
        }
    }
}

#[cfg(feature = "plugins_hot_reload")]
fn start_watcher(host: &PluginHost) -> Result<Option<tokio::task::JoinHandle<()>>> {
    Ok(Some(bioimage_plugins::hot_reload::start_hot_reload(host)?))
}

#[cfg(not(feature = "plugins_hot_reload"))]
fn start_watcher(_host: &PluginHost) -> Result<Option<tokio::task::JoinHandle<()>>> {
    Err(bioimage_plugins::error::PluginError::FeatureNotEnabled(
        "plugins_hot_reload".to_string(),
    )
    .into())
}
