//! # Bioimage Plugins Core Library
//!
//! This crate is the plugin subsystem of a bioimage-analysis desktop application. It finds
//! optional feature modules ("plugins") in archives under a plugin directory and in the
//! host's own builtin class table, keeps the current plugin list, runs long-lived daemon
//! plugins and tells the rest of the application when the list changes. The application
//! (viewers, menus, preference storage) consumes it through [`host::PluginHost`].
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based host configuration (`config/plugins.toml` plus
//!   `BIOPLUG_` environment variables).
//! - **`error`**: The `PluginError` enum for application-level error handling.
//! - **`logging`**: Tracing subscriber set-up.
//! - **`plugin`**: Plugin classes, descriptors, archive manifests and the class loaders
//!   resolving class names to plugins.
//! - **`registry`**: The installed discovery generation (loader plus descriptor list) and
//!   the queries over it.
//! - **`notify`**: Batched "plugin list changed" notification.
//! - **`daemons`**: Start/stop of daemon plugins on their own threads.
//! - **`preferences`**: The disabled-daemon list supplied by the application.
//! - **`discovery`**: Discovery passes and the background worker serializing them.
//! - **`host`**: `PluginHost`, wiring everything together.
//! - **`hot_reload`**: Plugin directory watching (feature `plugins_hot_reload`).

pub mod config;
pub mod daemons;
pub mod discovery;
pub mod error;
pub mod host;
pub mod logging;
pub mod notify;
pub mod plugin;
pub mod preferences;
pub mod registry;

#[cfg(feature = "plugins_hot_reload")]
pub mod hot_reload;

pub use error::{AppResult, PluginError};
pub use host::{PluginHost, PluginHostBuilder, UpdateBatch};
