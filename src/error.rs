//! Custom error types for the application.
//!
//! This module defines the primary error type, `PluginError`, for the host side of the
//! plugin subsystem. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the kinds of errors that can occur, from configuration issues to archive
//! and class loading problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration sources.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but are
//!   logically incorrect (e.g. an empty plugin package). Caught during validation.
//! - **`Load`**: A class failed to resolve through the current loader. Only surfaces from
//!   explicit calls such as `PluginHost::load_class`.
//! - **`Verification`**: `verify_plugins_are_valid` found a descriptor that no longer loads.
//! - **`DaemonStop`**: A daemon plugin failed or panicked while being stopped.
//! - **`HostStopped`**: The discovery worker is not running.
//! - **`Runtime`**: The host was started outside a tokio runtime.
//! - **`FeatureNotEnabled`**: Functionality compiled out via feature flags.
//! - **`ShutdownFailed`**: Collects the daemon stop failures of `PluginHost::shutdown`.
//!
//! Per-candidate failures during a discovery pass never become a `PluginError`; see
//! [`crate::plugin::LoadError`].

use thiserror::Error;

use crate::plugin::LoadError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PluginError>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Daemon plugin '{class}' did not stop cleanly: {message}")]
    DaemonStop { class: String, message: String },

    #[error("{0}")]
    Verification(String),

    #[error("Plugin host is not running")]
    HostStopped,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<PluginError>),
}

impl From<figment::Error> for PluginError {
    fn from(err: figment::Error) -> Self {
        PluginError::Config(Box::new(err))
    }
}

impl PluginError {
    /// Joins the messages of a shutdown failure.
    pub fn summary(&self) -> String {
        match self {
            PluginError::ShutdownFailed(errors) => {
                let combined = errors
                    .iter()
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Shutdown failed: {combined}")
            }
            other => other.to_string(),
        }
    }
}
