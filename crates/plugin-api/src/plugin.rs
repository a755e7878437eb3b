//! Plugin library root module and entry point definitions.
//!
//! Native libraries export a root module via `get_root_module()` that lists
//! the plugin classes they implement. Instances live inside the library and
//! are addressed by opaque `u64` handles.

#![allow(non_camel_case_types)] // abi_stable generates `*_Ref` types
#![allow(clippy::expl_impl_clone_on_copy)] // StableAbi macro generates Clone impl for Copy type

use crate::metadata::AbiVersion;
use abi_stable::library::RootModule;
use abi_stable::package_version_strings;
use abi_stable::sabi_types::VersionStrings;
use abi_stable::std_types::{RResult, RString, RVec};
use abi_stable::{declare_root_module_statics, StableAbi};

/// The root module that plugin libraries export.
///
/// # Example
///
/// ```rust,ignore
/// use bioimage_plugin_api::prelude::*;
///
/// #[export_root_module]
/// fn get_root_module() -> PluginLib_Ref {
///     PluginLib {
///         abi_version,
///         list_classes,
///         create_instance,
///         init,
///         run,
///         stop,
///         release,
///     }
///     .leak_into_prefix()
/// }
///
/// #[sabi_extern_fn]
/// fn abi_version() -> AbiVersion {
///     AbiVersion::CURRENT
/// }
///
/// #[sabi_extern_fn]
/// fn list_classes() -> RVec<RString> {
///     RVec::from(vec![RString::from("plugins.acme.Denoise")])
/// }
/// ```
#[repr(C)]
#[derive(StableAbi)]
#[sabi(kind(Prefix(prefix_ref = PluginLib_Ref)))]
#[sabi(missing_field(panic))]
pub struct PluginLib {
    /// Get the ABI version this library was compiled with
    pub abi_version: extern "C" fn() -> AbiVersion,

    /// Binary names of the plugin classes implemented by this library
    #[sabi(last_prefix_field)]
    pub list_classes: extern "C" fn() -> RVec<RString>,

    /// Create an instance of a class, returning its handle
    pub create_instance: extern "C" fn(class_name: RString) -> RResult<u64, RString>,

    /// Initialize a daemon instance before its thread starts
    pub init: extern "C" fn(handle: u64) -> RResult<(), RString>,

    /// Run an instance (blocks until a daemon is stopped)
    pub run: extern "C" fn(handle: u64) -> RResult<(), RString>,

    /// Ask a running daemon instance to stop
    pub stop: extern "C" fn(handle: u64) -> RResult<(), RString>,

    /// Release an instance; the handle is invalid afterwards
    pub release: extern "C" fn(handle: u64),
}

impl RootModule for PluginLib_Ref {
    declare_root_module_statics! {PluginLib_Ref}

    const BASE_NAME: &'static str = "bioimage_plugin";
    const NAME: &'static str = "bioimage_plugin";
    const VERSION_STRINGS: VersionStrings = package_version_strings!();
}

impl PluginLib_Ref {
    /// Check if this library's ABI is compatible with the host
    pub fn is_compatible(&self) -> bool {
        let plugin_version = self.abi_version()();
        plugin_version.is_compatible_with(&AbiVersion::CURRENT)
    }
}

/// Type alias for the library reference type
pub type PluginLibRef = PluginLib_Ref;

/// Error type for native library loading
#[derive(Debug, Clone)]
pub enum PluginLoadError {
    /// The library file could not be loaded
    LoadFailed(String),
    /// The library's ABI version is incompatible
    IncompatibleAbi {
        plugin_version: AbiVersion,
        host_version: AbiVersion,
    },
    /// The library does not implement the requested class
    UnknownClass(String),
    /// A call into the library reported an error
    CallFailed(String),
}

impl std::fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadFailed(msg) => write!(f, "Failed to load plugin library: {}", msg),
            Self::IncompatibleAbi {
                plugin_version,
                host_version,
            } => write!(
                f,
                "Plugin ABI version {} is incompatible with host version {}",
                plugin_version, host_version
            ),
            Self::UnknownClass(name) => {
                write!(f, "Library does not implement class '{}'", name)
            }
            Self::CallFailed(msg) => write!(f, "Plugin call failed: {}", msg),
        }
    }
}

impl std::error::Error for PluginLoadError {}
