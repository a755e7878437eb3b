//! FFI-stable plugin API for bioimage-plugins native libraries.
//!
#![allow(unsafe_code)] // Plugin API uses unsafe for FFI - intentional
//! This crate provides the ABI-stable interface for native plugin libraries
//! using `abi_stable`. A library exports a root module via `get_root_module()`
//! that lists the plugin classes it implements and drives their instances
//! through opaque handles.
//!
//! # Architecture
//!
//! ```text
//! PluginHost (bioimage-plugins)
//! ├── BuiltinClasses (compiled into the host)
//! └── ArchiveClassLoader
//!     └── NativeLibrary (abi_stable) ← This crate
//! ```
//!
//! # Creating a Plugin Library
//!
//! ```rust,ignore
//! use bioimage_plugin_api::prelude::*;
//!
//! #[export_root_module]
//! fn get_root_module() -> PluginLib_Ref {
//!     PluginLib { ... }.leak_into_prefix()
//! }
//! ```

pub mod loader;
pub mod metadata;
pub mod plugin;

pub use loader::*;
pub use metadata::*;
pub use plugin::*;

/// Prelude for plugin authors
pub mod prelude {
    pub use crate::loader::NativeLibrary;
    pub use crate::metadata::AbiVersion;
    pub use crate::plugin::{PluginLib, PluginLibRef, PluginLib_Ref, PluginLoadError};
    pub use abi_stable::export_root_module;
    pub use abi_stable::library::RootModule;
    pub use abi_stable::prefix_type::PrefixTypeTrait;
    pub use abi_stable::sabi_extern_fn;
    pub use abi_stable::std_types::{RResult, RString, RVec};
    pub use abi_stable::StableAbi;
}

/// Re-export abi_stable for plugin convenience
pub use abi_stable;
