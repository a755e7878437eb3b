//! Native library loading infrastructure using abi_stable.
//!
//! This module provides `NativeLibrary`, the host-side view of a loaded
//! plugin library.

use crate::metadata::AbiVersion;
use crate::plugin::{PluginLoadError, PluginLib_Ref};
use abi_stable::library::lib_header_from_path;
use abi_stable::std_types::{RResult, RString};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A loaded native plugin library.
///
/// Note: abi_stable never unloads libraries; dropping this value only drops
/// the host-side bookkeeping.
pub struct NativeLibrary {
    /// The library's root module reference
    lib_ref: PluginLib_Ref,
    /// Classes the library reported at load time
    classes: BTreeSet<String>,
    /// Path the library was loaded from
    path: PathBuf,
}

impl NativeLibrary {
    /// Load a library from a specific path and verify its ABI version.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PluginLoadError> {
        let path = path.as_ref();

        let header = lib_header_from_path(path).map_err(|e| {
            PluginLoadError::LoadFailed(format!("Failed to load library header: {}", e))
        })?;

        let lib_ref = header.init_root_module::<PluginLib_Ref>().map_err(|e| {
            PluginLoadError::LoadFailed(format!("Failed to init root module: {}", e))
        })?;

        let plugin_abi = lib_ref.abi_version()();
        if !plugin_abi.is_compatible_with(&AbiVersion::CURRENT) {
            return Err(PluginLoadError::IncompatibleAbi {
                plugin_version: plugin_abi,
                host_version: AbiVersion::CURRENT,
            });
        }

        let classes = lib_ref
            .list_classes()()
            .iter()
            .map(|name| name.to_string())
            .collect::<BTreeSet<_>>();

        tracing::info!(
            "Loaded plugin library {:?} ({} classes)",
            path,
            classes.len()
        );

        Ok(Self {
            lib_ref,
            classes,
            path: path.to_path_buf(),
        })
    }

    /// Path the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if this library implements a given class
    pub fn has_class(&self, class_name: &str) -> bool {
        self.classes.contains(class_name)
    }

    /// Binary names of all implemented classes
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|s| s.as_str())
    }

    /// Create an instance of a class, returning its handle
    pub fn create_instance(&self, class_name: &str) -> Result<u64, PluginLoadError> {
        if !self.has_class(class_name) {
            return Err(PluginLoadError::UnknownClass(class_name.to_string()));
        }
        convert(self.lib_ref.create_instance()(RString::from(class_name)))
    }

    /// Initialize a daemon instance
    pub fn init(&self, handle: u64) -> Result<(), PluginLoadError> {
        convert(self.lib_ref.init()(handle))
    }

    /// Run an instance on the calling thread
    pub fn run(&self, handle: u64) -> Result<(), PluginLoadError> {
        convert(self.lib_ref.run()(handle))
    }

    /// Ask a running instance to stop
    pub fn stop(&self, handle: u64) -> Result<(), PluginLoadError> {
        convert(self.lib_ref.stop()(handle))
    }

    /// Release an instance handle
    pub fn release(&self, handle: u64) {
        self.lib_ref.release()(handle)
    }
}

fn convert<T>(result: RResult<T, RString>) -> Result<T, PluginLoadError> {
    match result {
        RResult::ROk(value) => Ok(value),
        RResult::RErr(err) => Err(PluginLoadError::CallFailed(err.to_string())),
    }
}

impl std::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("path", &self.path)
            .field("classes", &self.classes)
            .finish_non_exhaustive()
    }
}
