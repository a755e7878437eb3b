//! Plugin classes, descriptors and the loaders that discover them.
//!
//! # Architecture
//!
//! ```text
//! plugins/                 ArchiveClassLoader
//! ├── acme.zip   ───────►  ├── parent: BuiltinClasses (checked first)
//! │   ├── plugin.toml      ├── definitions from every manifest
//! │   └── lib/libacme.so   └── native libraries, extracted on demand
//! └── shapes.plugin
//! ```
//!
//! A discovery pass asks the loader for every class name under the plugin
//! package and keeps the ones that load as plugins, wrapping each in a
//! [`PluginDescriptor`].

pub mod archive;
pub mod class;
pub mod descriptor;
pub mod loader;
pub mod manifest;
pub mod native;
pub mod version;

pub use archive::{find_archives, scan_directory, ArchiveError, PluginArchive, ScanOptions};
pub use class::{
    ActionPlugin, BuiltinClass, ClassInfo, ClassOrigin, ClassShape, DaemonPlugin, PluginClass,
    PluginInstance, PluginKind,
};
pub use descriptor::{
    compare_by_name, find_by_class_name, find_by_ident, sort_by_name, PluginDescriptor,
    PluginIdent,
};
pub use loader::{in_package, ArchiveClassLoader, BuiltinClasses, ClassLoader, LoadError, Resource};
pub use manifest::{ArchiveManifest, ClassDefinition, ManifestError};
pub use native::NativeClass;
pub use version::Version;
