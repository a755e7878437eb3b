//! Plugin descriptors: immutable views of loaded plugin classes.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::class::{ClassInfo, ClassShape, PluginClass, PluginInstance, PluginKind};
use super::version::Version;

/// Identity of a plugin: class name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginIdent {
    pub class_name: String,
    pub version: Version,
}

impl PluginIdent {
    pub fn new(class_name: impl Into<String>, version: Version) -> Self {
        Self {
            class_name: class_name.into(),
            version,
        }
    }

    /// Same class with a version greater than or equal to `other`'s.
    pub fn is_newer_or_equal(&self, other: &PluginIdent) -> bool {
        self.class_name == other.class_name && self.version >= other.version
    }
}

impl fmt::Display for PluginIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.class_name, self.version)
    }
}

/// A loaded plugin as seen by the rest of the application.
///
/// Descriptors are created by a discovery pass and never mutated; a reload
/// replaces the whole list.
#[derive(Clone)]
pub struct PluginDescriptor {
    class: Arc<dyn PluginClass>,
    ident: PluginIdent,
    generation: u64,
}

impl PluginDescriptor {
    pub fn new(class: Arc<dyn PluginClass>, generation: u64) -> Self {
        let info = class.info();
        let ident = PluginIdent::new(info.class_name.clone(), info.version.clone());
        Self {
            class,
            ident,
            generation,
        }
    }

    pub fn ident(&self) -> &PluginIdent {
        &self.ident
    }

    pub fn class_name(&self) -> &str {
        &self.ident.class_name
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn version(&self) -> &Version {
        &self.ident.version
    }

    pub fn info(&self) -> &ClassInfo {
        self.class.info()
    }

    pub fn kind(&self) -> PluginKind {
        self.info().kind
    }

    pub fn is_bundled(&self) -> bool {
        self.info().bundled
    }

    pub fn is_abstract(&self) -> bool {
        self.info().shape == ClassShape::Abstract
    }

    pub fn is_interface(&self) -> bool {
        self.info().shape == ClassShape::Interface
    }

    pub fn is_concrete(&self) -> bool {
        self.info().shape == ClassShape::Concrete
    }

    /// Can be launched from the application menus.
    pub fn is_actionable(&self) -> bool {
        self.kind() == PluginKind::Action && self.is_concrete()
    }

    /// Can be started as a daemon.
    pub fn is_daemon(&self) -> bool {
        self.kind() == PluginKind::Daemon && self.is_concrete()
    }

    pub fn implements(&self, capability: &str) -> bool {
        self.info().implements(capability)
    }

    /// Archive the class was loaded from, if any.
    pub fn archive_path(&self) -> Option<&Path> {
        self.class.origin().archive_path()
    }

    /// Discovery generation that produced this descriptor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn class(&self) -> &Arc<dyn PluginClass> {
        &self.class
    }

    pub fn instantiate(&self) -> anyhow::Result<PluginInstance> {
        self.class.instantiate()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("ident", &self.ident)
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("generation", &self.generation)
            .finish()
    }
}

impl PartialEq for PluginDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.ident == other.ident && self.generation == other.generation
    }
}

/// Orders descriptors by display name (case-insensitive), then class name.
pub fn compare_by_name(a: &PluginDescriptor, b: &PluginDescriptor) -> Ordering {
    a.name()
        .to_lowercase()
        .cmp(&b.name().to_lowercase())
        .then_with(|| a.class_name().cmp(b.class_name()))
}

/// Sorts a descriptor list the way menus present it.
pub fn sort_by_name(plugins: &mut [PluginDescriptor]) {
    plugins.sort_by(compare_by_name);
}

/// Finds the descriptor of a class.
pub fn find_by_class_name<'a>(
    plugins: &'a [PluginDescriptor],
    class_name: &str,
) -> Option<&'a PluginDescriptor> {
    plugins.iter().find(|p| p.class_name() == class_name)
}

/// Finds a descriptor matching `ident` exactly, or with `accept_newer` any
/// loaded version of the same class at least as recent.
pub fn find_by_ident<'a>(
    plugins: &'a [PluginDescriptor],
    ident: &PluginIdent,
    accept_newer: bool,
) -> Option<&'a PluginDescriptor> {
    plugins.iter().find(|p| {
        if accept_newer {
            p.ident().is_newer_or_equal(ident)
        } else {
            p.ident() == ident
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::class::BuiltinClass;

    fn descriptor(class_name: &str, name: &str, version: &str) -> PluginDescriptor {
        let info = ClassInfo::new(class_name, name, Version::parse(version).unwrap());
        PluginDescriptor::new(Arc::new(BuiltinClass::library(info)), 1)
    }

    #[test]
    fn test_sort_is_case_insensitive() {
        let mut plugins = vec![
            descriptor("plugins.b.Zeta", "zeta", "1.0"),
            descriptor("plugins.a.Alpha", "Alpha", "1.0"),
            descriptor("plugins.c.Beta", "beta", "1.0"),
        ];
        sort_by_name(&mut plugins);
        let names: Vec<_> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "zeta"]);
    }

    #[test]
    fn test_sort_ties_break_on_class_name() {
        let mut plugins = vec![
            descriptor("plugins.b.Same", "Same", "1.0"),
            descriptor("plugins.a.Same", "same", "1.0"),
        ];
        sort_by_name(&mut plugins);
        assert_eq!(plugins[0].class_name(), "plugins.a.Same");
    }

    #[test]
    fn test_find_by_ident_exact_and_newer() {
        let plugins = vec![descriptor("plugins.a.Tool", "Tool", "1.4.0")];

        let exact = PluginIdent::new("plugins.a.Tool", Version::new(1, 4, 0));
        assert!(find_by_ident(&plugins, &exact, false).is_some());

        let older = PluginIdent::new("plugins.a.Tool", Version::new(1, 2, 0));
        assert!(find_by_ident(&plugins, &older, false).is_none());
        assert!(find_by_ident(&plugins, &older, true).is_some());

        let newer = PluginIdent::new("plugins.a.Tool", Version::new(2, 0, 0));
        assert!(find_by_ident(&plugins, &newer, true).is_none());

        let other = PluginIdent::new("plugins.a.Other", Version::new(1, 0, 0));
        assert!(find_by_ident(&plugins, &other, true).is_none());
    }

    #[test]
    fn test_library_is_neither_actionable_nor_daemon() {
        let d = descriptor("plugins.a.Lib", "Lib", "1.0");
        assert!(!d.is_actionable());
        assert!(!d.is_daemon());
        assert!(d.implements("Library"));
        assert!(d.archive_path().is_none());
        assert_eq!(find_by_class_name(&[d.clone()], "plugins.a.Lib"), Some(&d));
    }
}
