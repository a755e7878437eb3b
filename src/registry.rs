//! The plugin registry: the last installed discovery generation.
//!
//! A [`Generation`] pairs the class loader of a discovery pass with the
//! descriptors it produced. The registry swaps whole generations, so a
//! reader never sees descriptors from one pass with the loader of another.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::plugin::{
    find_by_class_name, find_by_ident, BuiltinClasses, ClassLoader, LoadError, PluginClass,
    PluginDescriptor, PluginIdent, Resource,
};

/// Which descriptors [`Generation::plugins_implementing`] accepts besides
/// concrete, non-bundled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginFilter {
    pub bundled: bool,
    pub abstract_classes: bool,
    pub interfaces: bool,
}

impl Default for PluginFilter {
    fn default() -> Self {
        Self {
            bundled: false,
            abstract_classes: false,
            interfaces: true,
        }
    }
}

impl PluginFilter {
    fn accepts(&self, plugin: &PluginDescriptor) -> bool {
        (self.abstract_classes || !plugin.is_abstract())
            && (self.interfaces || !plugin.is_interface())
            && (self.bundled || !plugin.is_bundled())
    }
}

/// The loader and descriptor list installed by one discovery pass.
pub struct Generation {
    number: u64,
    loader: Arc<dyn ClassLoader>,
    plugins: Vec<PluginDescriptor>,
}

impl Generation {
    /// Creates a generation. `plugins` should already be sorted by name.
    pub fn new(number: u64, loader: Arc<dyn ClassLoader>, plugins: Vec<PluginDescriptor>) -> Self {
        Self {
            number,
            loader,
            plugins,
        }
    }

    /// The state before any discovery pass: no loader content, no plugins.
    pub fn empty() -> Self {
        Self::new(0, Arc::new(BuiltinClasses::new()), Vec::new())
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn loader(&self) -> &Arc<dyn ClassLoader> {
        &self.loader
    }

    /// All loaded plugins, optionally without bundled ones.
    pub fn plugins(&self, want_bundled: bool) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter(|p| want_bundled || !p.is_bundled())
            .cloned()
            .collect()
    }

    /// Plugins implementing `capability`, filtered by shape and bundling.
    pub fn plugins_implementing(
        &self,
        capability: &str,
        filter: PluginFilter,
    ) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter(|p| p.implements(capability) && filter.accepts(p))
            .cloned()
            .collect()
    }

    /// Plugins that can be launched from the application menus.
    pub fn actionable_plugins(&self, want_bundled: bool) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter(|p| p.is_actionable() && (want_bundled || !p.is_bundled()))
            .cloned()
            .collect()
    }

    /// Concrete daemon plugins.
    pub fn daemon_plugins(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter(|p| p.is_daemon())
            .cloned()
            .collect()
    }

    pub fn plugin(&self, ident: &PluginIdent, accept_newer: bool) -> Option<PluginDescriptor> {
        find_by_ident(&self.plugins, ident, accept_newer).cloned()
    }

    pub fn plugin_by_class(&self, class_name: &str) -> Option<PluginDescriptor> {
        find_by_class_name(&self.plugins, class_name).cloned()
    }

    /// True when a plugin matching `ident` is loaded.
    pub fn is_loaded(&self, ident: &PluginIdent, accept_newer: bool) -> bool {
        find_by_ident(&self.plugins, ident, accept_newer).is_some()
    }

    pub fn plugin_class(&self, class_name: &str) -> Option<Arc<dyn PluginClass>> {
        find_by_class_name(&self.plugins, class_name).map(|p| Arc::clone(p.class()))
    }

    /// Resolves any class, plugin or not, through this generation's loader.
    pub fn load_class(&self, class_name: &str) -> Result<Arc<dyn PluginClass>, LoadError> {
        self.loader.load_class(class_name)
    }

    pub fn resource(&self, name: &str) -> Option<Resource> {
        self.loader.resource(name)
    }

    pub fn all_resources(&self) -> BTreeMap<String, Resource> {
        self.loader.loaded_resources()
    }

    pub fn all_classes(&self) -> BTreeMap<String, Arc<dyn PluginClass>> {
        self.loader.loaded_classes()
    }

    /// Checks that each descriptor still resolves to a plugin class.
    ///
    /// Returns a message for the first failure.
    pub fn verify_plugins_are_valid(&self, plugins: &[PluginDescriptor]) -> Result<(), String> {
        for plugin in plugins {
            if let Err(err) = self.loader.load_class(plugin.class_name()) {
                let location = plugin
                    .archive_path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<builtin>".to_string());
                let hint = match err {
                    LoadError::NotAPlugin(_) => {
                        "\nThe class must be declared as a plugin in its archive manifest."
                    }
                    LoadError::NotFound(_) => {
                        "\nVerify you correctly set the class name in your plugin description."
                    }
                    _ => "",
                };
                return Err(format!(
                    "Fatal error while loading '{}' class from {}:\n{}{}",
                    plugin.class_name(),
                    location,
                    err,
                    hint
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

/// Holds the current generation.
#[derive(Debug)]
pub struct PluginRegistry {
    current: RwLock<Arc<Generation>>,
    next_number: AtomicU64,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation::empty())),
            next_number: AtomicU64::new(1),
        }
    }

    /// A consistent view of the current generation.
    pub fn snapshot(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read())
    }

    /// Reserves the number of the next generation. Numbers of abandoned
    /// passes are never reused.
    pub fn next_generation(&self) -> u64 {
        self.next_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Installs `generation` unless a more recent one is already in place.
    /// Returns whether it was installed.
    pub fn install(&self, generation: Generation) -> bool {
        let mut current = self.current.write();
        if generation.number <= current.number {
            tracing::debug!(
                generation = generation.number,
                current = current.number,
                "Discarding stale plugin generation"
            );
            return false;
        }
        tracing::debug!(
            generation = generation.number,
            plugins = generation.plugins.len(),
            "Installed plugin generation"
        );
        *current = Arc::new(generation);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        sort_by_name, BuiltinClass, ClassInfo, ClassShape, DaemonPlugin, PluginKind, Version,
    };

    struct Idle;

    impl DaemonPlugin for Idle {
        fn run(&self) {}

        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn builtins() -> BuiltinClasses {
        let v = Version::new(1, 0, 0);
        BuiltinClasses::new()
            .register(BuiltinClass::library(ClassInfo::new(
                "plugins.core.Viewer",
                "Viewer",
                v.clone(),
            )))
            .register(BuiltinClass::action(
                ClassInfo::new("plugins.core.Crop", "Crop", v.clone()).implementing("ImageTool"),
                || Noop,
            ))
            .register(BuiltinClass::action(
                ClassInfo::new("plugins.core.Helper", "Helper", v.clone())
                    .implementing("ImageTool")
                    .bundled(),
                || Noop,
            ))
            .register(BuiltinClass::action(
                ClassInfo::new("plugins.core.Tool", "Tool", v.clone())
                    .with_shape(ClassShape::Interface)
                    .implementing("ImageTool"),
                || Noop,
            ))
            .register(BuiltinClass::action(
                ClassInfo::new("plugins.core.BaseTool", "Base tool", v.clone())
                    .with_shape(ClassShape::Abstract)
                    .implementing("ImageTool"),
                || Noop,
            ))
            .register(BuiltinClass::daemon(
                ClassInfo::new("plugins.core.Autosave", "Autosave", v),
                || Idle,
            ))
            .register_support("plugins.core.Util")
    }

    struct Noop;

    impl crate::plugin::ActionPlugin for Noop {
        fn run(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn generation(number: u64) -> Generation {
        let loader = Arc::new(builtins());
        let mut plugins: Vec<_> = loader
            .loaded_classes()
            .into_values()
            .map(|class| PluginDescriptor::new(class, number))
            .collect();
        sort_by_name(&mut plugins);
        Generation::new(number, loader, plugins)
    }

    #[test]
    fn test_empty_generation() {
        let registry = PluginRegistry::new();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.number(), 0);
        assert!(snapshot.plugins(true).is_empty());
    }

    #[test]
    fn test_bundled_filtering() {
        let gen = generation(1);
        assert_eq!(gen.plugins(true).len(), 6);
        assert_eq!(gen.plugins(false).len(), 5);
    }

    #[test]
    fn test_plugins_implementing_default_filter() {
        let gen = generation(1);
        let names: Vec<_> = gen
            .plugins_implementing("ImageTool", PluginFilter::default())
            .iter()
            .map(|p| p.class_name().to_string())
            .collect();
        assert_eq!(names, vec!["plugins.core.Crop", "plugins.core.Tool"]);

        let everything = PluginFilter {
            bundled: true,
            abstract_classes: true,
            interfaces: true,
        };
        assert_eq!(gen.plugins_implementing("ImageTool", everything).len(), 4);
    }

    #[test]
    fn test_actionable_and_daemon_plugins() {
        let gen = generation(1);
        let actionable = gen.actionable_plugins(false);
        assert_eq!(actionable.len(), 1);
        assert_eq!(actionable[0].class_name(), "plugins.core.Crop");
        assert_eq!(gen.actionable_plugins(true).len(), 2);

        let daemons = gen.daemon_plugins();
        assert_eq!(daemons.len(), 1);
        assert_eq!(daemons[0].kind(), PluginKind::Daemon);
    }

    #[test]
    fn test_lookups() {
        let gen = generation(1);
        assert!(gen.plugin_class("plugins.core.Crop").is_some());
        assert!(gen.plugin_by_class("plugins.core.Util").is_none());
        assert!(matches!(
            gen.load_class("plugins.core.Util"),
            Err(LoadError::NotAPlugin(_))
        ));

        let ident = PluginIdent::new("plugins.core.Crop", Version::new(0, 9, 0));
        assert!(!gen.is_loaded(&ident, false));
        assert!(gen.is_loaded(&ident, true));
        assert_eq!(
            gen.plugin(&ident, true).unwrap().class_name(),
            "plugins.core.Crop"
        );
    }

    #[test]
    fn test_install_swaps_whole_generation() {
        let registry = PluginRegistry::new();
        let first = registry.next_generation();
        let second = registry.next_generation();
        assert!(registry.install(generation(second)));
        assert!(!registry.install(generation(first)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.number(), second);
        assert!(snapshot
            .plugins(true)
            .iter()
            .all(|p| p.generation() == second));
    }

    #[test]
    fn test_verify_reports_first_failure() {
        let gen = generation(1);
        assert!(gen.verify_plugins_are_valid(&gen.plugins(true)).is_ok());

        let other = Arc::new(BuiltinClasses::new().register(BuiltinClass::library(
            ClassInfo::new("plugins.gone.Old", "Old", Version::new(1, 0, 0)),
        )));
        let stale = PluginDescriptor::new(other.load_class("plugins.gone.Old").unwrap(), 1);

        let message = gen.verify_plugins_are_valid(&[stale]).unwrap_err();
        assert!(message.contains("'plugins.gone.Old' class from <builtin>"));
        assert!(message.contains("Verify you correctly set the class name"));
    }
}
