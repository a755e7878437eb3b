//! Class loaders and load-error classification.
//!
//! A [`ClassLoader`] resolves binary class names to [`PluginClass`] objects.
//! The host always has a [`BuiltinClasses`] table; when archive loading is
//! enabled an [`ArchiveClassLoader`] sits in front of it and delegates to the
//! builtin table first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bioimage_plugin_api::NativeLibrary;
use parking_lot::Mutex;
use tempfile::TempDir;

use super::archive::{scan_directory, ArchiveError, PluginArchive, ScanOptions};
use super::class::{BuiltinClass, ClassInfo, ClassOrigin, PluginClass};
use super::manifest::ClassDefinition;
use super::native::NativeClass;
use super::version::Version;

/// Why a candidate class could not be loaded as a plugin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Class '{0}' not found")]
    NotFound(String),

    #[error("Class '{0}' is not a plugin")]
    NotAPlugin(String),

    #[error("Class '{class}' cannot be loaded: required class '{missing}' not found")]
    MissingDependency { class: String, missing: String },

    #[error("Class '{class}' exhausted resources: {message}")]
    ResourceExhausted { class: String, message: String },

    #[error("Class '{class}' cannot be linked: {message}")]
    Linkage { class: String, message: String },

    #[error("Class '{class}' is invalid: {message}")]
    Invalid { class: String, message: String },
}

impl LoadError {
    pub fn class_name(&self) -> &str {
        match self {
            LoadError::NotFound(class) | LoadError::NotAPlugin(class) => class,
            LoadError::MissingDependency { class, .. }
            | LoadError::ResourceExhausted { class, .. }
            | LoadError::Linkage { class, .. }
            | LoadError::Invalid { class, .. } => class,
        }
    }

    /// Failures that are part of normal discovery and never reported.
    pub fn is_silent(&self) -> bool {
        matches!(self, LoadError::NotFound(_) | LoadError::NotAPlugin(_))
    }

    /// Logs the failure of a discovery candidate.
    ///
    /// Resource exhaustion is always reported; other failures only when
    /// `log_errors` is set.
    pub fn report(&self, log_errors: bool) {
        let class = self.class_name();
        match self {
            LoadError::NotFound(_) | LoadError::NotAPlugin(_) => {
                tracing::trace!(class, "{}", self);
            }
            LoadError::MissingDependency { .. } => {
                if log_errors {
                    tracing::warn!(class, "{}", self);
                }
            }
            LoadError::ResourceExhausted { .. } => {
                tracing::error!(class, "{}. Class '{}' is discarded", self, class);
            }
            LoadError::Linkage { .. } | LoadError::Invalid { .. } => {
                if log_errors {
                    tracing::error!(class, "{}. Class '{}' is discarded", self, class);
                }
            }
        }
    }
}

/// A non-class entry visible through a loader.
#[derive(Clone)]
pub struct Resource {
    name: String,
    source: ResourceSource,
}

#[derive(Clone)]
enum ResourceSource {
    Builtin(Arc<[u8]>),
    Archive(Arc<PluginArchive>),
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> ClassOrigin {
        match &self.source {
            ResourceSource::Builtin(_) => ClassOrigin::Builtin,
            ResourceSource::Archive(archive) => ClassOrigin::Archive(archive.path().to_path_buf()),
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> u64 {
        match &self.source {
            ResourceSource::Builtin(data) => data.len() as u64,
            ResourceSource::Archive(archive) => archive.entry_size(&self.name).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the resource contents.
    pub fn read(&self) -> Result<Vec<u8>, ArchiveError> {
        match &self.source {
            ResourceSource::Builtin(data) => Ok(data.to_vec()),
            ResourceSource::Archive(archive) => archive.read_entry(&self.name),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("origin", &self.origin())
            .field("len", &self.len())
            .finish()
    }
}

/// Resolves binary class names to plugin classes.
pub trait ClassLoader: Send + Sync {
    /// Adds every class name defined under `package` (including
    /// subpackages) to `names`.
    fn find_class_names_in_package(&self, package: &str, names: &mut BTreeSet<String>);

    /// True when the loader has a definition for `class_name`, plugin or not.
    fn defines(&self, class_name: &str) -> bool;

    fn load_class(&self, class_name: &str) -> Result<Arc<dyn PluginClass>, LoadError>;

    fn resource(&self, name: &str) -> Option<Resource>;

    /// Every resource visible through the loader, by name.
    fn loaded_resources(&self) -> BTreeMap<String, Resource>;

    /// Every class successfully loaded so far, by name.
    fn loaded_classes(&self) -> BTreeMap<String, Arc<dyn PluginClass>>;
}

impl fmt::Debug for dyn ClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassLoader")
            .field("loaded_classes", &self.loaded_classes().len())
            .finish_non_exhaustive()
    }
}

/// True when `class_name` lies in `package` or one of its subpackages.
/// The empty package contains everything.
pub fn in_package(class_name: &str, package: &str) -> bool {
    package.is_empty()
        || class_name
            .strip_prefix(package)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Plugin classes compiled into the host.
///
/// # Example
///
/// ```rust,ignore
/// let builtins = BuiltinClasses::new()
///     .register(BuiltinClass::action(info, || Histogram::default()))
///     .register_support("plugins.core.HistogramMath")
///     .add_resource("plugins/core/histogram.png", icon_bytes);
/// ```
#[derive(Clone, Default)]
pub struct BuiltinClasses {
    classes: BTreeMap<String, Arc<BuiltinClass>>,
    support: BTreeSet<String>,
    resources: BTreeMap<String, Arc<[u8]>>,
}

impl BuiltinClasses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin class. A later registration of the same name
    /// replaces the earlier one.
    pub fn register(mut self, class: BuiltinClass) -> Self {
        let name = class.info().class_name.clone();
        if self.classes.insert(name.clone(), Arc::new(class)).is_some() {
            tracing::warn!(class = %name, "Builtin class registered twice, keeping the latest");
        }
        self
    }

    /// Registers a helper class that is not a plugin.
    pub fn register_support(mut self, class_name: impl Into<String>) -> Self {
        self.support.insert(class_name.into());
        self
    }

    pub fn add_resource(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.resources.insert(name.into(), Arc::from(data.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassLoader for BuiltinClasses {
    fn find_class_names_in_package(&self, package: &str, names: &mut BTreeSet<String>) {
        names.extend(
            self.classes
                .keys()
                .chain(self.support.iter())
                .filter(|name| in_package(name, package))
                .cloned(),
        );
    }

    fn defines(&self, class_name: &str) -> bool {
        self.classes.contains_key(class_name) || self.support.contains(class_name)
    }

    fn load_class(&self, class_name: &str) -> Result<Arc<dyn PluginClass>, LoadError> {
        let Some(class) = self.classes.get(class_name) else {
            return Err(if self.support.contains(class_name) {
                LoadError::NotAPlugin(class_name.to_string())
            } else {
                LoadError::NotFound(class_name.to_string())
            });
        };

        check_requirements(class.info(), |name| self.defines(name))?;
        Ok(Arc::clone(class) as Arc<dyn PluginClass>)
    }

    fn resource(&self, name: &str) -> Option<Resource> {
        self.resources.get(name).map(|data| Resource {
            name: name.to_string(),
            source: ResourceSource::Builtin(Arc::clone(data)),
        })
    }

    fn loaded_resources(&self) -> BTreeMap<String, Resource> {
        self.resources
            .keys()
            .filter_map(|name| self.resource(name).map(|r| (name.clone(), r)))
            .collect()
    }

    fn loaded_classes(&self) -> BTreeMap<String, Arc<dyn PluginClass>> {
        self.classes
            .iter()
            .map(|(name, class)| (name.clone(), Arc::clone(class) as Arc<dyn PluginClass>))
            .collect()
    }
}

impl fmt::Debug for BuiltinClasses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinClasses")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("support", &self.support)
            .field("resources", &self.resources.len())
            .finish()
    }
}

fn check_requirements(
    info: &ClassInfo,
    defines: impl Fn(&str) -> bool,
) -> Result<(), LoadError> {
    match info.requires.iter().find(|name| !defines(name)) {
        Some(missing) => Err(LoadError::MissingDependency {
            class: info.class_name.clone(),
            missing: missing.clone(),
        }),
        None => Ok(()),
    }
}

/// Cached outcome of loading an archive's native library.
#[derive(Clone)]
enum LibraryState {
    Loaded(Arc<NativeLibrary>),
    Exhausted(String),
    Failed(String),
}

/// Loads classes from plugin archives, after the builtin table.
///
/// Each loader extracts native libraries into its own temporary directory,
/// removed when the loader is dropped.
pub struct ArchiveClassLoader {
    parent: Arc<BuiltinClasses>,
    archives: Vec<Arc<PluginArchive>>,
    /// Class name to (archive index, class index in the manifest).
    definitions: BTreeMap<String, (usize, usize)>,
    /// Resource name to archive index.
    resources: BTreeMap<String, usize>,
    cache: Mutex<HashMap<String, Arc<dyn PluginClass>>>,
    libraries: Mutex<HashMap<usize, LibraryState>>,
    extract_dir: Mutex<Option<TempDir>>,
}

impl ArchiveClassLoader {
    /// Builds a loader over already opened archives. Earlier archives win
    /// when several define the same class or resource.
    pub fn new(parent: Arc<BuiltinClasses>, archives: Vec<PluginArchive>) -> Self {
        let archives: Vec<Arc<PluginArchive>> = archives.into_iter().map(Arc::new).collect();
        let mut definitions = BTreeMap::new();
        let mut resources = BTreeMap::new();

        for (archive_idx, archive) in archives.iter().enumerate() {
            for (class_idx, class) in archive.manifest().classes.iter().enumerate() {
                if parent.defines(&class.name) {
                    tracing::warn!(
                        class = %class.name,
                        archive = %archive.path().display(),
                        "Class is already defined by the host, archive definition ignored"
                    );
                    continue;
                }
                match definitions.get(&class.name) {
                    Some(&(first, _)) => {
                        let first: &Arc<PluginArchive> = &archives[first];
                        tracing::warn!(
                            class = %class.name,
                            archive = %archive.path().display(),
                            first = %first.path().display(),
                            "Duplicate class definition ignored"
                        );
                    }
                    None => {
                        definitions.insert(class.name.clone(), (archive_idx, class_idx));
                    }
                }
            }
            for name in archive.entry_names() {
                resources.entry(name.to_string()).or_insert(archive_idx);
            }
        }

        Self {
            parent,
            archives,
            definitions,
            resources,
            cache: Mutex::new(HashMap::new()),
            libraries: Mutex::new(HashMap::new()),
            extract_dir: Mutex::new(None),
        }
    }

    /// Scans `dir` for archives and builds a loader over them.
    ///
    /// If the directory cannot be enumerated the error is logged and the
    /// loader only sees the builtin classes.
    pub fn from_directory(parent: Arc<BuiltinClasses>, dir: &Path, options: &ScanOptions) -> Self {
        let archives = match scan_directory(dir, options) {
            Ok(archives) => archives,
            Err(e) => {
                tracing::error!(dir = %dir.display(), "Error loading plugins: {}", e);
                Vec::new()
            }
        };
        Self::new(parent, archives)
    }

    pub fn archives(&self) -> impl Iterator<Item = &Path> {
        self.archives.iter().map(|a| a.path())
    }

    pub fn parent(&self) -> &Arc<BuiltinClasses> {
        &self.parent
    }

    fn definition(&self, class_name: &str) -> Option<(usize, &ClassDefinition)> {
        let &(archive_idx, class_idx) = self.definitions.get(class_name)?;
        self.archives[archive_idx]
            .manifest()
            .classes
            .get(class_idx)
            .map(|def| (archive_idx, def))
    }

    fn resolve(&self, class_name: &str) -> Result<Arc<dyn PluginClass>, LoadError> {
        let (archive_idx, def) = self
            .definition(class_name)
            .ok_or_else(|| LoadError::NotFound(class_name.to_string()))?;
        let archive = &self.archives[archive_idx];

        if !def.plugin {
            return Err(LoadError::NotAPlugin(class_name.to_string()));
        }

        let info = class_info(def, &archive.manifest().archive.author).map_err(|message| {
            LoadError::Invalid {
                class: class_name.to_string(),
                message,
            }
        })?;
        check_requirements(&info, |name| self.defines(name))?;

        let origin = ClassOrigin::Archive(archive.path().to_path_buf());
        if def.needs_implementation() {
            let library = self.library(archive_idx, class_name)?;
            if !library.has_class(class_name) {
                return Err(LoadError::Linkage {
                    class: class_name.to_string(),
                    message: format!(
                        "native library {} does not implement it",
                        library.path().display()
                    ),
                });
            }
            Ok(Arc::new(NativeClass::linked(info, origin, library)))
        } else {
            Ok(Arc::new(NativeClass::declared(info, origin)))
        }
    }

    /// Loads the native library of an archive, once.
    fn library(&self, archive_idx: usize, class_name: &str) -> Result<Arc<NativeLibrary>, LoadError> {
        let mut libraries = self.libraries.lock();
        let state = match libraries.get(&archive_idx) {
            Some(state) => state.clone(),
            None => {
                let state = self.load_library(&self.archives[archive_idx], archive_idx);
                libraries.insert(archive_idx, state.clone());
                state
            }
        };
        drop(libraries);

        match state {
            LibraryState::Loaded(library) => Ok(library),
            LibraryState::Exhausted(message) => Err(LoadError::ResourceExhausted {
                class: class_name.to_string(),
                message,
            }),
            LibraryState::Failed(message) => Err(LoadError::Linkage {
                class: class_name.to_string(),
                message,
            }),
        }
    }

    fn load_library(&self, archive: &PluginArchive, archive_idx: usize) -> LibraryState {
        let Some(entry) = archive.manifest().archive.library.as_deref() else {
            return LibraryState::Failed(format!(
                "archive {} declares no native library",
                archive.path().display()
            ));
        };

        let dest = match self.extraction_dir() {
            Ok(dir) => dir.join(archive_idx.to_string()),
            Err(e) => return LibraryState::Failed(e.to_string()),
        };

        let path = match archive.extract_entry(entry, &dest) {
            Ok(path) => path,
            Err(e @ ArchiveError::EntryTooLarge { .. }) => {
                return LibraryState::Exhausted(e.to_string())
            }
            Err(e) => return LibraryState::Failed(e.to_string()),
        };

        match NativeLibrary::load(&path) {
            Ok(library) => {
                tracing::info!(
                    archive = %archive.path().display(),
                    classes = library.classes().count(),
                    "Linked native plugin library"
                );
                LibraryState::Loaded(Arc::new(library))
            }
            Err(e) => LibraryState::Failed(e.to_string()),
        }
    }

    fn extraction_dir(&self) -> std::io::Result<PathBuf> {
        let mut dir = self.extract_dir.lock();
        if dir.is_none() {
            *dir = Some(
                tempfile::Builder::new()
                    .prefix("bioimage-plugins-")
                    .tempdir()?,
            );
        }
        dir.as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| std::io::Error::other("extraction directory unavailable"))
    }
}

/// Builds class metadata from a manifest entry; fails on a bad version.
fn class_info(def: &ClassDefinition, archive_author: &str) -> Result<ClassInfo, String> {
    let version = Version::parse(&def.version)
        .ok_or_else(|| format!("malformed version '{}'", def.version))?;
    let mut info = ClassInfo::new(def.name.clone(), def.display_name(), version)
        .with_kind(def.kind)
        .with_shape(def.shape)
        .with_author(def.author.as_deref().unwrap_or(archive_author))
        .with_description(def.description.clone());
    info.bundled = def.bundled;
    info.implements = def.implements.clone();
    info.requires = def.requires.clone();
    Ok(info)
}

impl ClassLoader for ArchiveClassLoader {
    fn find_class_names_in_package(&self, package: &str, names: &mut BTreeSet<String>) {
        self.parent.find_class_names_in_package(package, names);
        names.extend(
            self.definitions
                .keys()
                .filter(|name| in_package(name, package))
                .cloned(),
        );
    }

    fn defines(&self, class_name: &str) -> bool {
        self.parent.defines(class_name) || self.definitions.contains_key(class_name)
    }

    fn load_class(&self, class_name: &str) -> Result<Arc<dyn PluginClass>, LoadError> {
        if self.parent.defines(class_name) {
            return self.parent.load_class(class_name);
        }
        if let Some(class) = self.cache.lock().get(class_name) {
            return Ok(Arc::clone(class));
        }

        let class = self.resolve(class_name)?;
        self.cache
            .lock()
            .insert(class_name.to_string(), Arc::clone(&class));
        Ok(class)
    }

    fn resource(&self, name: &str) -> Option<Resource> {
        self.parent.resource(name).or_else(|| {
            self.resources.get(name).map(|&idx| Resource {
                name: name.to_string(),
                source: ResourceSource::Archive(Arc::clone(&self.archives[idx])),
            })
        })
    }

    fn loaded_resources(&self) -> BTreeMap<String, Resource> {
        let mut all = self.parent.loaded_resources();
        for name in self.resources.keys() {
            if !all.contains_key(name) {
                if let Some(resource) = self.resource(name) {
                    all.insert(name.clone(), resource);
                }
            }
        }
        all
    }

    fn loaded_classes(&self) -> BTreeMap<String, Arc<dyn PluginClass>> {
        let mut all = self.parent.loaded_classes();
        all.extend(
            self.cache
                .lock()
                .iter()
                .map(|(name, class)| (name.clone(), Arc::clone(class))),
        );
        all
    }
}

impl fmt::Debug for ArchiveClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveClassLoader")
            .field("archives", &self.archives.len())
            .field("definitions", &self.definitions.len())
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}
