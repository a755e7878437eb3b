//! Plugin classes: the loadable unit a descriptor wraps.
//!
//! A class is identified by its binary name (`plugins.acme.Denoise`) and
//! carries an explicit [`PluginKind`] and [`ClassShape`] fixed when it is
//! registered, either by host code ([`BuiltinClass`]) or by an archive
//! manifest. Instances are produced through [`PluginClass::instantiate`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::version::Version;

/// What a plugin does once instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Tool the user can launch from the application.
    #[default]
    Action,
    /// Long-running plugin started on its own thread.
    Daemon,
    /// Support code for other plugins, no behaviour of its own.
    Library,
}

impl PluginKind {
    /// Capability name every class of this kind implements.
    pub fn capability(self) -> &'static str {
        match self {
            PluginKind::Action => "Action",
            PluginKind::Daemon => "Daemon",
            PluginKind::Library => "Library",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Action => write!(f, "action"),
            PluginKind::Daemon => write!(f, "daemon"),
            PluginKind::Library => write!(f, "library"),
        }
    }
}

/// Whether a class can be instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassShape {
    #[default]
    Concrete,
    Abstract,
    Interface,
}

/// Where a class was defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassOrigin {
    /// Compiled into the host.
    Builtin,
    /// Defined by the manifest of a plugin archive.
    Archive(PathBuf),
}

impl ClassOrigin {
    /// Archive path for archive classes.
    pub fn archive_path(&self) -> Option<&Path> {
        match self {
            ClassOrigin::Builtin => None,
            ClassOrigin::Archive(path) => Some(path),
        }
    }
}

impl fmt::Display for ClassOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassOrigin::Builtin => write!(f, "<builtin>"),
            ClassOrigin::Archive(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Static metadata of a plugin class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    /// Binary name, e.g. `plugins.acme.Denoise`.
    pub class_name: String,
    /// Name shown to users.
    pub name: String,
    pub version: Version,
    pub author: String,
    pub description: String,
    pub kind: PluginKind,
    pub shape: ClassShape,
    /// Packaged as a dependency of another plugin.
    pub bundled: bool,
    /// Capability names in addition to the kind's own.
    pub implements: Vec<String>,
    /// Classes that must be resolvable for this one to load.
    pub requires: Vec<String>,
}

impl ClassInfo {
    /// Creates metadata for a concrete action class.
    pub fn new(class_name: impl Into<String>, name: impl Into<String>, version: Version) -> Self {
        Self {
            class_name: class_name.into(),
            name: name.into(),
            version,
            author: String::new(),
            description: String::new(),
            kind: PluginKind::Action,
            shape: ClassShape::Concrete,
            bundled: false,
            implements: Vec::new(),
            requires: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: PluginKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_shape(mut self, shape: ClassShape) -> Self {
        self.shape = shape;
        self
    }

    /// Marks the class as bundled.
    pub fn bundled(mut self) -> Self {
        self.bundled = true;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds an implemented capability.
    pub fn implementing(mut self, capability: impl Into<String>) -> Self {
        self.implements.push(capability.into());
        self
    }

    /// Adds a required class.
    pub fn requiring(mut self, class_name: impl Into<String>) -> Self {
        self.requires.push(class_name.into());
        self
    }

    /// Package part of the binary name (empty for the default package).
    pub fn package(&self) -> &str {
        self.class_name
            .rsplit_once('.')
            .map(|(package, _)| package)
            .unwrap_or("")
    }

    /// True when the class implements `capability`, either through its kind
    /// or explicitly.
    pub fn implements(&self, capability: &str) -> bool {
        self.kind.capability() == capability || self.implements.iter().any(|c| c == capability)
    }
}

/// A tool plugin invoked on demand.
pub trait ActionPlugin: Send {
    /// Executes the tool.
    fn run(&mut self) -> anyhow::Result<()>;
}

/// A long-running plugin.
///
/// `run` executes on a dedicated thread and must return once `stop` has
/// been called from another thread.
pub trait DaemonPlugin: Send + Sync {
    /// Called once before the daemon thread starts.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&self);

    fn stop(&self) -> anyhow::Result<()>;
}

/// A freshly created plugin object.
pub enum PluginInstance {
    Action(Box<dyn ActionPlugin>),
    Daemon(Arc<dyn DaemonPlugin>),
    /// Library classes have nothing to run.
    Library,
}

impl PluginInstance {
    /// Kind of instance.
    pub fn kind(&self) -> PluginKind {
        match self {
            PluginInstance::Action(_) => PluginKind::Action,
            PluginInstance::Daemon(_) => PluginKind::Daemon,
            PluginInstance::Library => PluginKind::Library,
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginInstance").field(&self.kind()).finish()
    }
}

/// A loaded plugin class.
pub trait PluginClass: Send + Sync {
    fn info(&self) -> &ClassInfo;

    fn origin(&self) -> &ClassOrigin;

    /// Creates a new instance. Fails for abstract classes and interfaces.
    fn instantiate(&self) -> anyhow::Result<PluginInstance>;
}

impl fmt::Debug for dyn PluginClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClass")
            .field("class_name", &self.info().class_name)
            .field("origin", self.origin())
            .finish()
    }
}

/// Fails with a uniform message when `info` cannot be instantiated.
pub(crate) fn ensure_instantiable(info: &ClassInfo) -> anyhow::Result<()> {
    match info.shape {
        ClassShape::Concrete => Ok(()),
        ClassShape::Abstract => anyhow::bail!("class '{}' is abstract", info.class_name),
        ClassShape::Interface => anyhow::bail!("class '{}' is an interface", info.class_name),
    }
}

type Factory = Arc<dyn Fn() -> anyhow::Result<PluginInstance> + Send + Sync>;

/// A plugin class compiled into the host.
///
/// # Example
///
/// ```rust,ignore
/// let class = BuiltinClass::action(
///     ClassInfo::new("plugins.core.Histogram", "Histogram", Version::new(1, 0, 0)),
///     || Histogram::default(),
/// );
/// ```
#[derive(Clone)]
pub struct BuiltinClass {
    info: ClassInfo,
    origin: ClassOrigin,
    factory: Option<Factory>,
}

impl BuiltinClass {
    /// Registers an action class.
    pub fn action<F, P>(info: ClassInfo, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ActionPlugin + 'static,
    {
        Self::with_factory(info.with_kind(PluginKind::Action), move || {
            Ok(PluginInstance::Action(Box::new(factory())))
        })
    }

    /// Registers a daemon class.
    pub fn daemon<F, D>(info: ClassInfo, factory: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: DaemonPlugin + 'static,
    {
        Self::with_factory(info.with_kind(PluginKind::Daemon), move || {
            Ok(PluginInstance::Daemon(Arc::new(factory())))
        })
    }

    /// Registers a library class.
    pub fn library(info: ClassInfo) -> Self {
        Self {
            info: info.with_kind(PluginKind::Library),
            origin: ClassOrigin::Builtin,
            factory: None,
        }
    }

    /// Registers a class with a fallible factory. The class kind is taken
    /// from `info` unchanged.
    pub fn with_factory<F>(info: ClassInfo, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<PluginInstance> + Send + Sync + 'static,
    {
        Self {
            info,
            origin: ClassOrigin::Builtin,
            factory: Some(Arc::new(factory)),
        }
    }
}

impl PluginClass for BuiltinClass {
    fn info(&self) -> &ClassInfo {
        &self.info
    }

    fn origin(&self) -> &ClassOrigin {
        &self.origin
    }

    fn instantiate(&self) -> anyhow::Result<PluginInstance> {
        ensure_instantiable(&self.info)?;
        match &self.factory {
            Some(factory) => factory(),
            None => Ok(PluginInstance::Library),
        }
    }
}

impl fmt::Debug for BuiltinClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinClass")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
