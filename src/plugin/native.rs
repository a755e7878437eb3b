//! Classes defined by archive manifests.
//!
//! Concrete action and daemon classes are backed by the archive's native
//! library; instances are handles owned by the library and released when the
//! host-side adapter is dropped.

use std::fmt;
use std::sync::Arc;

use bioimage_plugin_api::NativeLibrary;

use super::class::{
    ensure_instantiable, ActionPlugin, ClassInfo, ClassOrigin, DaemonPlugin, PluginClass,
    PluginInstance, PluginKind,
};

/// A class declared in an archive manifest.
pub struct NativeClass {
    info: ClassInfo,
    origin: ClassOrigin,
    library: Option<Arc<NativeLibrary>>,
}

impl NativeClass {
    /// A class without implementation (abstract, interface or library).
    pub fn declared(info: ClassInfo, origin: ClassOrigin) -> Self {
        Self {
            info,
            origin,
            library: None,
        }
    }

    /// A class implemented by `library`.
    pub fn linked(info: ClassInfo, origin: ClassOrigin, library: Arc<NativeLibrary>) -> Self {
        Self {
            info,
            origin,
            library: Some(library),
        }
    }

    pub fn library(&self) -> Option<&Arc<NativeLibrary>> {
        self.library.as_ref()
    }

    fn create(&self) -> anyhow::Result<NativeInstance> {
        let library = self.library.as_ref().ok_or_else(|| {
            anyhow::anyhow!("class '{}' has no native implementation", self.info.class_name)
        })?;
        let handle = library.create_instance(&self.info.class_name)?;
        Ok(NativeInstance {
            library: Arc::clone(library),
            handle,
        })
    }
}

impl PluginClass for NativeClass {
    fn info(&self) -> &ClassInfo {
        &self.info
    }

    fn origin(&self) -> &ClassOrigin {
        &self.origin
    }

    fn instantiate(&self) -> anyhow::Result<PluginInstance> {
        ensure_instantiable(&self.info)?;
        match self.info.kind {
            PluginKind::Library => Ok(PluginInstance::Library),
            PluginKind::Action => Ok(PluginInstance::Action(Box::new(NativeAction(
                self.create()?,
            )))),
            PluginKind::Daemon => Ok(PluginInstance::Daemon(Arc::new(NativeDaemon(
                self.create()?,
            )))),
        }
    }
}

impl fmt::Debug for NativeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeClass")
            .field("info", &self.info)
            .field("origin", &self.origin)
            .field("linked", &self.library.is_some())
            .finish()
    }
}

/// An instance handle owned by a native library.
struct NativeInstance {
    library: Arc<NativeLibrary>,
    handle: u64,
}

impl Drop for NativeInstance {
    fn drop(&mut self) {
        self.library.release(self.handle);
    }
}

struct NativeAction(NativeInstance);

impl ActionPlugin for NativeAction {
    fn run(&mut self) -> anyhow::Result<()> {
        self.0.library.run(self.0.handle)?;
        Ok(())
    }
}

struct NativeDaemon(NativeInstance);

impl DaemonPlugin for NativeDaemon {
    fn init(&self) -> anyhow::Result<()> {
        self.0.library.init(self.0.handle)?;
        Ok(())
    }

    fn run(&self) {
        if let Err(e) = self.0.library.run(self.0.handle) {
            tracing::error!(library = %self.0.library.path().display(), "Daemon run failed: {}", e);
        }
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.0.library.stop(self.0.handle)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::class::ClassShape;
    use crate::plugin::version::Version;
    use std::path::PathBuf;

    fn origin() -> ClassOrigin {
        ClassOrigin::Archive(PathBuf::from("plugins/acme.zip"))
    }

    #[test]
    fn test_declared_interface_refuses_instantiation() {
        let info = ClassInfo::new("plugins.acme.Filter", "Filter", Version::new(1, 0, 0))
            .with_shape(ClassShape::Interface);
        let class = NativeClass::declared(info, origin());
        assert!(class.instantiate().is_err());
        assert!(class.library().is_none());
    }

    #[test]
    fn test_declared_library_instantiates_without_implementation() {
        let info = ClassInfo::new("plugins.acme.Kernel", "Kernel", Version::new(1, 0, 0))
            .with_kind(PluginKind::Library);
        let class = NativeClass::declared(info, origin());
        assert!(matches!(class.instantiate().unwrap(), PluginInstance::Library));
    }

    #[test]
    fn test_unlinked_action_reports_missing_implementation() {
        let info = ClassInfo::new("plugins.acme.Denoise", "Denoise", Version::new(1, 0, 0));
        let class = NativeClass::declared(info, origin());
        let err = class.instantiate().unwrap_err();
        assert!(err.to_string().contains("no native implementation"));
    }
}
