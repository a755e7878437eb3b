//! Archive manifest types.
//!
//! Every plugin archive carries a `plugin.toml` at its root describing the
//! classes it defines.
//!
//! # Example plugin.toml
//!
//! ```toml
//! [archive]
//! name = "Acme tools"
//! author = "Acme Lab"
//! library = "lib/libacme_tools.so"
//!
//! [[class]]
//! name = "plugins.acme.Denoise"
//! display_name = "Denoise"
//! version = "1.2.0"
//! kind = "action"
//! implements = ["ImageFilter"]
//! requires = ["plugins.acme.Kernel"]
//!
//! [[class]]
//! name = "plugins.acme.Kernel"
//! plugin = false
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use super::class::{ClassShape, PluginKind};

/// File name of the manifest inside an archive.
pub const MANIFEST_NAME: &str = "plugin.toml";

/// Top-level archive manifest structure (plugin.toml).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Archive-wide metadata.
    #[serde(default)]
    pub archive: ArchiveSection,

    /// Classes defined by the archive.
    #[serde(default, rename = "class")]
    pub classes: Vec<ClassDefinition>,
}

/// Archive-wide metadata section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArchiveSection {
    /// Human-readable archive name.
    #[serde(default)]
    pub name: String,

    /// Default author for classes that do not name one.
    #[serde(default)]
    pub author: String,

    /// Path inside the archive of the native library implementing the
    /// concrete classes.
    #[serde(default)]
    pub library: Option<String>,
}

/// A class entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDefinition {
    /// Binary name (dot-separated).
    pub name: String,

    /// Name shown to users (defaults to the simple class name).
    #[serde(default)]
    pub display_name: Option<String>,

    /// Version string.
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub kind: PluginKind,

    #[serde(default)]
    pub shape: ClassShape,

    #[serde(default)]
    pub bundled: bool,

    /// False for helper classes that are not plugins.
    #[serde(default = "default_plugin")]
    pub plugin: bool,

    #[serde(default)]
    pub implements: Vec<String>,

    #[serde(default)]
    pub requires: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_plugin() -> bool {
    true
}

impl ClassDefinition {
    /// Display name, falling back to the simple class name.
    pub fn display_name(&self) -> &str {
        match &self.display_name {
            Some(name) if !name.is_empty() => name,
            _ => self
                .name
                .rsplit_once('.')
                .map(|(_, simple)| simple)
                .unwrap_or(&self.name),
        }
    }

    /// Whether loading needs a native implementation.
    pub fn needs_implementation(&self) -> bool {
        self.shape == ClassShape::Concrete && self.kind != PluginKind::Library
    }
}

/// Errors that can occur while reading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest in {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Validation failed for {}: {message}", path.display())]
    Validation { path: PathBuf, message: String },
}

/// A specific validation error within a manifest.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the invalid field (e.g., "class[2].name").
    pub path: String,
    /// Human-readable error message.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl ArchiveManifest {
    /// Parses a manifest from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parses and validates the manifest of the archive at `archive_path`.
    pub fn parse(content: &str, archive_path: &Path) -> Result<Self, ManifestError> {
        let manifest = Self::from_toml(content).map_err(|e| ManifestError::Parse {
            path: archive_path.to_path_buf(),
            source: e,
        })?;
        manifest.validate_or_err(archive_path)?;
        Ok(manifest)
    }

    /// Validates the manifest and returns any errors found.
    ///
    /// Validation checks:
    /// 1. Class names are well-formed binary names
    /// 2. Class names are unique within the archive
    /// 3. The library path stays inside the archive
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (idx, class) in self.classes.iter().enumerate() {
            let field = format!("class[{}].name", idx);
            if class.name.is_empty() {
                errors.push(ValidationError {
                    path: field,
                    message: "Class name cannot be empty".to_string(),
                });
                continue;
            }
            if !is_binary_name(&class.name) {
                errors.push(ValidationError {
                    path: field,
                    message: format!("'{}' is not a valid binary class name", class.name),
                });
                continue;
            }
            if !seen.insert(class.name.as_str()) {
                errors.push(ValidationError {
                    path: field,
                    message: format!("Class '{}' is defined twice", class.name),
                });
            }
        }

        if let Some(library) = &self.archive.library {
            let path = Path::new(library);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
            if library.is_empty() || escapes {
                errors.push(ValidationError {
                    path: "archive.library".to_string(),
                    message: format!("Library path '{}' must be relative to the archive", library),
                });
            }
        }

        errors
    }

    /// Validates and returns a single error joining all problems.
    pub fn validate_or_err(&self, path: &Path) -> Result<(), ManifestError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            Err(ManifestError::Validation {
                path: path.to_path_buf(),
                message: messages.join("; "),
            })
        }
    }

    /// Looks up a class definition by binary name.
    pub fn class(&self, name: &str) -> Option<&ClassDefinition> {
        self.classes.iter().find(|c| c.name == name)
    }
}

/// Checks that `name` is a dot-separated list of identifiers.
pub fn is_binary_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_alphabetic() || first == '_' || first == '$' => chars
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '$'),
                _ => false,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_MANIFEST: &str = r#"
[[class]]
name = "plugins.lab.Counter"
"#;

    const FULL_MANIFEST: &str = r#"
[archive]
name = "Acme tools"
author = "Acme Lab"
library = "lib/libacme_tools.so"

[[class]]
name = "plugins.acme.Denoise"
display_name = "Denoise"
version = "1.2.0"
kind = "action"
implements = ["ImageFilter"]
requires = ["plugins.acme.Kernel"]
description = "Removes shot noise"

[[class]]
name = "plugins.acme.Watcher"
kind = "daemon"
bundled = true

[[class]]
name = "plugins.acme.Filter"
shape = "interface"

[[class]]
name = "plugins.acme.Kernel"
plugin = false
"#;

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = ArchiveManifest::from_toml(MINIMAL_MANIFEST).unwrap();
        assert_eq!(manifest.classes.len(), 1);
        let class = &manifest.classes[0];
        assert_eq!(class.version, "1.0.0");
        assert_eq!(class.kind, PluginKind::Action);
        assert_eq!(class.shape, ClassShape::Concrete);
        assert!(class.plugin);
        assert_eq!(class.display_name(), "Counter");
        assert!(manifest.archive.library.is_none());
    }

    #[test]
    fn test_parse_full_manifest() {
        let manifest = ArchiveManifest::parse(FULL_MANIFEST, Path::new("acme.zip")).unwrap();
        assert_eq!(manifest.archive.name, "Acme tools");
        assert_eq!(manifest.classes.len(), 4);

        let denoise = manifest.class("plugins.acme.Denoise").unwrap();
        assert_eq!(denoise.display_name(), "Denoise");
        assert_eq!(denoise.requires, vec!["plugins.acme.Kernel".to_string()]);
        assert!(denoise.needs_implementation());

        let watcher = manifest.class("plugins.acme.Watcher").unwrap();
        assert_eq!(watcher.kind, PluginKind::Daemon);
        assert!(watcher.bundled);

        let filter = manifest.class("plugins.acme.Filter").unwrap();
        assert!(!filter.needs_implementation());

        assert!(!manifest.class("plugins.acme.Kernel").unwrap().plugin);
    }

    #[test]
    fn test_duplicate_and_malformed_names_rejected() {
        let manifest = ArchiveManifest::from_toml(
            r#"
[[class]]
name = "plugins.a.Dup"

[[class]]
name = "plugins.a.Dup"

[[class]]
name = "plugins..Broken"
"#,
        )
        .unwrap();
        let errors = manifest.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("defined twice"));
        assert!(errors[1].message.contains("not a valid binary class name"));
    }

    #[test]
    fn test_library_must_stay_inside_archive() {
        let manifest = ArchiveManifest::from_toml(
            r#"
[archive]
library = "../outside.so"
"#,
        )
        .unwrap();
        let err = manifest.validate_or_err(Path::new("bad.zip")).unwrap_err();
        assert!(matches!(err, ManifestError::Validation { .. }));
        assert!(err.to_string().contains("archive.library"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = ArchiveManifest::parse("[[class]\nname=", Path::new("x.zip")).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn test_binary_names() {
        assert!(is_binary_name("plugins.acme.Denoise"));
        assert!(is_binary_name("plugins.acme.Outer$Inner"));
        assert!(!is_binary_name("plugins.1acme.X"));
        assert!(!is_binary_name("plugins.acme."));
        assert!(!is_binary_name(""));
    }
}
