//! Plugin archive discovery and access.
//!
//! An archive is a zip file in the plugin directory with a `plugin.toml`
//! manifest at its root. Everything else in the archive is a resource,
//! including the optional native library that implements the concrete
//! classes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use super::manifest::{ArchiveManifest, ManifestError, MANIFEST_NAME};

/// Errors raised while reading a plugin archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt archive {}: {source}", path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Archive {} has no plugin.toml", path.display())]
    MissingManifest { path: PathBuf },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Entry '{entry}' in {} is {size} bytes, limit is {limit}", path.display())]
    EntryTooLarge {
        path: PathBuf,
        entry: String,
        size: u64,
        limit: u64,
    },

    #[error("Entry '{entry}' not found in {}", path.display())]
    MissingEntry { path: PathBuf, entry: String },

    #[error("Entry '{entry}' in {} escapes the archive", path.display())]
    UnsafeEntry { path: PathBuf, entry: String },

    #[error("Cannot enumerate plugin directory {}: {message}", path.display())]
    Enumeration { path: PathBuf, message: String },
}

/// Options controlling a plugin directory scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    /// File extensions (without dot, case-insensitive) treated as archives.
    pub extensions: Vec<String>,
    /// Entries above this size are never read into memory.
    pub max_entry_bytes: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            extensions: vec!["zip".to_string(), "plugin".to_string()],
            max_entry_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ScanOptions {
    fn is_archive(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// An opened plugin archive.
///
/// Only the manifest and the entry table are kept in memory; entry contents
/// are read on demand.
#[derive(Debug, Clone)]
pub struct PluginArchive {
    path: PathBuf,
    manifest: ArchiveManifest,
    /// Non-manifest file entries and their uncompressed sizes.
    entries: BTreeMap<String, u64>,
    max_entry_bytes: u64,
}

impl PluginArchive {
    /// Opens the archive at `path` and parses its manifest.
    pub fn open(path: &Path, max_entry_bytes: u64) -> Result<Self, ArchiveError> {
        let mut zip = open_zip(path)?;

        let mut entries = BTreeMap::new();
        let mut manifest_size = None;
        for index in 0..zip.len() {
            let file = zip.by_index(index).map_err(|e| zip_error(path, e))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            if file.enclosed_name().is_none() {
                return Err(ArchiveError::UnsafeEntry {
                    path: path.to_path_buf(),
                    entry: name,
                });
            }
            if name == MANIFEST_NAME {
                manifest_size = Some(file.size());
            } else {
                entries.insert(name, file.size());
            }
        }

        let size = manifest_size.ok_or_else(|| ArchiveError::MissingManifest {
            path: path.to_path_buf(),
        })?;
        check_size(path, MANIFEST_NAME, size, max_entry_bytes)?;

        let mut content = String::new();
        zip.by_name(MANIFEST_NAME)
            .map_err(|e| zip_error(path, e))?
            .read_to_string(&mut content)
            .map_err(|e| ManifestError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        let manifest = ArchiveManifest::parse(&content, path)?;

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            entries,
            max_entry_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    /// Names of the resource entries, in archive-path order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|name| name.as_str())
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Uncompressed size of an entry.
    pub fn entry_size(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    /// Reads an entry into memory, refusing entries above the size limit.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let size = self.checked_entry_size(name)?;
        let mut zip = open_zip(&self.path)?;
        let file = zip.by_name(name).map_err(|e| zip_error(&self.path, e))?;
        let mut data = Vec::with_capacity(size as usize);
        file.take(self.max_entry_bytes)
            .read_to_end(&mut data)
            .map_err(|e| self.io_error(e))?;
        Ok(data)
    }

    /// Extracts an entry to `dest_dir`, keeping its file name, and returns
    /// the written path.
    pub fn extract_entry(&self, name: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        self.checked_entry_size(name)?;

        let file_name = Path::new(name)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .last()
            .ok_or_else(|| ArchiveError::UnsafeEntry {
                path: self.path.clone(),
                entry: name.to_string(),
            })?;

        std::fs::create_dir_all(dest_dir).map_err(|e| ArchiveError::Io {
            path: dest_dir.to_path_buf(),
            source: e,
        })?;
        let target = dest_dir.join(file_name);

        let mut zip = open_zip(&self.path)?;
        let file = zip.by_name(name).map_err(|e| zip_error(&self.path, e))?;
        let mut out = File::create(&target).map_err(|e| ArchiveError::Io {
            path: target.clone(),
            source: e,
        })?;
        std::io::copy(&mut file.take(self.max_entry_bytes), &mut out).map_err(|e| {
            ArchiveError::Io {
                path: target.clone(),
                source: e,
            }
        })?;

        tracing::debug!(
            archive = %self.path.display(),
            entry = name,
            target = %target.display(),
            "Extracted archive entry"
        );
        Ok(target)
    }

    fn checked_entry_size(&self, name: &str) -> Result<u64, ArchiveError> {
        let size = self
            .entry_size(name)
            .ok_or_else(|| ArchiveError::MissingEntry {
                path: self.path.clone(),
                entry: name.to_string(),
            })?;
        check_size(&self.path, name, size, self.max_entry_bytes)?;
        Ok(size)
    }

    fn io_error(&self, source: std::io::Error) -> ArchiveError {
        ArchiveError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn open_zip(path: &Path) -> Result<zip::ZipArchive<BufReader<File>>, ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    zip::ZipArchive::new(BufReader::new(file)).map_err(|e| zip_error(path, e))
}

fn zip_error(path: &Path, source: zip::result::ZipError) -> ArchiveError {
    ArchiveError::Zip {
        path: path.to_path_buf(),
        source,
    }
}

fn check_size(path: &Path, entry: &str, size: u64, limit: u64) -> Result<(), ArchiveError> {
    if size > limit {
        Err(ArchiveError::EntryTooLarge {
            path: path.to_path_buf(),
            entry: entry.to_string(),
            size,
            limit,
        })
    } else {
        Ok(())
    }
}

/// Lists the archive files under `dir`, sorted by path.
///
/// A missing directory yields an empty list. Failure to read the directory
/// itself is an enumeration error; unreadable subdirectories are skipped.
pub fn find_archives(dir: &Path, options: &ScanOptions) -> Result<Vec<PathBuf>, ArchiveError> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "Plugin directory does not exist");
        return Ok(Vec::new());
    }

    let max_depth = if options.recursive { usize::MAX } else { 1 };
    let mut archives = Vec::new();

    for entry in WalkDir::new(dir)
        .follow_links(true)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(ArchiveError::Enumeration {
                    path: dir.to_path_buf(),
                    message: err.to_string(),
                });
            }
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.depth() == 0 && !entry.file_type().is_dir() {
            return Err(ArchiveError::Enumeration {
                path: dir.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }

        if entry.file_type().is_file() && options.is_archive(entry.path()) {
            archives.push(entry.into_path());
        }
    }

    Ok(archives)
}

/// Opens every archive under `dir`.
///
/// Corrupt archives are logged and skipped; they never affect the others.
pub fn scan_directory(dir: &Path, options: &ScanOptions) -> Result<Vec<PluginArchive>, ArchiveError> {
    let paths = find_archives(dir, options)?;
    let mut archives = Vec::with_capacity(paths.len());

    for path in paths {
        match PluginArchive::open(&path, options.max_entry_bytes) {
            Ok(archive) => {
                tracing::debug!(
                    archive = %path.display(),
                    classes = archive.manifest().classes.len(),
                    "Opened plugin archive"
                );
                archives.push(archive);
            }
            Err(e) => {
                tracing::warn!(archive = %path.display(), "Skipping plugin archive: {}", e);
            }
        }
    }

    Ok(archives)
}


#[cfg(test)]
mod tests {
    use super::testing::write_archive;
    use super::*;
    use tracing_test::traced_test;

    const MANIFEST: &str = r#"
[archive]
name = "Shapes"

[[class]]
name = "plugins.shapes.Circle"
shape = "interface"
"#;

    #[test]
    fn test_open_reads_manifest_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shapes.zip");
        write_archive(
            &path,
            Some(MANIFEST),
            &[
                ("icons/circle.png", b"png".as_slice()),
                ("README.txt", b"hello".as_slice()),
            ],
        );

        let archive = PluginArchive::open(&path, 1024).unwrap();
        assert_eq!(archive.manifest().archive.name, "Shapes");
        let names: Vec<_> = archive.entry_names().collect();
        assert_eq!(names, vec!["README.txt", "icons/circle.png"]);
        assert_eq!(archive.read_entry("README.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_missing_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        write_archive(&path, None, &[("data.bin", b"x".as_slice())]);

        let err = PluginArchive::open(&path, 1024).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingManifest { .. }));
    }

    #[test]
    fn test_oversized_entry_is_never_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.zip");
        let big = vec![0u8; 4096];
        write_archive(&path, Some(MANIFEST), &[("big.bin", big.as_slice())]);

        let archive = PluginArchive::open(&path, 1024).unwrap();
        let err = archive.read_entry("big.bin").unwrap_err();
        assert!(matches!(err, ArchiveError::EntryTooLarge { size: 4096, .. }));

        let out = dir.path().join("out");
        assert!(archive.extract_entry("big.bin", &out).is_err());
        assert!(!out.join("big.bin").exists());
    }

    #[test]
    fn test_extract_entry_keeps_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.zip");
        write_archive(&path, Some(MANIFEST), &[("lib/libshapes.so", b"\x7fELF".as_slice())]);

        let archive = PluginArchive::open(&path, 1024).unwrap();
        let out = archive
            .extract_entry("lib/libshapes.so", &dir.path().join("extract"))
            .unwrap();
        assert_eq!(out, dir.path().join("extract").join("libshapes.so"));
        assert_eq!(std::fs::read(out).unwrap(), b"\x7fELF");
    }

    #[test]
    fn test_missing_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let found = find_archives(&dir.path().join("absent"), &ScanOptions::default()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_file_instead_of_directory_is_enumeration_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugins");
        std::fs::write(&file, b"").unwrap();
        let err = find_archives(&file, &ScanOptions::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::Enumeration { .. }));
    }

    #[test]
    fn test_find_archives_filters_extensions_and_depth() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(&dir.path().join("a.zip"), Some(MANIFEST), &[]);
        write_archive(&dir.path().join("b.PLUGIN"), Some(MANIFEST), &[]);
        write_archive(&dir.path().join("nested/c.zip"), Some(MANIFEST), &[]);
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let all = find_archives(dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!(all.len(), 3);

        let flat = ScanOptions {
            recursive: false,
            ..ScanOptions::default()
        };
        let top = find_archives(dir.path(), &flat).unwrap();
        assert_eq!(top.len(), 2);
    }

    #[test]
    #[traced_test]
    fn test_corrupt_archive_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(&dir.path().join("good.zip"), Some(MANIFEST), &[]);
        std::fs::write(dir.path().join("broken.zip"), b"not a zip").unwrap();

        let archives = scan_directory(dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!(archives.len(), 1);
        assert!(archives[0].path().ends_with("good.zip"));
        assert!(logs_contain("Skipping plugin archive"));
    }
}
