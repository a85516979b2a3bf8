//! Read-only view of an unpacked bundle
//!
//! The render step receives a [`BundleFs`] instead of a raw path. It can list,
//! open and read files, but has no way to write into the cache.

use crate::cache::contained_path;
use crate::error::{StowageError, StowageResult};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// A directory entry inside a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleEntry {
    /// Path relative to the bundle root
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
}

/// A file loaded fully into memory, named by its path relative to the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Borrowed, read-only handle to a sealed generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFs {
    root: PathBuf,
}

impl BundleFs {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Absolute root of the tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative path into the tree. The path must be lexically
    /// contained and, with symlinks followed, still land inside the root;
    /// layer symlinks pointing at host paths are refused.
    fn resolve(&self, rel: impl AsRef<Path>) -> StowageResult<PathBuf> {
        let rel = rel.as_ref();
        let clean = contained_path(rel).ok_or_else(|| StowageError::PathInvalid {
            path: rel.to_path_buf(),
            reason: "path escapes the bundle root".to_string(),
        })?;
        let path = self.root.join(clean);

        let real = canonical(&path)?;
        let root = canonical(&self.root)?;
        if !real.starts_with(&root) {
            return Err(StowageError::PathInvalid {
                path: rel.to_path_buf(),
                reason: "symlink resolves outside the bundle root".to_string(),
            });
        }
        Ok(path)
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    /// Entries of one directory, sorted by path
    pub fn read_dir(&self, rel: impl AsRef<Path>) -> StowageResult<Vec<BundleEntry>> {
        let dir = self.resolve(rel)?;
        let entries = fs::read_dir(&dir)
            .map_err(|e| StowageError::io(format!("listing {}", dir.display()), e))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StowageError::io(format!("listing {}", dir.display()), e))?;
            let metadata = entry
                .metadata()
                .map_err(|e| StowageError::io(format!("inspecting {}", entry.path().display()), e))?;
            out.push(BundleEntry {
                path: self.relative(&entry.path()),
                is_dir: metadata.is_dir(),
                len: metadata.len(),
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Open a file for reading
    pub fn open(&self, rel: impl AsRef<Path>) -> StowageResult<File> {
        let path = self.resolve(rel)?;
        File::open(&path).map_err(|e| StowageError::io(format!("opening {}", path.display()), e))
    }

    pub fn read(&self, rel: impl AsRef<Path>) -> StowageResult<Vec<u8>> {
        let path = self.resolve(rel)?;
        fs::read(&path).map_err(|e| StowageError::io(format!("reading {}", path.display()), e))
    }

    pub fn read_to_string(&self, rel: impl AsRef<Path>) -> StowageResult<String> {
        let path = self.resolve(rel)?;
        fs::read_to_string(&path)
            .map_err(|e| StowageError::io(format!("reading {}", path.display()), e))
    }

    /// Relative paths of every regular file, depth-first in sorted order
    pub fn walk(&self) -> StowageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        self.walk_dir(&self.root, &mut files)?;
        Ok(files)
    }

    fn walk_dir(&self, dir: &Path, files: &mut Vec<PathBuf>) -> StowageResult<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| StowageError::io(format!("walking {}", dir.display()), e))?
            .filter_map(Result::ok)
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_type = entry
                .file_type()
                .map_err(|e| StowageError::io(format!("inspecting {}", entry.path().display()), e))?;
            if file_type.is_dir() {
                self.walk_dir(&entry.path(), files)?;
            } else if file_type.is_file() {
                files.push(self.relative(&entry.path()));
            }
        }
        Ok(())
    }

    /// Read every regular file into memory, as a chart loader expects
    pub fn load_files(&self) -> StowageResult<Vec<BufferedFile>> {
        self.walk()?
            .into_iter()
            .map(|rel| {
                let data = self.read(&rel)?;
                Ok(BufferedFile {
                    name: rel.to_string_lossy().replace('\\', "/"),
                    data,
                })
            })
            .collect()
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn canonical(path: &Path) -> StowageResult<PathBuf> {
    fs::canonicalize(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StowageError::PathNotFound(path.to_path_buf()),
        _ => StowageError::io(format!("resolving {}", path.display()), e),
    })
}
