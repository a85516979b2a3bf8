//! Generation lifecycle on disk
//!
//! Staging, sealing, garbage collection and removal of bundle generations.
//! All functions here are blocking; async callers run them on the blocking
//! pool.

use crate::cache::layout::{validate_name, CacheLayout, STAGING_PREFIX};
use crate::error::{StowageError, StowageResult};
use crate::source::Digest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One directory found inside a bundle namespace
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    /// Bundle the generation belongs to
    pub bundle: String,
    /// Directory name (the digest for sealed generations)
    pub name: String,
    /// Parsed digest, `None` for staging or foreign directories
    pub digest: Option<Digest>,
    pub path: PathBuf,
    /// Whether this is an unfinished unpack
    pub staging: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Owns the cache root and every mutation made below it
#[derive(Debug, Clone)]
pub struct GenerationStore {
    layout: CacheLayout,
}

impl GenerationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: CacheLayout::new(root),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Path of a sealed generation, if one exists for this digest
    pub fn find(&self, name: &str, digest: &Digest) -> StowageResult<Option<PathBuf>> {
        let path = self.layout.generation_path(name, digest)?;
        Ok(path.is_dir().then_some(path))
    }

    /// Create a fresh, private staging directory for an unpack.
    pub fn begin_staging(&self, name: &str) -> StowageResult<PathBuf> {
        let bundle = self.layout.bundle_path(name)?;
        create_private_dir(&bundle)?;

        let staging = self
            .layout
            .staging_path(name, &Uuid::new_v4().simple().to_string())?;
        create_private_dir(&staging)?;
        debug!(bundle = name, path = %staging.display(), "Created staging directory");
        Ok(staging)
    }

    /// Seal a finished staging directory and move it into place as the
    /// generation for `digest`.
    ///
    /// If the generation already exists the staging copy is discarded and
    /// the existing generation is returned untouched.
    pub fn commit(&self, name: &str, staging: &Path, digest: &Digest) -> StowageResult<PathBuf> {
        let target = self.layout.generation_path(name, digest)?;

        if target.is_dir() {
            debug!(bundle = name, digest = %digest, "Generation already present, discarding staging copy");
            delete_recursive(staging)?;
            return Ok(target);
        }

        set_read_only_recursive(staging).map_err(|e| {
            StowageError::io(format!("making {} read-only", staging.display()), e)
        })?;
        fs::rename(staging, &target).map_err(|e| {
            StowageError::io(
                format!("moving {} to {}", staging.display(), target.display()),
                e,
            )
        })?;

        info!(bundle = name, digest = %digest, path = %target.display(), "Sealed generation");
        Ok(target)
    }

    /// Remove every directory in the bundle namespace except `keep`.
    ///
    /// Every entry is attempted even if an earlier one fails. A missing
    /// namespace is not an error. Returns the removed paths.
    pub fn garbage_collect(&self, name: &str, keep: &Digest) -> StowageResult<Vec<PathBuf>> {
        let bundle = self.layout.bundle_path(name)?;
        let entries = match fs::read_dir(&bundle) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StowageError::io(
                    format!("reading generations of {}", bundle.display()),
                    e,
                ))
            }
        };

        let keep = keep.to_string();
        let mut removed = Vec::new();
        let mut failures = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| {
                StowageError::io(format!("reading generations of {}", bundle.display()), e)
            })?;
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }

            let path = entry.path();
            match delete_recursive(&path) {
                Ok(()) => {
                    debug!(bundle = name, path = %path.display(), "Removed stale generation");
                    removed.push(path);
                }
                Err(e) => {
                    warn!(bundle = name, path = %path.display(), error = %e, "Failed to remove stale generation");
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(StowageError::GarbageCollect {
                name: name.to_string(),
                failures,
            });
        }

        if !removed.is_empty() {
            info!(bundle = name, keep = %keep, count = removed.len(), "Garbage collected generations");
        }
        Ok(removed)
    }

    /// Remove the whole namespace of a bundle. Idempotent.
    pub fn cleanup(&self, name: &str) -> StowageResult<()> {
        let bundle = self.layout.bundle_path(name)?;
        delete_recursive(&bundle)?;
        info!(bundle = name, "Removed bundle cache");
        Ok(())
    }

    /// Remove the namespace directory of a bundle if it holds nothing.
    /// Returns whether it was removed.
    pub fn remove_if_empty(&self, name: &str) -> StowageResult<bool> {
        let bundle = self.layout.bundle_path(name)?;
        let mut entries = match fs::read_dir(&bundle) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StowageError::io(
                    format!("reading {}", bundle.display()),
                    e,
                ))
            }
        };
        if entries.next().is_some() {
            return Ok(false);
        }
        fs::remove_dir(&bundle)
            .map_err(|e| StowageError::io(format!("removing {}", bundle.display()), e))?;
        debug!(bundle = name, "Removed empty bundle directory");
        Ok(true)
    }

    /// Names of all bundles that have a namespace in the cache
    pub fn list_bundles(&self) -> StowageResult<Vec<String>> {
        let root = self.layout.root();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StowageError::io(
                    format!("reading cache root {}", root.display()),
                    e,
                ))
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| validate_name(n).is_ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Directories currently present in one bundle namespace
    pub fn list_generations(&self, name: &str) -> StowageResult<Vec<Generation>> {
        let bundle = self.layout.bundle_path(name)?;
        let entries = match fs::read_dir(&bundle) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StowageError::io(
                    format!("reading generations of {}", bundle.display()),
                    e,
                ))
            }
        };

        let mut generations = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            generations.push(Generation {
                bundle: name.to_string(),
                digest: dir_name.parse().ok(),
                staging: dir_name.starts_with(STAGING_PREFIX),
                path: entry.path(),
                name: dir_name,
                modified,
            });
        }
        generations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(generations)
    }
}

fn create_private_dir(path: &Path) -> StowageResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|e| StowageError::io(format!("creating directory {}", path.display()), e))
}

/// Recursively delete a path, restoring write permission on directories
/// first so that sealed generations can be removed. Absent paths are fine.
pub fn delete_recursive(path: &Path) -> StowageResult<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StowageError::io(format!("inspecting {}", path.display()), e)),
    };

    let result = if metadata.is_dir() {
        make_dirs_writable(path).and_then(|()| fs::remove_dir_all(path))
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StowageError::io(format!("removing {}", path.display()), e)),
    }
}

fn make_dirs_writable(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o700);
    }
    #[cfg(not(unix))]
    {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }
    fs::set_permissions(path, perms)?;

    for entry in fs::read_dir(path)? {
        make_dirs_writable(&entry?.path())?;
    }
    Ok(())
}

/// Strip write permission from every file and directory under `path`.
/// Symlinks are left alone since chmod would follow them.
pub fn set_read_only_recursive(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            set_read_only_recursive(&entry?.path())?;
        }
    }

    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        if mode & 0o222 != 0 {
            perms.set_mode(mode & !0o222);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}
