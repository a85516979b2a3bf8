//! Tar stream extraction
//!
//! Applies a tar stream onto a directory one entry at a time, in stream
//! order. Every entry path is checked to stay inside the destination before
//! anything touches the filesystem.

use crate::cache::{contained_path, delete_recursive};
use crate::error::{StowageError, StowageResult};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// How entries beyond plain files and directories are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Directories and regular files only; everything else is skipped
    Plain,
    /// OCI layer: also links, plus whiteout deletions
    Layer,
}

/// Counters from one extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub dirs: usize,
    pub links: usize,
    pub whiteouts: usize,
    pub skipped: usize,
}

/// Reader that fails once the token is cancelled
pub struct CancelReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R> CancelReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Tar extractor bound to one destination directory
pub struct Extractor<'a> {
    bundle: &'a str,
    dest: &'a Path,
    mode: ArchiveMode,
    cancel: &'a CancellationToken,
    /// Existing directories given owner write access, with their original
    /// modes
    unlocked: RefCell<Vec<(PathBuf, u32)>>,
}

impl<'a> Extractor<'a> {
    pub fn new(
        bundle: &'a str,
        dest: &'a Path,
        mode: ArchiveMode,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            bundle,
            dest,
            mode,
            cancel,
            unlocked: RefCell::new(Vec::new()),
        }
    }

    /// Map a read-side failure: cancellation wins over whatever the stream
    /// reported.
    fn read_error(&self, e: impl std::fmt::Display) -> StowageError {
        if self.cancel.is_cancelled() {
            StowageError::Cancelled(self.bundle.to_string())
        } else {
            StowageError::decode(self.bundle, e)
        }
    }

    fn check_cancelled(&self) -> StowageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StowageError::Cancelled(self.bundle.to_string()));
        }
        Ok(())
    }

    /// Extract every entry of `reader` onto the destination.
    pub fn extract<R: Read>(&self, reader: R) -> StowageResult<ExtractStats> {
        let mut archive = Archive::new(reader);
        let mut stats = ExtractStats::default();
        let mut written: HashSet<PathBuf> = HashSet::new();
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        let entries = archive.entries().map_err(|e| self.read_error(e))?;
        for entry in entries {
            self.check_cancelled()?;
            let mut entry = entry.map_err(|e| self.read_error(e))?;

            let raw = entry.path().map_err(|e| self.read_error(e))?.into_owned();
            let rel = contained_path(&raw).ok_or_else(|| StowageError::UnsafeEntry {
                entry: raw.display().to_string(),
            })?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            self.check_ancestors(&rel)?;

            if self.mode == ArchiveMode::Layer && self.apply_whiteout(&rel, &written)? {
                stats.whiteouts += 1;
                continue;
            }

            let target = self.dest.join(&rel);
            let bits = entry.header().mode().unwrap_or(0o644) & 0o777;
            let kind = entry.header().entry_type();

            match kind {
                EntryType::Directory => {
                    self.make_dir(&target)?;
                    dir_modes.push((target, bits));
                    stats.dirs += 1;
                }
                EntryType::Regular | EntryType::Continuous => {
                    self.prepare_target(&target)?;
                    self.write_file(&mut entry, &target, bits)?;
                    stats.files += 1;
                }
                EntryType::Symlink if self.mode == ArchiveMode::Layer => {
                    let link = entry
                        .link_name()
                        .map_err(|e| self.read_error(e))?
                        .ok_or_else(|| StowageError::decode(self.bundle, "symlink without target"))?
                        .into_owned();
                    self.prepare_target(&target)?;
                    make_symlink(&link, &target)?;
                    stats.links += 1;
                }
                EntryType::Link if self.mode == ArchiveMode::Layer => {
                    let link = entry
                        .link_name()
                        .map_err(|e| self.read_error(e))?
                        .ok_or_else(|| StowageError::decode(self.bundle, "hardlink without target"))?
                        .into_owned();
                    let source_rel = contained_path(&link).ok_or_else(|| StowageError::UnsafeEntry {
                        entry: link.display().to_string(),
                    })?;
                    self.check_ancestors(&source_rel)?;
                    self.prepare_target(&target)?;
                    let source = self.dest.join(&source_rel);
                    fs::hard_link(&source, &target).map_err(|e| {
                        StowageError::io(
                            format!("linking {} to {}", target.display(), source.display()),
                            e,
                        )
                    })?;
                    stats.links += 1;
                }
                other => {
                    warn!(
                        bundle = self.bundle,
                        entry = %raw.display(),
                        kind = ?other,
                        "Skipping unsupported entry type in tar"
                    );
                    stats.skipped += 1;
                    continue;
                }
            }
            record_written(&mut written, rel);
        }

        // Directory modes go on last so a restrictive mode cannot block
        // writes of later entries. Borrowed write access is returned first
        // so a mode declared in this stream wins.
        self.restore_unlocked()?;
        for (dir, bits) in dir_modes.into_iter().rev() {
            set_mode(&dir, bits)?;
        }

        debug!(
            bundle = self.bundle,
            files = stats.files,
            dirs = stats.dirs,
            links = stats.links,
            whiteouts = stats.whiteouts,
            skipped = stats.skipped,
            "Extracted tar stream"
        );
        Ok(stats)
    }

    /// Refuse to write through a symlink planted by an earlier entry.
    fn check_ancestors(&self, rel: &Path) -> StowageResult<()> {
        let mut current = self.dest.to_path_buf();
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(m) if m.file_type().is_symlink() => {
                    return Err(StowageError::UnsafeEntry {
                        entry: rel.display().to_string(),
                    })
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => {
                    return Err(StowageError::io(format!("inspecting {}", current.display()), e))
                }
            }
        }
        Ok(())
    }

    /// Handle `.wh.` entries. Returns true when the entry was a whiteout.
    fn apply_whiteout(&self, rel: &Path, written: &HashSet<PathBuf>) -> StowageResult<bool> {
        let Some(file_name) = rel.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };
        if !file_name.starts_with(WHITEOUT_PREFIX) {
            return Ok(false);
        }
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));

        if file_name == OPAQUE_WHITEOUT {
            self.clear_opaque(parent, written)?;
            debug!(bundle = self.bundle, dir = %parent.display(), "Applied opaque whiteout");
            return Ok(true);
        }

        let hidden = &file_name[WHITEOUT_PREFIX.len()..];
        if hidden.is_empty() || hidden == "." || hidden == ".." {
            return Err(StowageError::UnsafeEntry {
                entry: rel.display().to_string(),
            });
        }
        let hidden_path = self.dest.join(parent).join(hidden);
        self.unlock_parent(&hidden_path)?;
        delete_recursive(&hidden_path)?;
        debug!(bundle = self.bundle, path = %parent.join(hidden).display(), "Applied whiteout");
        Ok(true)
    }

    /// Empty `rel_dir` of everything not written by this stream. Written
    /// directories are kept but cleared of lower content in turn.
    fn clear_opaque(&self, rel_dir: &Path, written: &HashSet<PathBuf>) -> StowageResult<()> {
        let dir = self.dest.join(rel_dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StowageError::io(format!("reading {}", dir.display()), e)),
        };
        self.unlock_dir(&dir)?;

        for child in entries {
            let child = child.map_err(|e| StowageError::io(format!("reading {}", dir.display()), e))?;
            let child_rel = rel_dir.join(child.file_name());
            if !written.contains(&child_rel) {
                delete_recursive(&child.path())?;
            } else if child.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                self.clear_opaque(&child_rel, written)?;
            }
        }
        Ok(())
    }

    /// Give the owner write access to an existing directory until the end
    /// of this extraction; read-only directories from an earlier layer must
    /// still accept entries from this one.
    #[cfg(unix)]
    fn unlock_dir(&self, dir: &Path) -> StowageResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let mode = match fs::symlink_metadata(dir) {
            Ok(m) if m.is_dir() => m.permissions().mode() & 0o7777,
            _ => return Ok(()),
        };
        if mode & 0o200 != 0 {
            return Ok(());
        }
        set_mode(dir, mode | 0o200)?;
        self.unlocked.borrow_mut().push((dir.to_path_buf(), mode));
        Ok(())
    }

    #[cfg(not(unix))]
    fn unlock_dir(&self, _dir: &Path) -> StowageResult<()> {
        Ok(())
    }

    /// Unlock the closest existing ancestor of `path` inside the destination
    fn unlock_parent(&self, path: &Path) -> StowageResult<()> {
        for dir in path.ancestors().skip(1) {
            if !dir.starts_with(self.dest) {
                break;
            }
            if fs::symlink_metadata(dir).is_ok() {
                return self.unlock_dir(dir);
            }
        }
        Ok(())
    }

    /// Put back the modes of unlocked directories that still exist
    fn restore_unlocked(&self) -> StowageResult<()> {
        let unlocked = self.unlocked.take();
        for (dir, mode) in unlocked.into_iter().rev() {
            if fs::symlink_metadata(&dir).map(|m| m.is_dir()).unwrap_or(false) {
                set_mode(&dir, mode)?;
            }
        }
        Ok(())
    }

    fn make_dir(&self, target: &Path) -> StowageResult<()> {
        if let Ok(m) = fs::symlink_metadata(target) {
            if m.is_dir() {
                return Ok(());
            }
            self.unlock_parent(target)?;
            delete_recursive(target)?;
        } else {
            self.unlock_parent(target)?;
        }
        fs::create_dir_all(target)
            .map_err(|e| StowageError::io(format!("creating directory {}", target.display()), e))
    }

    fn ensure_parent(&self, target: &Path) -> StowageResult<()> {
        match target.parent() {
            Some(parent) if parent != self.dest => self.make_dir(parent),
            _ => Ok(()),
        }
    }

    /// Parents exist and are writable, and nothing occupies `target`
    fn prepare_target(&self, target: &Path) -> StowageResult<()> {
        self.ensure_parent(target)?;
        self.unlock_parent(target)?;
        self.clear_target(target)
    }

    /// Remove whatever occupies `target` so a new entry replaces it instead
    /// of writing through it.
    fn clear_target(&self, target: &Path) -> StowageResult<()> {
        match fs::symlink_metadata(target) {
            Ok(_) => delete_recursive(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StowageError::io(format!("inspecting {}", target.display()), e)),
        }
    }

    fn write_file<R: Read>(&self, entry: &mut R, target: &Path, bits: u32) -> StowageResult<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(bits | 0o200);
        }
        let mut file = options
            .open(target)
            .map_err(|e| StowageError::io(format!("creating {}", target.display()), e))?;

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = entry.read(&mut buf).map_err(|e| self.read_error(e))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| StowageError::io(format!("writing {}", target.display()), e))?;
        }
        drop(file);

        set_mode(target, bits)
    }
}

/// Record `rel` and its ancestors as produced by the current stream, so an
/// opaque whiteout keeps directories created implicitly for a file.
fn record_written(written: &mut HashSet<PathBuf>, rel: PathBuf) {
    for ancestor in rel.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() || !written.insert(ancestor.to_path_buf()) {
            break;
        }
    }
    written.insert(rel);
}

#[cfg(unix)]
fn set_mode(path: &Path, bits: u32) -> StowageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(bits))
        .map_err(|e| StowageError::io(format!("setting mode of {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _bits: u32) -> StowageResult<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> StowageResult<()> {
    std::os::unix::fs::symlink(link, target)
        .map_err(|e| StowageError::io(format!("creating symlink {}", target.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> StowageResult<()> {
    warn!(link = %link.display(), target = %target.display(), "Symlinks are not supported on this platform");
    Ok(())
}
