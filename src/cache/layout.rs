//! Cache directory naming
//!
//! Pure path logic: maps a bundle name and content digest onto a directory
//! under the cache root. Nothing here touches the filesystem.

use crate::error::{StowageError, StowageResult};
use crate::source::Digest;
use std::path::{Component, Path, PathBuf};

/// Prefix for in-flight unpack directories inside a bundle namespace
pub const STAGING_PREFIX: &str = ".staging-";

const MAX_NAME_LEN: usize = 253;

/// Reject bundle names that are not safe to use as a single path segment.
///
/// Names come from declared configuration and are never trusted to be
/// filesystem-safe. A leading `.` is reserved for staging directories.
pub fn validate_name(name: &str) -> StowageResult<()> {
    let invalid = |reason: &str| StowageError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 253 bytes"));
    }
    if name.starts_with('.') {
        return Err(invalid("name must not start with '.'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(invalid(&format!("character {:?} is not allowed", c)));
    }
    Ok(())
}

/// Normalize a path that must stay inside some root directory.
///
/// `.` components are dropped; absolute paths, drive prefixes and `..`
/// components are refused. An empty result means the root itself.
pub fn contained_path(raw: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Directory layout of the unpack cache
///
/// ```text
/// <root>/
/// └── <bundle name>/
///     ├── sha256:<hex>/        sealed, read-only generation
///     └── .staging-<token>/    unpack in progress
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Namespace directory holding every generation of one bundle
    pub fn bundle_path(&self, name: &str) -> StowageResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Directory of one immutable generation
    pub fn generation_path(&self, name: &str, digest: &Digest) -> StowageResult<PathBuf> {
        Ok(self.bundle_path(name)?.join(digest.to_string()))
    }

    /// Directory an unpack writes into before it is sealed and renamed
    pub fn staging_path(&self, name: &str, token: &str) -> StowageResult<PathBuf> {
        Ok(self.bundle_path(name)?.join(format!("{}{}", STAGING_PREFIX, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> Digest {
        format!("sha256:{}", c.to_string().repeat(64)).parse().unwrap()
    }

    #[test]
    fn paths_nest_under_root() {
        let layout = CacheLayout::new("/var/cache/stowage");
        assert_eq!(
            layout.bundle_path("pkg-a").unwrap(),
            PathBuf::from("/var/cache/stowage/pkg-a")
        );
        assert_eq!(
            layout.generation_path("pkg-a", &digest('a')).unwrap(),
            PathBuf::from(format!("/var/cache/stowage/pkg-a/sha256:{}", "a".repeat(64)))
        );
        assert_eq!(
            layout.staging_path("pkg-a", "x1").unwrap(),
            PathBuf::from("/var/cache/stowage/pkg-a/.staging-x1")
        );
    }

    #[test]
    fn distinct_inputs_never_collide() {
        let layout = CacheLayout::new("/c");
        let pairs = [("a", 'a'), ("a", 'b'), ("b", 'a'), ("a.b", 'a')];
        let mut seen = std::collections::HashSet::new();
        for (name, c) in pairs {
            assert!(seen.insert(layout.generation_path(name, &digest(c)).unwrap()));
        }
    }

    #[test]
    fn rejects_unsafe_names() {
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", ".staging-x", "a\0b", "a b"] {
            assert!(validate_name(bad).is_err(), "accepted {:?}", bad);
        }
        assert!(validate_name(&"x".repeat(254)).is_err());
    }

    #[test]
    fn accepts_identity_names() {
        for good in ["pkg-a", "argocd-operator.v0.6", "my_ext", "A1"] {
            validate_name(good).unwrap();
        }
    }

    #[test]
    fn contained_path_normalizes() {
        assert_eq!(
            contained_path(Path::new("./a/./b.txt")),
            Some(PathBuf::from("a/b.txt"))
        );
        assert_eq!(contained_path(Path::new("./")), Some(PathBuf::new()));
        assert_eq!(contained_path(Path::new("../a")), None);
        assert_eq!(contained_path(Path::new("a/../../b")), None);
        assert_eq!(contained_path(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn layout_validates_before_joining() {
        let layout = CacheLayout::new("/c");
        assert!(layout.bundle_path("..").is_err());
        assert!(layout.generation_path("/abs", &digest('a')).is_err());
    }
}
