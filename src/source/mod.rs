//! Bundle source declarations
//!
//! A [`BundleSource`] names where bundle content comes from. It is
//! deserialized from declared state (TOML or JSON) and validated before any
//! network or filesystem work happens.

mod digest;

pub use digest::Digest;

use crate::cache::validate_name;
use crate::error::{StowageError, StowageResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of bundle source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// OCI image in a registry
    Image,
    /// Gzipped tarball served over HTTP(S)
    TarGz,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::TarGz => write!(f, "tar-gz"),
        }
    }
}

/// OCI image source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    /// Image reference, by tag or by digest
    #[serde(rename = "ref")]
    pub reference: String,
}

/// Declared source of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSource {
    /// Identity of the owning extension; also the cache namespace
    pub name: String,

    #[serde(rename = "type")]
    pub source_type: SourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar_gz_url: Option<String>,
}

impl BundleSource {
    /// Declare an image-backed bundle
    pub fn image(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type: SourceType::Image,
            image: Some(ImageSource {
                reference: reference.into(),
            }),
            tar_gz_url: None,
        }
    }

    /// Declare a tarball-backed bundle
    pub fn tar_gz(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type: SourceType::TarGz,
            image: None,
            tar_gz_url: Some(url.into()),
        }
    }

    /// Check that the variant matching `source_type` is present and that the
    /// bundle name is safe to use as a directory name.
    pub fn validate(&self) -> StowageResult<()> {
        validate_name(&self.name)?;

        let invalid = |reason: &str| StowageError::InvalidSource {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        match self.source_type {
            SourceType::Image => {
                let image = self
                    .image
                    .as_ref()
                    .ok_or_else(|| invalid("bundle has a nil image source"))?;
                if image.reference.trim().is_empty() {
                    return Err(invalid("image reference is empty"));
                }
            }
            SourceType::TarGz => {
                let url = self
                    .tar_gz_url
                    .as_deref()
                    .ok_or_else(|| invalid("bundle has a nil tar-gz url"))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid("tar-gz url must be http:// or https://"));
                }
            }
        }

        Ok(())
    }

    /// Image reference, once validated
    pub fn image_ref(&self) -> StowageResult<&str> {
        self.image
            .as_ref()
            .map(|i| i.reference.as_str())
            .ok_or_else(|| StowageError::InvalidSource {
                name: self.name.clone(),
                reason: "bundle has a nil image source".to_string(),
            })
    }

    /// Archive URL, once validated
    pub fn tar_gz_url(&self) -> StowageResult<&str> {
        self.tar_gz_url
            .as_deref()
            .ok_or_else(|| StowageError::InvalidSource {
                name: self.name.clone(),
                reason: "bundle has a nil tar-gz url".to_string(),
            })
    }

    /// Where the content comes from, for messages
    pub fn location(&self) -> &str {
        match self.source_type {
            SourceType::Image => self.image.as_ref().map_or("", |i| i.reference.as_str()),
            SourceType::TarGz => self.tar_gz_url.as_deref().unwrap_or(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn valid_sources() {
        BundleSource::image("pkg-a", "registry/pkg-a:1.0").validate().unwrap();
        BundleSource::tar_gz("pkg-b", "https://example.com/pkg-b.tgz")
            .validate()
            .unwrap();
    }

    #[test]
    fn missing_variant_is_configuration_error() {
        let source = BundleSource {
            name: "pkg-a".to_string(),
            source_type: SourceType::Image,
            image: None,
            tar_gz_url: Some("https://example.com/a.tgz".to_string()),
        };
        let err = source.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.is_terminal());
    }

    #[test]
    fn rejects_non_http_url() {
        let err = BundleSource::tar_gz("pkg-a", "file:///etc/passwd")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn rejects_unsafe_name() {
        let err = BundleSource::image("../escape", "registry/x:1")
            .validate()
            .unwrap_err();
        assert!(matches!(err, StowageError::InvalidName { .. }));
    }

    #[test]
    fn deserializes_from_toml() {
        let source: BundleSource = toml::from_str(
            r#"
name = "pkg-a"
type = "image"

[image]
ref = "registry/pkg-a@sha256:aaaa"
"#,
        )
        .unwrap();
        assert_eq!(source.source_type, SourceType::Image);
        assert_eq!(source.image_ref().unwrap(), "registry/pkg-a@sha256:aaaa");

        let source: BundleSource = toml::from_str(
            r#"
name = "pkg-b"
type = "tar-gz"
tar_gz_url = "https://example.com/chart.tgz"
"#,
        )
        .unwrap();
        assert_eq!(source.source_type, SourceType::TarGz);
        assert_eq!(source.location(), "https://example.com/chart.tgz");
    }
}
