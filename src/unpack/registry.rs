//! Registry-backed blob provider
//!
//! Uses the `oci-distribution` crate to resolve manifests and pull layer
//! blobs from container registries.

use super::oci::{BlobProvider, LayerDescriptor, ResolvedImage};
use crate::config::schema::RegistryConfig;
use crate::error::{StowageError, StowageResult};
use crate::source::Digest;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use std::future::Future;
use std::time::Duration;

/// Pulls manifests and layers from OCI registries
pub struct RegistryBlobProvider {
    client: Client,
    auth: RegistryAuth,
    timeout: Duration,
}

impl RegistryBlobProvider {
    pub fn new(config: &RegistryConfig) -> Self {
        let protocol = if config.insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(config.insecure.clone())
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });

        let auth = match (&config.username, &config.password) {
            (Some(u), Some(p)) => RegistryAuth::Basic(u.clone(), p.clone()),
            _ => RegistryAuth::Anonymous,
        };

        Self {
            client,
            auth,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn parse_reference(reference: &str) -> StowageResult<Reference> {
        reference
            .parse::<Reference>()
            .map_err(|e| StowageError::InvalidReference {
                reference: reference.to_string(),
                reason: e.to_string(),
            })
    }

    async fn with_timeout<T>(
        &self,
        reference: &str,
        fut: impl Future<Output = StowageResult<T>>,
    ) -> StowageResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StowageError::Registry {
                reference: reference.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            })?
    }
}

#[async_trait]
impl BlobProvider for RegistryBlobProvider {
    async fn resolve(&self, reference: &str) -> StowageResult<ResolvedImage> {
        let oci_ref = Self::parse_reference(reference)?;

        let (manifest, manifest_digest) = self
            .with_timeout(reference, async {
                self.client
                    .pull_image_manifest(&oci_ref, &self.auth)
                    .await
                    .map_err(|e| StowageError::Registry {
                        reference: reference.to_string(),
                        reason: format!("failed to pull manifest: {}", e),
                    })
            })
            .await?;

        let digest: Digest = manifest_digest.parse()?;
        let pinned = format!("{}/{}@{}", oci_ref.registry(), oci_ref.repository(), digest);

        let layers = manifest
            .layers
            .iter()
            .map(|layer| LayerDescriptor {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
                size: layer.size,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            reference = %reference,
            digest = %digest,
            layers = layers.len(),
            "Resolved image manifest"
        );

        Ok(ResolvedImage {
            reference: pinned,
            digest,
            layers,
        })
    }

    async fn fetch_layer(
        &self,
        image: &ResolvedImage,
        layer: &LayerDescriptor,
    ) -> StowageResult<Vec<u8>> {
        let oci_ref = Self::parse_reference(&image.reference)?;
        let descriptor = OciDescriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
            size: layer.size,
            ..Default::default()
        };

        tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");

        let mut data: Vec<u8> = Vec::new();
        self.with_timeout(&image.reference, async {
            self.client
                .pull_blob(&oci_ref, &descriptor, &mut data)
                .await
                .map_err(|e| StowageError::Registry {
                    reference: image.reference.clone(),
                    reason: format!("failed to pull layer {}: {}", layer.digest, e),
                })
        })
        .await?;

        Ok(data)
    }
}
