//! Gzipped tarball unpacking
//!
//! The archive is streamed to a temporary file while it is hashed; the
//! sha256 of the downloaded bytes becomes the generation key. Only the
//! extraction runs on the blocking pool, so cancellation interrupts a
//! stalled download.

use super::archive::{ArchiveMode, CancelReader, Extractor};
use super::{blocking, cancellable, prune_namespace, store_cleanup, store_gc, UnpackResult, Unpacker};
use crate::cache::{delete_recursive, GenerationStore};
use crate::config::schema::FetchConfig;
use crate::error::{StowageError, StowageResult};
use crate::source::{BundleSource, Digest};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Unpacks `.tar.gz` archives fetched over HTTP(S)
pub struct TarGzUnpacker {
    store: GenerationStore,
    client: reqwest::Client,
}

impl TarGzUnpacker {
    pub fn new(store: GenerationStore, fetch: &FetchConfig) -> StowageResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(fetch.user_agent.as_str())
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .build()
            .map_err(|e| StowageError::HttpClient(e.to_string()))?;
        Ok(Self { store, client })
    }

    async fn fetch_and_unpack(
        &self,
        name: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> StowageResult<(PathBuf, Digest)> {
        let (archive, digest) = self.download(name, url, cancel).await?;

        let store = self.store.clone();
        let bundle = name.to_string();
        let cancel = cancel.clone();
        blocking(move || {
            let path = extract_archive(&store, &bundle, &archive, &digest, &cancel)?;
            Ok((path, digest))
        })
        .await
    }

    /// Stream the response body into a temp file next to the generations,
    /// hashing as it goes.
    async fn download(
        &self,
        name: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> StowageResult<(NamedTempFile, Digest)> {
        let download_error = |e: reqwest::Error| StowageError::Download {
            name: name.to_string(),
            reason: e.to_string(),
        };

        let bundle_dir = self.store.layout().bundle_path(name)?;
        let archive = blocking(move || {
            fs::create_dir_all(&bundle_dir).map_err(|e| {
                StowageError::io(format!("creating directory {}", bundle_dir.display()), e)
            })?;
            tempfile::Builder::new()
                .prefix(".download-")
                .tempfile_in(&bundle_dir)
                .map_err(|e| {
                    StowageError::io(format!("creating temp file in {}", bundle_dir.display()), e)
                })
        })
        .await?;

        let mut response = cancellable(name, cancel, async {
            self.client.get(url).send().await.map_err(download_error)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StowageError::HttpStatus {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }

        let file = archive
            .as_file()
            .try_clone()
            .map_err(|e| StowageError::io("opening downloaded archive", e))?;
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StowageError::Cancelled(name.to_string())),
                chunk = response.chunk() => chunk.map_err(download_error)?,
            };
            let Some(chunk) = chunk else { break };
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| StowageError::io("writing downloaded archive", e))?;
            total += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| StowageError::io("writing downloaded archive", e))?;

        let digest = Digest::sha256_from_bytes(&hasher.finalize());
        debug!(bundle = name, url, bytes = total, digest = %digest, "Downloaded archive");
        Ok((archive, digest))
    }
}

#[async_trait]
impl Unpacker for TarGzUnpacker {
    async fn unpack(
        &self,
        source: &BundleSource,
        cancel: &CancellationToken,
    ) -> StowageResult<UnpackResult> {
        source.validate()?;
        let url = source.tar_gz_url()?.to_string();

        let (path, digest) = match self.fetch_and_unpack(&source.name, &url, cancel).await {
            Ok(found) => found,
            Err(e) => {
                prune_namespace(&self.store, &source.name).await;
                return Err(e);
            }
        };

        Ok(UnpackResult::unpacked(
            path,
            BundleSource::tar_gz(source.name.clone(), url),
            digest,
        ))
    }

    async fn cleanup(&self, name: &str) -> StowageResult<()> {
        store_cleanup(&self.store, name).await
    }

    async fn garbage_collect(&self, name: &str, keep: &Digest) -> StowageResult<Vec<PathBuf>> {
        store_gc(&self.store, name, keep).await
    }
}

/// Extract a downloaded archive into a new generation, or reuse the one
/// already sealed under `digest`.
fn extract_archive(
    store: &GenerationStore,
    name: &str,
    archive: &NamedTempFile,
    digest: &Digest,
    cancel: &CancellationToken,
) -> StowageResult<PathBuf> {
    if let Some(path) = store.find(name, digest)? {
        debug!(bundle = name, digest = %digest, "Reusing cached generation");
        return Ok(path);
    }

    let staging = store.begin_staging(name)?;
    info!(bundle = name, digest = %digest, path = %staging.display(), "Unpacking archive");

    let extracted = archive
        .reopen()
        .map_err(|e| StowageError::io("reopening downloaded archive", e))
        .and_then(|file| {
            let reader = CancelReader::new(BufReader::new(file), cancel.clone());
            Extractor::new(name, &staging, ArchiveMode::Plain, cancel)
                .extract(GzDecoder::new(reader))
        })
        .and_then(|_| store.commit(name, &staging, digest));

    extracted.map_err(|e| StowageError::rolled_back(e, delete_recursive(&staging)))
}
