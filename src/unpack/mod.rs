//! Bundle unpacking
//!
//! Turns a [`BundleSource`] into a sealed generation in the cache. Two
//! strategies share one contract:
//!
//! - [`TarGzUnpacker`]: downloads a `.tar.gz`, keys it by the sha256 of the
//!   downloaded bytes
//! - [`OciUnpacker`]: resolves an image, applies its layers in order, keys it
//!   by the manifest digest
//!
//! [`BundleUnpacker`] dispatches on the declared source type.
//!
//! # Flow
//!
//! ```text
//! validate ─► resolve digest ─► cached? ──yes──► result
//!                                  │no
//!                                  ▼
//!                          staging dir ─► extract ─► seal ro ─► rename ─► result
//!                                            │fail
//!                                            ▼
//!                                     delete staging ─► error
//! ```

pub mod archive;
mod oci;
mod registry;
mod tgz;

pub use archive::{ArchiveMode, ExtractStats};
pub use oci::{BlobProvider, LayerDescriptor, OciUnpacker, ResolvedImage};
pub use registry::RegistryBlobProvider;
pub use tgz::TarGzUnpacker;

use crate::audit::{AuditEvent, AuditLog};
use crate::bundle_fs::BundleFs;
use crate::cache::{Generation, GenerationStore};
use crate::config::Config;
use crate::error::{StowageError, StowageResult};
use crate::source::{BundleSource, Digest, SourceType};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome state of an unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpackState {
    Unpacked,
    Error,
}

impl fmt::Display for UnpackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpacked => write!(f, "unpacked"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A successfully unpacked bundle
#[derive(Debug, Clone)]
pub struct UnpackResult {
    /// Read-only view of the generation. Owned by the cache.
    pub bundle: BundleFs,
    /// Canonical form of what was fetched
    pub resolved_source: BundleSource,
    pub digest: Digest,
    pub state: UnpackState,
    pub message: String,
}

impl UnpackResult {
    pub(crate) fn unpacked(path: PathBuf, resolved_source: BundleSource, digest: Digest) -> Self {
        let message = format!("unpacked {:?} successfully", resolved_source.location());
        Self {
            bundle: BundleFs::new(path),
            resolved_source,
            digest,
            state: UnpackState::Unpacked,
            message,
        }
    }
}

/// Serializable summary of an unpack attempt, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct UnpackStatus {
    pub name: String,
    pub state: UnpackState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    pub retryable: bool,
}

impl UnpackStatus {
    pub fn from_result(name: &str, result: &StowageResult<UnpackResult>) -> Self {
        match result {
            Ok(r) => Self {
                name: name.to_string(),
                state: r.state,
                message: r.message.clone(),
                digest: Some(r.digest.clone()),
                path: Some(r.bundle.root().to_path_buf()),
                resolved: Some(r.resolved_source.location().to_string()),
                retryable: false,
            },
            Err(e) => Self {
                name: name.to_string(),
                state: UnpackState::Error,
                message: e.to_string(),
                digest: None,
                path: None,
                resolved: None,
                retryable: e.is_retryable(),
            },
        }
    }
}

/// Common contract of every unpack strategy
#[async_trait]
pub trait Unpacker: Send + Sync {
    /// Produce or reuse the generation for `source`.
    ///
    /// On failure no staging directory survives and no generation is
    /// created.
    async fn unpack(
        &self,
        source: &BundleSource,
        cancel: &CancellationToken,
    ) -> StowageResult<UnpackResult>;

    /// Remove every generation of a bundle
    async fn cleanup(&self, name: &str) -> StowageResult<()>;

    /// Remove every generation of a bundle except `keep`
    async fn garbage_collect(&self, name: &str, keep: &Digest) -> StowageResult<Vec<PathBuf>>;
}

/// Run blocking filesystem work off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> StowageResult<T>
where
    F: FnOnce() -> StowageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StowageError::Task(e.to_string()))?
}

/// Race a network call against the cancellation token. Dropping the
/// losing future aborts the in-flight request.
pub(crate) async fn cancellable<T>(
    name: &str,
    cancel: &CancellationToken,
    fut: impl Future<Output = StowageResult<T>>,
) -> StowageResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StowageError::Cancelled(name.to_string())),
        result = fut => result,
    }
}

/// Drop the namespace directory a failed first unpack left empty.
/// Failures are logged, not returned.
pub(crate) async fn prune_namespace(store: &GenerationStore, name: &str) {
    let store = store.clone();
    let bundle = name.to_string();
    if let Err(e) = blocking(move || store.remove_if_empty(&bundle)).await {
        warn!(bundle = name, error = %e, "Failed to remove empty bundle directory");
    }
}

/// Store-backed implementations shared by both strategies
pub(crate) async fn store_cleanup(store: &GenerationStore, name: &str) -> StowageResult<()> {
    let store = store.clone();
    let name = name.to_string();
    blocking(move || store.cleanup(&name)).await
}

pub(crate) async fn store_gc(
    store: &GenerationStore,
    name: &str,
    keep: &Digest,
) -> StowageResult<Vec<PathBuf>> {
    let store = store.clone();
    let name = name.to_string();
    let keep = keep.clone();
    blocking(move || store.garbage_collect(&name, &keep)).await
}

/// Dispatches unpack requests to the strategy matching the source type
pub struct BundleUnpacker {
    store: GenerationStore,
    image: Box<dyn Unpacker>,
    tar_gz: Box<dyn Unpacker>,
    audit: AuditLog,
}

impl BundleUnpacker {
    pub fn new(store: GenerationStore, image: Box<dyn Unpacker>, tar_gz: Box<dyn Unpacker>) -> Self {
        Self {
            store,
            image,
            tar_gz,
            audit: AuditLog::disabled(),
        }
    }

    /// Build the production unpacker: registry-backed images and
    /// HTTP-fetched tarballs sharing one cache root.
    pub fn from_config(config: &Config) -> StowageResult<Self> {
        let store = GenerationStore::new(config.cache.root.clone());
        let provider = RegistryBlobProvider::new(&config.registry);
        let tar_gz = TarGzUnpacker::new(store.clone(), &config.fetch)?;
        Ok(Self::new(
            store.clone(),
            Box::new(OciUnpacker::new(store.clone(), provider)),
            Box::new(tar_gz),
        )
        .with_audit(AuditLog::new(config)))
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &GenerationStore {
        &self.store
    }

    fn unpacker_for(&self, source_type: SourceType) -> &dyn Unpacker {
        match source_type {
            SourceType::Image => self.image.as_ref(),
            SourceType::TarGz => self.tar_gz.as_ref(),
        }
    }

    /// One reconcile pass: unpack, then drop every other generation.
    ///
    /// A garbage collection failure is logged and does not fail the pass;
    /// the stale generation is picked up by a later pass.
    pub async fn converge(
        &self,
        source: &BundleSource,
        cancel: &CancellationToken,
    ) -> StowageResult<UnpackResult> {
        let result = self.unpack(source, cancel).await?;
        if let Err(e) = self.garbage_collect(&source.name, &result.digest).await {
            warn!(bundle = %source.name, error = %e, "Garbage collection failed, stale generations remain");
        }
        Ok(result)
    }

    pub async fn list_generations(&self, name: &str) -> StowageResult<Vec<Generation>> {
        let store = self.store.clone();
        let name = name.to_string();
        blocking(move || store.list_generations(&name)).await
    }

    pub async fn list_bundles(&self) -> StowageResult<Vec<String>> {
        let store = self.store.clone();
        blocking(move || store.list_bundles()).await
    }
}

#[async_trait]
impl Unpacker for BundleUnpacker {
    async fn unpack(
        &self,
        source: &BundleSource,
        cancel: &CancellationToken,
    ) -> StowageResult<UnpackResult> {
        source.validate()?;
        info!(bundle = %source.name, source_type = %source.source_type, location = source.location(), "Unpacking bundle");

        let result = self
            .unpacker_for(source.source_type)
            .unpack(source, cancel)
            .await;

        let event = match &result {
            Ok(r) => AuditEvent::Unpacked {
                bundle: &source.name,
                source: r.resolved_source.location(),
                digest: &r.digest,
                path: r.bundle.root(),
            },
            Err(e) => AuditEvent::UnpackFailed {
                bundle: &source.name,
                source: source.location(),
                error: e.to_string(),
                kind: e.kind().to_string(),
            },
        };
        self.audit.record(event).await;
        result
    }

    async fn cleanup(&self, name: &str) -> StowageResult<()> {
        store_cleanup(&self.store, name).await?;
        self.audit.record(AuditEvent::Cleanup { bundle: name }).await;
        Ok(())
    }

    async fn garbage_collect(&self, name: &str, keep: &Digest) -> StowageResult<Vec<PathBuf>> {
        let removed = store_gc(&self.store, name, keep).await?;
        self.audit
            .record(AuditEvent::GarbageCollected {
                bundle: name,
                keep,
                removed: removed.len(),
            })
            .await;
        Ok(removed)
    }
}
