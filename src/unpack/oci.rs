//! OCI image unpacking
//!
//! Layers are applied strictly in manifest order onto one staging
//! directory; later layers may overwrite or white out earlier content.

use super::archive::{ArchiveMode, CancelReader, Extractor};
use super::{blocking, cancellable, prune_namespace, store_cleanup, store_gc, UnpackResult, Unpacker};
use crate::cache::{delete_recursive, GenerationStore};
use crate::error::{StowageError, StowageResult};
use crate::source::{BundleSource, Digest};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// One layer as listed in the image manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

/// An image reference resolved to its manifest digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Reference pinned by digest (`registry/repo@sha256:...`)
    pub reference: String,
    pub digest: Digest,
    /// Layers in application order
    pub layers: Vec<LayerDescriptor>,
}

/// Source of image metadata and layer content
#[async_trait]
pub trait BlobProvider: Send + Sync {
    /// Resolve a reference to its manifest digest and ordered layers
    async fn resolve(&self, reference: &str) -> StowageResult<ResolvedImage>;

    /// Fetch the raw (possibly compressed) bytes of one layer
    async fn fetch_layer(
        &self,
        image: &ResolvedImage,
        layer: &LayerDescriptor,
    ) -> StowageResult<Vec<u8>>;
}

/// Unpacks OCI images into digest-scoped generations
pub struct OciUnpacker<P> {
    store: GenerationStore,
    provider: P,
}

impl<P: BlobProvider> OciUnpacker<P> {
    pub fn new(store: GenerationStore, provider: P) -> Self {
        Self { store, provider }
    }

    async fn apply_layers(
        &self,
        name: &str,
        staging: &Path,
        image: &ResolvedImage,
        cancel: &CancellationToken,
    ) -> StowageResult<()> {
        for (index, layer) in image.layers.iter().enumerate() {
            let data = cancellable(name, cancel, self.provider.fetch_layer(image, layer))
                .await
                .map_err(|e| layer_error(index, "getting blob for", e))?;
            verify_layer(name, index, layer, &data)?;

            let (bundle, dest, media_type, token) = (
                name.to_string(),
                staging.to_path_buf(),
                layer.media_type.clone(),
                cancel.clone(),
            );
            let stats = blocking(move || apply_layer(&bundle, &dest, index, &media_type, &data, &token))
                .await
                .map_err(|e| layer_error(index, "applying", e))?;

            debug!(
                bundle = name,
                layer = index,
                digest = %layer.digest,
                files = stats.files,
                whiteouts = stats.whiteouts,
                "Applied layer"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<P: BlobProvider> Unpacker for OciUnpacker<P> {
    async fn unpack(
        &self,
        source: &BundleSource,
        cancel: &CancellationToken,
    ) -> StowageResult<UnpackResult> {
        source.validate()?;
        let name = source.name.as_str();
        let reference = source.image_ref()?;

        let image = cancellable(name, cancel, self.provider.resolve(reference)).await?;
        let resolved = BundleSource::image(name, image.reference.clone());

        let store = self.store.clone();
        let (bundle, digest) = (name.to_string(), image.digest.clone());
        if let Some(path) = blocking(move || store.find(&bundle, &digest)).await? {
            debug!(bundle = name, digest = %image.digest, "Reusing cached generation");
            return Ok(UnpackResult::unpacked(path, resolved, image.digest));
        }

        let store = self.store.clone();
        let bundle = name.to_string();
        let staging = blocking(move || store.begin_staging(&bundle)).await?;
        info!(bundle = name, digest = %image.digest, layers = image.layers.len(), path = %staging.display(), "Unpacking image");

        let outcome = match self.apply_layers(name, &staging, &image, cancel).await {
            Ok(()) => {
                let store = self.store.clone();
                let (bundle, staged, digest) = (name.to_string(), staging.clone(), image.digest.clone());
                blocking(move || store.commit(&bundle, &staged, &digest)).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(path) => Ok(UnpackResult::unpacked(path, resolved, image.digest)),
            Err(e) => {
                let staged = staging.clone();
                let cleanup = blocking(move || delete_recursive(&staged)).await;
                prune_namespace(&self.store, name).await;
                Err(StowageError::rolled_back(e, cleanup))
            }
        }
    }

    async fn cleanup(&self, name: &str) -> StowageResult<()> {
        store_cleanup(&self.store, name).await
    }

    async fn garbage_collect(&self, name: &str, keep: &Digest) -> StowageResult<Vec<PathBuf>> {
        store_gc(&self.store, name, keep).await
    }
}

fn layer_error(index: usize, action: &str, e: StowageError) -> StowageError {
    match e {
        StowageError::Cancelled(_)
        | StowageError::UnsafeEntry { .. }
        | StowageError::UnsupportedLayer { .. } => e,
        StowageError::Decode { name, reason } => StowageError::Decode {
            name,
            reason: format!("error {} layer[{}]: {}", action, index, reason),
        },
        StowageError::Registry { reference, reason } => StowageError::Registry {
            reference,
            reason: format!("error {} layer[{}]: {}", action, index, reason),
        },
        other => other,
    }
}

/// Check fetched bytes against the sha256 digest in the manifest.
fn verify_layer(name: &str, index: usize, layer: &LayerDescriptor, data: &[u8]) -> StowageResult<()> {
    let Ok(expected) = layer.digest.parse::<Digest>() else {
        return Err(StowageError::decode(
            name,
            format!("layer[{}] has malformed digest {:?}", index, layer.digest),
        ));
    };
    if expected.algorithm() != "sha256" {
        return Ok(());
    }
    let actual = Digest::sha256_of(data);
    if actual != expected {
        return Err(StowageError::decode(
            name,
            format!("layer[{}] digest mismatch: expected {}, got {}", index, expected, actual),
        ));
    }
    Ok(())
}

fn apply_layer(
    name: &str,
    dest: &Path,
    index: usize,
    media_type: &str,
    data: &[u8],
    cancel: &CancellationToken,
) -> StowageResult<super::ExtractStats> {
    if media_type.contains("zstd") || data.starts_with(&ZSTD_MAGIC) {
        return Err(StowageError::UnsupportedLayer {
            index,
            media_type: media_type.to_string(),
        });
    }

    let extractor = Extractor::new(name, dest, ArchiveMode::Layer, cancel);
    let reader = CancelReader::new(data, cancel.clone());
    if data.starts_with(&GZIP_MAGIC) {
        extractor.extract(GzDecoder::new(reader))
    } else {
        extractor.extract(reader)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::archive::tests::{build_tar, gzip, TestEntry};
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

    /// In-memory registry keyed by reference
    #[derive(Default, Clone)]
    pub(crate) struct MemoryProvider {
        images: HashMap<String, (ResolvedImage, Vec<Vec<u8>>)>,
        fail_layer: Option<usize>,
        fetches: Arc<AtomicUsize>,
    }

    impl MemoryProvider {
        /// Register an image whose layers each hold the given `(path, content)` files
        pub(crate) fn with_image(self, reference: &str, digest: char, layers: Vec<Vec<(&str, &str)>>) -> Self {
            let blobs = layers
                .iter()
                .map(|files| {
                    let entries: Vec<TestEntry<'_>> = files
                        .iter()
                        .map(|(p, c)| TestEntry::File(p, 0o644, c.as_bytes()))
                        .collect();
                    gzip(&build_tar(&entries))
                })
                .collect();
            self.with_blobs(reference, digest, blobs)
        }

        pub(crate) fn with_blobs(mut self, reference: &str, digest: char, blobs: Vec<Vec<u8>>) -> Self {
            let digest: Digest = format!("sha256:{}", digest.to_string().repeat(64)).parse().unwrap();
            let layers = blobs
                .iter()
                .map(|b| LayerDescriptor {
                    digest: Digest::sha256_of(b).to_string(),
                    media_type: LAYER_MEDIA_TYPE.to_string(),
                    size: b.len() as i64,
                })
                .collect();
            let image = ResolvedImage {
                reference: format!("registry/pkg@{}", digest),
                digest,
                layers,
            };
            self.images.insert(reference.to_string(), (image, blobs));
            self
        }

        pub(crate) fn failing_at(mut self, layer: usize) -> Self {
            self.fail_layer = Some(layer);
            self
        }
    }

    #[async_trait]
    impl BlobProvider for MemoryProvider {
        async fn resolve(&self, reference: &str) -> StowageResult<ResolvedImage> {
            self.images
                .get(reference)
                .map(|(image, _)| image.clone())
                .ok_or_else(|| StowageError::Registry {
                    reference: reference.to_string(),
                    reason: "manifest unknown".to_string(),
                })
        }

        async fn fetch_layer(&self, image: &ResolvedImage, layer: &LayerDescriptor) -> StowageResult<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let index = image.layers.iter().position(|l| l == layer).unwrap();
            if self.fail_layer == Some(index) {
                return Err(StowageError::Registry {
                    reference: image.reference.clone(),
                    reason: "blob unknown".to_string(),
                });
            }
            let (_, blobs) = self.images.values().find(|(i, _)| i == image).unwrap();
            Ok(blobs[index].clone())
        }
    }

    fn unpacker(root: &Path, provider: MemoryProvider) -> OciUnpacker<MemoryProvider> {
        OciUnpacker::new(GenerationStore::new(root), provider)
    }

    fn digest(c: char) -> Digest {
        format!("sha256:{}", c.to_string().repeat(64)).parse().unwrap()
    }

    fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let bundle = crate::bundle_fs::BundleFs::new(root.to_path_buf());
        bundle
            .load_files()
            .unwrap()
            .into_iter()
            .map(|f| (PathBuf::from(f.name), f.data))
            .collect()
    }

    #[tokio::test]
    async fn unpacks_layers_in_order() {
        let tmp = TempDir::new().unwrap();
        let provider = MemoryProvider::default().with_image(
            "registry/pkg-a:1",
            'a',
            vec![
                vec![("Chart.yaml", "version: 1"), ("values.yaml", "a: 1")],
                vec![("values.yaml", "a: 2")],
            ],
        );
        let unpacker = unpacker(tmp.path(), provider);

        let result = unpacker
            .unpack(&BundleSource::image("pkg-a", "registry/pkg-a:1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.digest, digest('a'));
        assert_eq!(
            result.bundle.root(),
            GenerationStore::new(tmp.path())
                .layout()
                .generation_path("pkg-a", &digest('a'))
                .unwrap()
        );
        assert_eq!(result.bundle.read_to_string("values.yaml").unwrap(), "a: 2");
        assert_eq!(
            result.resolved_source.image_ref().unwrap(),
            format!("registry/pkg@{}", digest('a'))
        );
    }

    #[tokio::test]
    async fn generation_is_read_only() {
        let tmp = TempDir::new().unwrap();
        let provider = MemoryProvider::default()
            .with_image("r/x:1", 'a', vec![vec![("dir/file.txt", "content")]]);
        let result = unpacker(tmp.path(), provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
            .await
            .unwrap();

        let root = result.bundle.root();
        for p in [root.to_path_buf(), root.join("dir"), root.join("dir/file.txt")] {
            assert!(fs::metadata(&p).unwrap().permissions().readonly(), "{:?} writable", p);
        }
    }

    #[tokio::test]
    async fn cached_generation_is_reused() {
        let tmp = TempDir::new().unwrap();
        let provider = MemoryProvider::default().with_image("r/x:1", 'a', vec![vec![("f", "x")]]);
        let fetches = provider.fetches.clone();
        let unpacker = unpacker(tmp.path(), provider);
        let source = BundleSource::image("pkg-a", "r/x:1");

        unpacker.unpack(&source, &CancellationToken::new()).await.unwrap();
        unpacker.unpack(&source, &CancellationToken::new()).await.unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_digest_after_gc_is_identical() {
        let tmp = TempDir::new().unwrap();
        let provider = MemoryProvider::default()
            .with_image("r/x:1", 'a', vec![vec![("a/b.txt", "one"), ("c.txt", "two")], vec![("a/d.txt", "three")]])
            .with_image("r/x:2", 'b', vec![vec![("other", "x")]]);
        let unpacker = unpacker(tmp.path(), provider);
        let cancel = CancellationToken::new();
        let source = BundleSource::image("pkg-a", "r/x:1");

        let first = unpacker.unpack(&source, &cancel).await.unwrap();
        let before = snapshot(first.bundle.root());

        let other = unpacker.unpack(&BundleSource::image("pkg-a", "r/x:2"), &cancel).await.unwrap();
        unpacker.garbage_collect("pkg-a", &other.digest).await.unwrap();
        assert!(!first.bundle.root().exists());

        let second = unpacker.unpack(&source, &cancel).await.unwrap();
        assert_eq!(snapshot(second.bundle.root()), before);
    }

    #[tokio::test]
    async fn failed_layer_leaves_no_generation() {
        for fail_at in 0..3 {
            let tmp = TempDir::new().unwrap();
            let provider = MemoryProvider::default()
                .with_image(
                    "r/x:1",
                    'a',
                    vec![vec![("one", "1")], vec![("two", "2")], vec![("three", "3")]],
                )
                .failing_at(fail_at);
            let unpacker = unpacker(tmp.path(), provider);

            let err = unpacker
                .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
                .await
                .unwrap_err();

            assert!(err.to_string().contains(&format!("layer[{}]", fail_at)), "{}", err);
            let store = GenerationStore::new(tmp.path());
            assert!(!store.layout().generation_path("pkg-a", &digest('a')).unwrap().exists());
            assert!(store.list_generations("pkg-a").unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn corrupt_layer_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let good = gzip(&build_tar(&[TestEntry::File("ok", 0o644, b"ok")]));
        let corrupt = vec![0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad, 0xbe, 0xef];
        let provider = MemoryProvider::default().with_blobs("r/x:1", 'a', vec![good, corrupt]);

        let err = unpacker(tmp.path(), provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_terminal());
        assert!(GenerationStore::new(tmp.path()).list_generations("pkg-a").unwrap().is_empty());
        assert!(!tmp.path().join("pkg-a").exists());
    }

    #[tokio::test]
    async fn traversal_in_layer_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        let evil = gzip(&build_tar(&[TestEntry::File("../../escape", 0o644, b"x")]));
        let provider = MemoryProvider::default().with_blobs("r/x:1", 'a', vec![evil]);

        let err = unpacker(&cache, provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StowageError::RolledBack { .. }));
        assert!(!cache.join("escape").exists());
        assert!(GenerationStore::new(&cache).list_generations("pkg-a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn whiteouts_across_layers() {
        let tmp = TempDir::new().unwrap();
        let base = gzip(&build_tar(&[
            TestEntry::File("templates/old.yaml", 0o644, b"old"),
            TestEntry::File("templates/keep.yaml", 0o644, b"keep"),
        ]));
        let top = build_tar(&[TestEntry::File("templates/.wh.old.yaml", 0o644, b"")]);
        let provider = MemoryProvider::default().with_blobs("r/x:1", 'a', vec![base, top]);

        let result = unpacker(tmp.path(), provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.bundle.walk().unwrap(), vec![PathBuf::from("templates/keep.yaml")]);
    }

    #[tokio::test]
    async fn digest_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut provider = MemoryProvider::default().with_image("r/x:1", 'a', vec![vec![("f", "x")]]);
        for (image, _) in provider.images.values_mut() {
            image.layers[0].digest = digest('f').to_string();
        }

        let err = unpacker(tmp.path(), provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn zstd_layers_are_unsupported() {
        let tmp = TempDir::new().unwrap();
        let mut provider = MemoryProvider::default().with_image("r/x:1", 'a', vec![vec![("f", "x")]]);
        for (image, _) in provider.images.values_mut() {
            image.layers[0].media_type = "application/vnd.oci.image.layer.v1.tar+zstd".to_string();
        }

        let err = unpacker(tmp.path(), provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_terminal());
        assert!(err.to_string().contains("zstd"));
    }

    #[tokio::test]
    async fn cancellation_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let provider = MemoryProvider::default().with_image("r/x:1", 'a', vec![vec![("f", "x")]]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = unpacker(tmp.path(), provider)
            .unpack(&BundleSource::image("pkg-a", "r/x:1"), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert!(GenerationStore::new(tmp.path()).list_generations("pkg-a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_digest_rollover() {
        let tmp = TempDir::new().unwrap();
        let provider = MemoryProvider::default()
            .with_image("registry/pkg-a@sha256:AAA", 'a', vec![vec![("Chart.yaml", "version: 1")]])
            .with_image("registry/pkg-a@sha256:BBB", 'b', vec![vec![("Chart.yaml", "version: 2")]]);
        let unpacker = unpacker(tmp.path(), provider);
        let cancel = CancellationToken::new();

        unpacker
            .unpack(&BundleSource::image("pkg-a", "registry/pkg-a@sha256:AAA"), &cancel)
            .await
            .unwrap();
        let current = unpacker
            .unpack(&BundleSource::image("pkg-a", "registry/pkg-a@sha256:BBB"), &cancel)
            .await
            .unwrap();
        unpacker.garbage_collect("pkg-a", &current.digest).await.unwrap();

        let entries: Vec<String> = fs::read_dir(tmp.path().join("pkg-a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![digest('b').to_string()]);
    }
}
