//! Transfer jobs
//!
//! [`ImageSource`] and [`ImageTarget`] bind a registry client to one
//! repository and tag. A [`TransferJob`] copies everything a tagged image
//! stands for from its source to its target: blobs first, deduplicated
//! against the target, then manifests, children before the enclosing list.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::{Result, TransferError};
use crate::manifest::{self, ImageManifest};
use crate::registry::{BlobInfo, BlobStream, Registry};

/// A remote image to pull from.
pub struct ImageSource {
    registry: Arc<dyn Registry>,
    registry_host: String,
    repository: String,
    tag: String,
}

impl ImageSource {
    /// The repository string must not include a tag; the tag may be empty
    /// when only tag listing is needed.
    pub fn new(
        registry: Arc<dyn Registry>,
        registry_host: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self> {
        let repository = repository.into();
        if repository.contains(':') {
            return Err(TransferError::InvalidUrl(format!(
                "repository string should not include tag: {}",
                repository
            )));
        }
        Ok(ImageSource {
            registry,
            registry_host: registry_host.into(),
            repository,
            tag: tag.into(),
        })
    }

    pub fn registry_host(&self) -> &str {
        &self.registry_host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Fetch the manifest this source's tag points at.
    pub async fn manifest(&self) -> Result<(Vec<u8>, String)> {
        if self.tag.is_empty() {
            return Err(TransferError::registry(
                "can not get manifest without a tag",
            ));
        }
        self.registry.fetch_manifest(&self.repository, &self.tag).await
    }

    /// Fetch a manifest by digest, used for manifest-list children.
    pub async fn manifest_by_digest(&self, digest: &str) -> Result<(Vec<u8>, String)> {
        self.registry.fetch_manifest(&self.repository, digest).await
    }

    /// The union of blob infos across every concrete sub-manifest of the
    /// given manifest.
    pub async fn blob_infos(&self, payload: &[u8], media: &str) -> Result<Vec<BlobInfo>> {
        let resolved: Vec<ImageManifest> =
            manifest::resolve(self.registry.as_ref(), &self.repository, payload, media).await?;

        let mut blobs = Vec::new();
        for m in &resolved {
            blobs.extend(m.blob_infos());
        }
        Ok(blobs)
    }

    /// Open a blob stream. The expected size is deliberately left unknown;
    /// the registry reports the true size back.
    pub async fn blob(&self, info: &BlobInfo) -> Result<(BlobStream, i64)> {
        self.registry.open_blob(&self.repository, &info.digest).await
    }

    pub async fn tags(&self) -> Result<Vec<String>> {
        self.registry.list_tags(&self.repository).await
    }

    /// Digest of the manifest at this source's tag.
    pub async fn digest(&self) -> Result<String> {
        self.registry.manifest_digest(&self.repository, &self.tag).await
    }
}

/// A remote image to push to.
pub struct ImageTarget {
    registry: Arc<dyn Registry>,
    registry_host: String,
    repository: String,
    tag: String,
}

impl ImageTarget {
    pub fn new(
        registry: Arc<dyn Registry>,
        registry_host: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self> {
        let repository = repository.into();
        if repository.contains(':') {
            return Err(TransferError::InvalidUrl(format!(
                "repository string should not include tag: {}",
                repository
            )));
        }
        Ok(ImageTarget {
            registry,
            registry_host: registry_host.into(),
            repository,
            tag: tag.into(),
        })
    }

    pub fn registry_host(&self) -> &str {
        &self.registry_host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn check_blob_exist(&self, info: &BlobInfo) -> Result<bool> {
        self.registry.try_reuse_blob(&self.repository, info).await
    }

    pub async fn put_blob(&self, stream: BlobStream, info: &BlobInfo) -> Result<()> {
        self.registry.put_blob(&self.repository, stream, info).await
    }

    /// Push manifest bytes. `reference` defaults to this target's tag;
    /// list children are pushed under their own digest instead.
    pub async fn push_manifest(
        &self,
        payload: Vec<u8>,
        media: &str,
        reference: Option<&str>,
    ) -> Result<()> {
        let reference = reference.unwrap_or(&self.tag);
        self.registry
            .put_manifest(&self.repository, reference, media, payload)
            .await
    }

    pub async fn tags(&self) -> Result<Vec<String>> {
        self.registry.list_tags(&self.repository).await
    }

    /// Digest of whatever is currently at this target's tag, empty when
    /// the tag does not exist.
    pub async fn digest(&self) -> Result<String> {
        self.registry.manifest_digest(&self.repository, &self.tag).await
    }
}

/// One source-to-target copy of a single tagged image.
pub struct TransferJob {
    pub source: ImageSource,
    pub target: ImageTarget,
}

impl TransferJob {
    pub fn new(source: ImageSource, target: ImageTarget) -> Self {
        TransferJob { source, target }
    }

    pub fn source_url(&self) -> String {
        format!(
            "{}/{}:{}",
            self.source.registry_host(),
            self.source.repository(),
            self.source.tag()
        )
    }

    pub fn target_url(&self) -> String {
        format!(
            "{}/{}:{}",
            self.target.registry_host(),
            self.target.repository(),
            self.target.tag()
        )
    }

    /// Run the copy once. Any failure aborts the job; retries happen at
    /// the pipeline level and replay the whole protocol.
    pub async fn run(&self) -> Result<()> {
        let (manifest_bytes, manifest_type) = self.source.manifest().await.map_err(|e| {
            error!("failed to get manifest from {}: {}", self.source_url(), e);
            e
        })?;
        info!("get manifest from {}", self.source_url());

        let blob_infos = self
            .source
            .blob_infos(&manifest_bytes, &manifest_type)
            .await
            .map_err(|e| {
                error!("get blob info from {} error: {}", self.source_url(), e);
                e
            })?;

        for info in &blob_infos {
            let exists = self.target.check_blob_exist(info).await.map_err(|e| {
                error!(
                    "check blob {} exist at {} error: {}",
                    info.digest,
                    self.target_url(),
                    e
                );
                e
            })?;

            if exists {
                info!(
                    "blob {}({}) has been pushed to {}/{}, will not be pulled",
                    info.digest,
                    info.size,
                    self.target.registry_host(),
                    self.target.repository()
                );
                continue;
            }

            let (stream, size) = self.source.blob(info).await.map_err(|e| {
                error!(
                    "get blob {} from {} failed: {}",
                    info.digest,
                    self.source_url(),
                    e
                );
                e
            })?;

            // record the true size reported by the source
            let upload = BlobInfo::new(info.digest.clone(), size);
            self.target.put_blob(stream, &upload).await.map_err(|e| {
                error!(
                    "put blob {}({}) to {} failed: {}",
                    upload.digest,
                    upload.size,
                    self.target_url(),
                    e
                );
                e
            })?;
            info!(
                "put blob {}({}) to {} success",
                upload.digest,
                upload.size,
                self.target_url()
            );
        }

        // children of a list must land before the list itself
        if let Some(children) = manifest::list_descriptors(&manifest_bytes, &manifest_type)? {
            for descriptor in &children {
                let (child_bytes, child_type) = self
                    .source
                    .manifest_by_digest(&descriptor.digest)
                    .await
                    .map_err(|e| {
                        error!(
                            "get manifest {} for manifest list error: {}",
                            descriptor.digest, e
                        );
                        e
                    })?;

                self.target
                    .push_manifest(child_bytes, &child_type, Some(&descriptor.digest))
                    .await
                    .map_err(|e| {
                        error!("put manifest to {} error: {}", self.target_url(), e);
                        e
                    })?;
                info!(
                    "put manifest {} to {}",
                    descriptor.digest,
                    self.target_url()
                );
            }

            self.target
                .push_manifest(manifest_bytes, &manifest_type, None)
                .await
                .map_err(|e| {
                    error!("put manifest list to {} error: {}", self.target_url(), e);
                    e
                })?;
            info!("put manifest list to {}", self.target_url());
        } else {
            self.target
                .push_manifest(manifest_bytes, &manifest_type, None)
                .await
                .map_err(|e| {
                    error!("put manifest to {} error: {}", self.target_url(), e);
                    e
                })?;
            info!("put manifest to {}", self.target_url());
        }

        info!(
            "synchronized {} to {}",
            self.source_url(),
            self.target_url()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::media_type;
    use crate::registry::memory::{FailOp, MemoryRegistry};

    fn seed_single_image(
        registry: &MemoryRegistry,
        repository: &str,
        tag: &str,
        layers: &[&[u8]],
    ) -> Vec<String> {
        let mut digests: Vec<String> = layers
            .iter()
            .map(|l| registry.add_blob(repository, l.to_vec()))
            .collect();
        let config_digest = registry.add_blob(repository, &b"{\"os\":\"linux\"}"[..]);

        let layer_json: Vec<serde_json::Value> = digests
            .iter()
            .map(|d| {
                serde_json::json!({
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "size": 100,
                    "digest": d,
                })
            })
            .collect();
        let payload = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::DOCKER_V2_SCHEMA2,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": 14,
                "digest": config_digest,
            },
            "layers": layer_json,
        }))
        .unwrap();
        registry.set_manifest(repository, tag, media_type::DOCKER_V2_SCHEMA2, payload);
        digests.push(config_digest);
        digests
    }

    fn job(
        source: &Arc<MemoryRegistry>,
        target: &Arc<MemoryRegistry>,
        repository: &str,
        tag: &str,
    ) -> TransferJob {
        let src = ImageSource::new(
            Arc::clone(source) as Arc<dyn Registry>,
            "reg-a.example.com",
            repository,
            tag,
        )
        .unwrap();
        let dst = ImageTarget::new(
            Arc::clone(target) as Arc<dyn Registry>,
            "reg-b.example.com",
            repository,
            tag,
        )
        .unwrap();
        TransferJob::new(src, dst)
    }

    #[tokio::test]
    async fn test_run_copies_blobs_and_manifest() {
        let source = Arc::new(MemoryRegistry::new());
        let target = Arc::new(MemoryRegistry::new());
        let digests = seed_single_image(&source, "ns/app", "v1", &[b"layer-1", b"layer-2"]);

        job(&source, &target, "ns/app", "v1").run().await.unwrap();

        assert_eq!(target.blob_put_count(), 3); // two layers + config
        assert_eq!(target.manifest_put_count(), 1);
        for digest in &digests {
            assert!(target.has_blob("ns/app", digest));
        }
        assert!(target.has_manifest("ns/app", "v1"));
    }

    #[tokio::test]
    async fn test_run_skips_existing_blobs() {
        let source = Arc::new(MemoryRegistry::new());
        let target = Arc::new(MemoryRegistry::new());
        seed_single_image(&source, "ns/app", "v1", &[b"layer-1"]);
        // pre-place the layer at the target
        target.add_blob("ns/app", &b"layer-1"[..]);

        job(&source, &target, "ns/app", "v1").run().await.unwrap();

        // only the config blob travelled
        assert_eq!(target.blob_put_count(), 1);
    }

    #[tokio::test]
    async fn test_run_rejects_repository_with_tag() {
        let registry = Arc::new(MemoryRegistry::new());
        let result = ImageSource::new(
            Arc::clone(&registry) as Arc<dyn Registry>,
            "reg",
            "ns/app:v1",
            "v1",
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_manifest_list_children_precede_list() {
        let source = Arc::new(MemoryRegistry::new());
        let target = Arc::new(MemoryRegistry::new());

        seed_single_image(&source, "ns/app", "child-a", &[b"layer-a"]);
        seed_single_image(&source, "ns/app", "child-b", &[b"layer-b"]);
        let (payload_a, _) = source.fetch_manifest("ns/app", "child-a").await.unwrap();
        let (payload_b, _) = source.fetch_manifest("ns/app", "child-b").await.unwrap();
        let digest_a = crate::registry::sha256_digest(&payload_a);
        let digest_b = crate::registry::sha256_digest(&payload_b);

        let list = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::DOCKER_V2_LIST,
            "manifests": [
                {"mediaType": media_type::DOCKER_V2_SCHEMA2, "size": 1, "digest": digest_a,
                 "platform": {"architecture": "amd64", "os": "linux"}},
                {"mediaType": media_type::DOCKER_V2_SCHEMA2, "size": 1, "digest": digest_b,
                 "platform": {"architecture": "arm64", "os": "linux"}},
            ],
        }))
        .unwrap();
        source.set_manifest("ns/app", "v1", media_type::DOCKER_V2_LIST, list);

        job(&source, &target, "ns/app", "v1").run().await.unwrap();

        let log = target.manifest_put_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].1, digest_a);
        assert_eq!(log[1].1, digest_b);
        assert_eq!(log[2].1, "v1");
    }

    #[tokio::test]
    async fn test_failed_child_put_never_publishes_list() {
        let source = Arc::new(MemoryRegistry::new());
        let target = Arc::new(MemoryRegistry::new());

        seed_single_image(&source, "ns/app", "child-a", &[b"layer-a"]);
        seed_single_image(&source, "ns/app", "child-b", &[b"layer-b"]);
        let (payload_a, _) = source.fetch_manifest("ns/app", "child-a").await.unwrap();
        let (payload_b, _) = source.fetch_manifest("ns/app", "child-b").await.unwrap();
        let digest_a = crate::registry::sha256_digest(&payload_a);
        let digest_b = crate::registry::sha256_digest(&payload_b);

        let list = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::DOCKER_V2_LIST,
            "manifests": [
                {"mediaType": media_type::DOCKER_V2_SCHEMA2, "size": 1, "digest": digest_a},
                {"mediaType": media_type::DOCKER_V2_SCHEMA2, "size": 1, "digest": digest_b},
            ],
        }))
        .unwrap();
        source.set_manifest("ns/app", "v1", media_type::DOCKER_V2_LIST, list);

        target.fail(FailOp::PutManifest, &format!("ns/app@{}", digest_b), 1);

        let result = job(&source, &target, "ns/app", "v1").run().await;
        assert!(result.is_err());
        assert!(!target.has_manifest("ns/app", "v1"));
    }
}
