//! In-memory registry
//!
//! The test-facing variant of the [`Registry`] seam. Stores blobs and
//! manifests in maps, records every write for assertions, and can be told
//! to fail specific operations a given number of times to exercise the
//! pipeline's failure queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};

use crate::config::Security;
use crate::error::{Result, TransferError};
use crate::registry::{sha256_digest, BlobInfo, BlobStream, Registry, RegistryProvider};

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOp {
    FetchManifest,
    ManifestDigest,
    ListTags,
    OpenBlob,
    ReuseBlob,
    PutBlob,
    PutManifest,
}

#[derive(Clone)]
struct StoredManifest {
    media_type: String,
    payload: Bytes,
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, HashMap<String, Bytes>>,
    manifests: HashMap<String, HashMap<String, StoredManifest>>,
    manifest_log: Vec<(String, String)>,
    blob_puts: usize,
    manifest_puts: usize,
    failures: HashMap<(FailOp, String), usize>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob and return its digest.
    pub fn add_blob(&self, repository: &str, payload: impl Into<Bytes>) -> String {
        let payload = payload.into();
        let digest = sha256_digest(&payload);
        let mut state = self.state.lock().unwrap();
        state
            .blobs
            .entry(repository.to_string())
            .or_default()
            .insert(digest.clone(), payload);
        digest
    }

    /// Store a manifest under `reference` and under its own digest, as a
    /// registry does. Returns the manifest digest.
    pub fn set_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: impl Into<Bytes>,
    ) -> String {
        let payload = payload.into();
        let digest = sha256_digest(&payload);
        let stored = StoredManifest {
            media_type: media_type.to_string(),
            payload,
        };
        let mut state = self.state.lock().unwrap();
        let repo = state.manifests.entry(repository.to_string()).or_default();
        repo.insert(reference.to_string(), stored.clone());
        repo.insert(digest.clone(), stored);
        digest
    }

    /// Make `op` on `key` fail `times` times. Keys are `repo` for tag
    /// listing and `repo@reference` (or `repo@digest`) for everything else.
    pub fn fail(&self, op: FailOp, key: &str, times: usize) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert((op, key.to_string()), times);
    }

    fn check_fail(&self, op: FailOp, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failures.get_mut(&(op, key.to_string())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransferError::registry(format!(
                    "injected {:?} failure for {}",
                    op, key
                )));
            }
        }
        Ok(())
    }

    pub fn blob_put_count(&self) -> usize {
        self.state.lock().unwrap().blob_puts
    }

    pub fn manifest_put_count(&self) -> usize {
        self.state.lock().unwrap().manifest_puts
    }

    /// `(repository, reference)` pairs in the order manifests were put.
    pub fn manifest_put_log(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().manifest_log.clone()
    }

    pub fn has_manifest(&self, repository: &str, reference: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(repository)
            .map(|repo| repo.contains_key(reference))
            .unwrap_or(false)
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(repository)
            .map(|repo| repo.contains_key(digest))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<(Vec<u8>, String)> {
        self.check_fail(FailOp::FetchManifest, &format!("{}@{}", repository, reference))?;
        let state = self.state.lock().unwrap();
        state
            .manifests
            .get(repository)
            .and_then(|repo| repo.get(reference))
            .map(|m| (m.payload.to_vec(), m.media_type.clone()))
            .ok_or_else(|| {
                TransferError::registry(format!("manifest {}:{} not found", repository, reference))
            })
    }

    async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<String> {
        self.check_fail(FailOp::ManifestDigest, &format!("{}@{}", repository, reference))?;
        let state = self.state.lock().unwrap();
        Ok(state
            .manifests
            .get(repository)
            .and_then(|repo| repo.get(reference))
            .map(|m| sha256_digest(&m.payload))
            .unwrap_or_default())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.check_fail(FailOp::ListTags, repository)?;
        let state = self.state.lock().unwrap();
        let mut tags: Vec<String> = state
            .manifests
            .get(repository)
            .map(|repo| {
                repo.keys()
                    .filter(|k| !k.starts_with("sha256:"))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tags.sort();
        Ok(tags)
    }

    async fn open_blob(&self, repository: &str, digest: &str) -> Result<(BlobStream, i64)> {
        self.check_fail(FailOp::OpenBlob, &format!("{}@{}", repository, digest))?;
        let payload = {
            let state = self.state.lock().unwrap();
            state
                .blobs
                .get(repository)
                .and_then(|repo| repo.get(digest))
                .cloned()
                .ok_or_else(|| {
                    TransferError::registry(format!("blob {}@{} not found", repository, digest))
                })?
        };
        let size = payload.len() as i64;
        let stream: BlobStream = stream::once(async move { Ok(payload) }).boxed();
        Ok((stream, size))
    }

    async fn try_reuse_blob(&self, repository: &str, blob: &BlobInfo) -> Result<bool> {
        self.check_fail(FailOp::ReuseBlob, &format!("{}@{}", repository, blob.digest))?;
        Ok(self.has_blob(repository, &blob.digest))
    }

    async fn put_blob(&self, repository: &str, stream: BlobStream, blob: &BlobInfo) -> Result<()> {
        self.check_fail(FailOp::PutBlob, &format!("{}@{}", repository, blob.digest))?;

        let mut payload = BytesMut::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            payload.extend_from_slice(&chunk?);
        }
        let payload = payload.freeze();

        // content addressing holds even for the fake
        let digest = sha256_digest(&payload);
        if digest != blob.digest {
            return Err(TransferError::registry(format!(
                "digest mismatch uploading {}: got {}",
                blob.digest, digest
            )));
        }

        let mut state = self.state.lock().unwrap();
        state
            .blobs
            .entry(repository.to_string())
            .or_default()
            .insert(digest, payload);
        state.blob_puts += 1;
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.check_fail(FailOp::PutManifest, &format!("{}@{}", repository, reference))?;
        let payload = Bytes::from(payload);
        let digest = sha256_digest(&payload);
        let stored = StoredManifest {
            media_type: media_type.to_string(),
            payload,
        };
        let mut state = self.state.lock().unwrap();
        let repo = state.manifests.entry(repository.to_string()).or_default();
        repo.insert(reference.to_string(), stored.clone());
        repo.insert(digest, stored);
        state
            .manifest_log
            .push((repository.to_string(), reference.to_string()));
        state.manifest_puts += 1;
        Ok(())
    }
}

/// Provider that hands out shared in-memory registries keyed by host name.
#[derive(Default)]
pub struct MemoryProvider {
    registries: Mutex<HashMap<String, Arc<MemoryRegistry>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the registry for `host`.
    pub fn registry(&self, host: &str) -> Arc<MemoryRegistry> {
        let mut registries = self.registries.lock().unwrap();
        Arc::clone(
            registries
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(MemoryRegistry::new())),
        )
    }
}

impl RegistryProvider for MemoryProvider {
    fn connect(&self, registry: &str, _security: &Security) -> Result<Arc<dyn Registry>> {
        Ok(self.registry(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_round_trip() {
        let registry = MemoryRegistry::new();
        let digest = registry.add_blob("ns/app", &b"layer-data"[..]);

        let info = BlobInfo::new(digest.clone(), -1);
        assert!(registry.try_reuse_blob("ns/app", &info).await.unwrap());

        let (stream, size) = registry.open_blob("ns/app", &digest).await.unwrap();
        assert_eq!(size, 10);
        registry
            .put_blob("ns/other", stream, &BlobInfo::new(digest.clone(), size))
            .await
            .unwrap();
        assert!(registry.has_blob("ns/other", &digest));
    }

    #[tokio::test]
    async fn test_put_blob_rejects_digest_mismatch() {
        let registry = MemoryRegistry::new();
        let stream = stream::once(async { Ok(Bytes::from_static(b"data")) }).boxed();
        let err = registry
            .put_blob("ns/app", stream, &BlobInfo::new("sha256:beef", 4))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_manifest_digest_empty_when_absent() {
        let registry = MemoryRegistry::new();
        assert_eq!(
            registry.manifest_digest("ns/app", "v1").await.unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let registry = MemoryRegistry::new();
        registry.set_manifest("ns/app", "v1", "application/json", &b"{}"[..]);
        registry.fail(FailOp::FetchManifest, "ns/app@v1", 1);

        assert!(registry.fetch_manifest("ns/app", "v1").await.is_err());
        assert!(registry.fetch_manifest("ns/app", "v1").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_tags_skips_digest_keys() {
        let registry = MemoryRegistry::new();
        registry.set_manifest("ns/app", "v1", "application/json", &b"{\"a\":1}"[..]);
        registry.set_manifest("ns/app", "v2", "application/json", &b"{\"a\":2}"[..]);
        let tags = registry.list_tags("ns/app").await.unwrap();
        assert_eq!(tags, vec!["v1", "v2"]);
    }
}
