//! Registry client capability
//!
//! [`Registry`] is the single polymorphic seam of the pipeline: everything
//! that touches a remote registry goes through it. The production variant
//! is [`http::HttpRegistry`]; [`memory::MemoryRegistry`] backs the tests.
//! A [`RegistryProvider`] turns `(registry host, credentials)` into a
//! connected client, so the pipeline can be handed fakes wholesale.

pub mod auth;
pub mod http;
pub mod limiter;
pub mod memory;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::Security;
use crate::error::Result;

/// A streamed blob body. Single ownership: whoever opens it consumes it.
pub type BlobStream = BoxStream<'static, io::Result<Bytes>>;

/// Digest and size of a blob. Size is `-1` when unknown; a source fetch
/// reports the true size back alongside the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: String,
    pub size: i64,
}

impl BlobInfo {
    pub fn new(digest: impl Into<String>, size: i64) -> Self {
        BlobInfo {
            digest: digest.into(),
            size,
        }
    }
}

/// Operations one registry exposes. Repositories are addressed as
/// `namespace/name`; manifest references are tags or `sha256:` digests.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch manifest bytes and media type by tag or digest.
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<(Vec<u8>, String)>;

    /// Digest of the manifest currently at `reference`, or empty when the
    /// reference does not exist.
    async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<String>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Open a blob for reading. The returned size is the transport's idea
    /// of the length, `-1` when unknown.
    async fn open_blob(&self, repository: &str, digest: &str) -> Result<(BlobStream, i64)>;

    /// Probe whether the blob already exists and can be reused.
    async fn try_reuse_blob(&self, repository: &str, blob: &BlobInfo) -> Result<bool>;

    /// Upload a blob, consuming the stream.
    async fn put_blob(&self, repository: &str, stream: BlobStream, blob: &BlobInfo) -> Result<()>;

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Vec<u8>,
    ) -> Result<()>;
}

/// Builds a connected [`Registry`] for a registry host and its credentials.
pub trait RegistryProvider: Send + Sync {
    fn connect(&self, registry: &str, security: &Security) -> Result<Arc<dyn Registry>>;
}

/// `sha256:` digest of a byte slice, the content address used for blobs
/// and manifests alike.
pub fn sha256_digest(payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{:x}", Sha256::digest(payload))
}
