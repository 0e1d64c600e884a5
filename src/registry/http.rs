//! HTTP registry client
//!
//! Talks the OCI distribution API v2 over `reqwest`. Every request first
//! waits on the process-wide pacer; tag listing additionally waits on the
//! dedicated list pacer. Insecure registries are addressed over plain
//! HTTP with certificate verification disabled.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::{Body, Client, StatusCode};
use tracing::debug;

use crate::config::Security;
use crate::error::{Result, TransferError};
use crate::manifest::media_type;
use crate::registry::auth::Authenticator;
use crate::registry::limiter::RateLimiter;
use crate::registry::{sha256_digest, BlobInfo, BlobStream, Registry, RegistryProvider};

const USER_AGENT: &str = "registry-transfer/0.1";

pub struct HttpRegistryBuilder {
    registry: String,
    security: Security,
    limiter: Arc<RateLimiter>,
    list_limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl HttpRegistryBuilder {
    pub fn new(
        registry: impl Into<String>,
        limiter: Arc<RateLimiter>,
        list_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry: registry.into(),
            security: Security::default(),
            limiter,
            list_limiter,
            timeout: Duration::from_secs(7200),
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<HttpRegistry> {
        let scheme = if self.security.insecure {
            "http"
        } else {
            "https"
        };
        let base = format!("{}://{}", scheme, self.registry);

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(60))
            .user_agent(USER_AGENT);
        if self.security.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        let auth = Authenticator::new(client.clone(), base.clone(), self.security);

        Ok(HttpRegistry {
            client,
            base,
            auth,
            limiter: self.limiter,
            list_limiter: self.list_limiter,
        })
    }
}

pub struct HttpRegistry {
    client: Client,
    base: String,
    auth: Authenticator,
    limiter: Arc<RateLimiter>,
    list_limiter: Arc<RateLimiter>,
}

#[derive(Debug, serde::Deserialize)]
struct TagList {
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl HttpRegistry {
    fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base, repository, reference)
    }

    fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.base, repository, digest)
    }

    async fn error_from(response: reqwest::Response, context: &str) -> TransferError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        TransferError::registry(format!("{} failed (status {}): {}", context, status, body))
    }
}

#[async_trait::async_trait]
impl Registry for HttpRegistry {
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<(Vec<u8>, String)> {
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, false).await?;

        let url = self.manifest_url(repository, reference);
        debug!(%url, "GET manifest");
        let response = authorization
            .apply(self.client.get(&url))
            .header(reqwest::header::ACCEPT, media_type::ACCEPT_MANIFESTS)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "get manifest").await);
        }

        let media = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let payload = response.bytes().await?.to_vec();
        Ok((payload, media))
    }

    async fn manifest_digest(&self, repository: &str, reference: &str) -> Result<String> {
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, false).await?;

        let url = self.manifest_url(repository, reference);
        let response = authorization
            .apply(self.client.head(&url))
            .header(reqwest::header::ACCEPT, media_type::ACCEPT_MANIFESTS)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "head manifest").await);
        }

        if let Some(digest) = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|h| h.to_str().ok())
        {
            return Ok(digest.to_string());
        }

        // registry without a digest header: hash the body ourselves
        let (payload, _) = self.fetch_manifest(repository, reference).await?;
        Ok(sha256_digest(&payload))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.list_limiter.take().await;
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, false).await?;

        let url = format!("{}/v2/{}/tags/list", self.base, repository);
        let response = authorization.apply(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "list tags").await);
        }

        let list: TagList = response.json().await?;
        Ok(list.tags)
    }

    async fn open_blob(&self, repository: &str, digest: &str) -> Result<(BlobStream, i64)> {
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, false).await?;

        let url = self.blob_url(repository, digest);
        let response = authorization.apply(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "get blob").await);
        }

        let size = response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(-1);
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok((Box::pin(stream), size))
    }

    async fn try_reuse_blob(&self, repository: &str, blob: &BlobInfo) -> Result<bool> {
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, false).await?;

        let url = self.blob_url(repository, &blob.digest);
        let response = authorization.apply(self.client.head(&url)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_from(response, "head blob").await),
        }
    }

    async fn put_blob(&self, repository: &str, stream: BlobStream, blob: &BlobInfo) -> Result<()> {
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, true).await?;

        // open an upload session; the Location header names the upload url
        let session_url = format!("{}/v2/{}/blobs/uploads/", self.base, repository);
        let response = authorization
            .apply(self.client.post(&session_url))
            .send()
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Self::error_from(response, "start blob upload").await);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| {
                TransferError::registry("no Location header in upload session response")
            })?;
        let location = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{}", self.base, location)
        };
        let mut upload_url = reqwest::Url::parse(&location)
            .map_err(|e| TransferError::registry(format!("bad upload location: {}", e)))?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &blob.digest);

        self.limiter.take().await;
        let mut request = authorization
            .apply(self.client.put(upload_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(stream));
        if blob.size >= 0 {
            request = request.header(reqwest::header::CONTENT_LENGTH, blob.size);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response, "put blob").await);
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.limiter.take().await;
        let authorization = self.auth.authorization(repository, true).await?;

        let url = self.manifest_url(repository, reference);
        debug!(%url, media_type, "PUT manifest");
        let response = authorization
            .apply(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, media_type)
            .body(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "put manifest").await);
        }
        Ok(())
    }
}

/// Provider backed by real HTTP registries. The two pacers are shared by
/// every client it hands out.
pub struct HttpRegistryProvider {
    limiter: Arc<RateLimiter>,
    list_limiter: Arc<RateLimiter>,
}

impl HttpRegistryProvider {
    pub fn new(qps: u32) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(qps)),
            list_limiter: Arc::new(RateLimiter::new(qps)),
        }
    }
}

impl RegistryProvider for HttpRegistryProvider {
    fn connect(&self, registry: &str, security: &Security) -> Result<Arc<dyn Registry>> {
        let client = HttpRegistryBuilder::new(
            registry,
            Arc::clone(&self.limiter),
            Arc::clone(&self.list_limiter),
        )
        .with_security(security.clone())
        .build()?;
        Ok(Arc::new(client))
    }
}
