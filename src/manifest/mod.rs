//! Manifest classification and expansion
//!
//! A manifest is opaque bytes tagged with a media type. [`resolve`] walks
//! one manifest into the flat list of concrete per-platform manifests it
//! stands for: single images come back as themselves, manifest lists and
//! image indexes recurse through their children. The resolver only ever
//! fetches manifests; blobs are the job's business.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TransferError};
use crate::registry::{BlobInfo, Registry};

pub mod media_type {
    pub const DOCKER_V2_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_V2_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_V2_SCHEMA1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const DOCKER_V2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    /// Accept header offered when fetching manifests.
    pub const ACCEPT_MANIFESTS: &str = "application/vnd.docker.distribution.manifest.v2+json, \
         application/vnd.docker.distribution.manifest.list.v2+json, \
         application/vnd.docker.distribution.manifest.v1+json, \
         application/vnd.docker.distribution.manifest.v1+prettyjws, \
         application/vnd.oci.image.manifest.v1+json, \
         application/vnd.oci.image.index.v1+json";
}

/// Reference to a manifest or blob inside another manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
}

/// Docker v2 schema2 and OCI image manifests share this shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema2Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// A manifest list or image index; both carry a `manifests` array.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// One concrete (per-platform) manifest produced by [`resolve`].
#[derive(Debug, Clone)]
pub enum ImageManifest {
    Schema2(Schema2Manifest),
    Schema1(Schema1Manifest),
}

impl ImageManifest {
    /// Layer blobs in manifest order, followed by the config blob when its
    /// digest is non-empty. Schema1 manifests carry no config and no sizes.
    pub fn blob_infos(&self) -> Vec<BlobInfo> {
        match self {
            ImageManifest::Schema2(m) => {
                let mut infos: Vec<BlobInfo> = m
                    .layers
                    .iter()
                    .map(|l| BlobInfo::new(l.digest.clone(), l.size))
                    .collect();
                if !m.config.digest.is_empty() {
                    infos.push(BlobInfo::new(m.config.digest.clone(), m.config.size));
                }
                infos
            }
            ImageManifest::Schema1(m) => m
                .fs_layers
                .iter()
                .map(|l| BlobInfo::new(l.blob_sum.clone(), -1))
                .collect(),
        }
    }
}

/// The child descriptors when `payload` is a manifest list or image index,
/// `None` for single manifests.
pub fn list_descriptors(payload: &[u8], media: &str) -> Result<Option<Vec<Descriptor>>> {
    match media {
        media_type::DOCKER_V2_LIST | media_type::OCI_INDEX => {
            let list: ManifestList = serde_json::from_slice(payload)?;
            Ok(Some(list.manifests))
        }
        _ => Ok(None),
    }
}

/// Expand a manifest into its concrete sub-manifests, fetching list
/// children by digest through `registry`.
pub async fn resolve(
    registry: &dyn Registry,
    repository: &str,
    payload: &[u8],
    media: &str,
) -> Result<Vec<ImageManifest>> {
    resolve_inner(registry, repository, payload.to_vec(), media.to_string()).await
}

fn resolve_inner<'a>(
    registry: &'a dyn Registry,
    repository: &'a str,
    payload: Vec<u8>,
    media: String,
) -> BoxFuture<'a, Result<Vec<ImageManifest>>> {
    Box::pin(async move {
        match media.as_str() {
            media_type::DOCKER_V2_SCHEMA2 | media_type::OCI_MANIFEST => {
                let manifest: Schema2Manifest = serde_json::from_slice(&payload)?;
                Ok(vec![ImageManifest::Schema2(manifest)])
            }
            media_type::DOCKER_V2_SCHEMA1 | media_type::DOCKER_V2_SCHEMA1_SIGNED => {
                let manifest: Schema1Manifest = serde_json::from_slice(&payload)?;
                Ok(vec![ImageManifest::Schema1(manifest)])
            }
            media_type::DOCKER_V2_LIST | media_type::OCI_INDEX => {
                let list: ManifestList = serde_json::from_slice(&payload)?;
                let mut expanded = Vec::new();
                for descriptor in list.manifests {
                    if let Some(platform) = &descriptor.platform {
                        info!(
                            os = %platform.os,
                            architecture = %platform.architecture,
                            "handle manifest"
                        );
                    }
                    let (child, child_media) =
                        registry.fetch_manifest(repository, &descriptor.digest).await?;
                    expanded
                        .extend(resolve_inner(registry, repository, child, child_media).await?);
                }
                Ok(expanded)
            }
            other => Err(TransferError::UnsupportedManifestType(other.to_string())),
        }
    })
}
