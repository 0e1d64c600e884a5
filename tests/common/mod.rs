//! Shared fixtures for the end-to-end pipeline tests

use std::collections::HashMap;
use std::sync::Arc;

use registry_transfer::config::{Configs, Options};
use registry_transfer::manifest::media_type;
use registry_transfer::registry::memory::MemoryRegistry;

pub fn configs_with(options: Options) -> Arc<Configs> {
    Arc::new(Configs {
        options,
        security: HashMap::new(),
        image_list: HashMap::new(),
        secret: HashMap::new(),
    })
}

/// Seed a schema2 image (layers plus config) and return its manifest
/// digest.
pub fn seed_image(
    registry: &MemoryRegistry,
    repository: &str,
    tag: &str,
    layers: &[&[u8]],
) -> String {
    let layer_digests: Vec<String> = layers
        .iter()
        .map(|layer| registry.add_blob(repository, layer.to_vec()))
        .collect();
    let config_body = format!("{{\"os\":\"linux\",\"tag\":\"{}\"}}", tag);
    let config_digest = registry.add_blob(repository, config_body.clone().into_bytes());

    let layer_json: Vec<serde_json::Value> = layer_digests
        .iter()
        .zip(layers)
        .map(|(digest, layer)| {
            serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": layer.len(),
                "digest": digest,
            })
        })
        .collect();
    let payload = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::DOCKER_V2_SCHEMA2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": config_body.len(),
            "digest": config_digest,
        },
        "layers": layer_json,
    }))
    .unwrap();
    registry.set_manifest(repository, tag, media_type::DOCKER_V2_SCHEMA2, payload)
}

/// Seed a two-platform manifest list over freshly seeded child images.
/// Returns the child digests in list order.
#[allow(dead_code)]
pub fn seed_manifest_list(registry: &MemoryRegistry, repository: &str, tag: &str) -> Vec<String> {
    let digest_amd64 = seed_image(registry, repository, "list-amd64", &[b"layer-amd64"]);
    let digest_arm64 = seed_image(registry, repository, "list-arm64", &[b"layer-arm64"]);

    let payload = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::DOCKER_V2_LIST,
        "manifests": [
            {"mediaType": media_type::DOCKER_V2_SCHEMA2, "size": 1, "digest": digest_amd64,
             "platform": {"architecture": "amd64", "os": "linux"}},
            {"mediaType": media_type::DOCKER_V2_SCHEMA2, "size": 1, "digest": digest_arm64,
             "platform": {"architecture": "arm64", "os": "linux"}},
        ],
    }))
    .unwrap();
    registry.set_manifest(repository, tag, media_type::DOCKER_V2_LIST, payload);
    vec![digest_amd64, digest_arm64]
}
