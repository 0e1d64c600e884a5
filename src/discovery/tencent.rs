//! Tencent cloud API bindings for mirror mode
//!
//! Thin reqwest client for the `tcr` API family, signing requests with
//! TC3-HMAC-SHA256. [`CcrCatalog`] lists the personal registry,
//! [`TcrCatalog`] manages namespaces on an enterprise instance. Both only
//! surface names; the image bytes always travel through the registry
//! protocol.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::Secret;
use crate::discovery::{SourceCatalog, TargetCatalog};
use crate::error::{Result, TransferError};

const API_HOST: &str = "tcr.tencentcloudapi.com";
const API_SERVICE: &str = "tcr";
const API_VERSION: &str = "2019-09-24";
const PAGE_LIMIT: u64 = 100;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], message: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TransferError::VendorApi(format!("bad signing key: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sha256_hex(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Signed JSON-over-HTTPS client for one credential pair.
pub struct TencentApi {
    client: reqwest::Client,
    secret_id: String,
    secret_key: String,
}

impl TencentApi {
    pub fn new(secret: &Secret) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(TencentApi {
            client,
            secret_id: secret.secret_id.clone(),
            secret_key: secret.secret_key.clone(),
        })
    }

    /// Issue one API action and return the `Response` object. Vendor-side
    /// errors arrive inside a 200 body and are surfaced as [`TransferError::VendorApi`].
    pub async fn call(&self, action: &str, region: &str, payload: Value) -> Result<Value> {
        let payload_str = payload.to_string();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TransferError::VendorApi(format!("system clock error: {}", e)))?
            .as_secs() as i64;
        let date = chrono::DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| TransferError::VendorApi("system clock out of range".to_string()))?
            .format("%Y-%m-%d")
            .to_string();

        let authorization = self.sign(&payload_str, timestamp, &date)?;

        debug!(action, region, "tencent api call");
        let response = self
            .client
            .post(format!("https://{}", API_HOST))
            .header("Authorization", authorization)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("Host", API_HOST)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Region", region)
            .body(payload_str)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::VendorApi(format!(
                "{} failed (status {}): {}",
                action, status, body
            )));
        }

        let body: Value = response.json().await?;
        if let Some(error) = body.pointer("/Response/Error") {
            return Err(TransferError::VendorApi(format!(
                "{} error: {} {}",
                action,
                error.pointer("/Code").and_then(Value::as_str).unwrap_or(""),
                error
                    .pointer("/Message")
                    .and_then(Value::as_str)
                    .unwrap_or("")
            )));
        }
        Ok(body.pointer("/Response").cloned().unwrap_or(Value::Null))
    }

    fn sign(&self, payload: &str, timestamp: i64, date: &str) -> Result<String> {
        let canonical_request = format!(
            "POST\n/\n\ncontent-type:application/json; charset=utf-8\nhost:{}\n\ncontent-type;host\n{}",
            API_HOST,
            sha256_hex(payload)
        );
        let credential_scope = format!("{}/{}/tc3_request", date, API_SERVICE);
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{}\n{}\n{}",
            timestamp,
            credential_scope,
            sha256_hex(&canonical_request)
        );

        let key_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date)?;
        let key_service = hmac_sha256(&key_date, API_SERVICE)?;
        let key_signing = hmac_sha256(&key_service, "tc3_request")?;
        let signature = hex(&hmac_sha256(&key_signing, &string_to_sign)?);

        Ok(format!(
            "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders=content-type;host, Signature={}",
            self.secret_id, credential_scope, signature
        ))
    }
}

fn strings_at(value: &Value, array_pointer: &str, field: &str) -> Vec<String> {
    value
        .pointer(array_pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

/// The personal registry listing API.
pub struct CcrCatalog {
    api: TencentApi,
    region: String,
}

impl CcrCatalog {
    pub fn new(secret: &Secret, region: impl Into<String>) -> Result<Self> {
        Ok(CcrCatalog {
            api: TencentApi::new(secret)?,
            region: region.into(),
        })
    }
}

#[async_trait::async_trait]
impl SourceCatalog for CcrCatalog {
    async fn namespaces(&self) -> Result<Vec<String>> {
        let mut namespaces = Vec::new();
        let mut offset = 0u64;
        loop {
            let response = self
                .api
                .call(
                    "DescribeNamespacePersonal",
                    &self.region,
                    json!({"Namespace": "", "Offset": offset, "Limit": PAGE_LIMIT}),
                )
                .await?;
            let total = u64_at(&response, "/Data/NamespaceCount");
            namespaces.extend(strings_at(&response, "/Data/NamespaceInfo", "Namespace"));
            if namespaces.len() as u64 >= total {
                break;
            }
            offset += PAGE_LIMIT;
        }
        Ok(namespaces)
    }

    async fn repository_count(&self) -> Result<u64> {
        let response = self
            .api
            .call(
                "DescribeRepositoryOwnerPersonal",
                &self.region,
                json!({"Offset": 0, "Limit": 1}),
            )
            .await?;
        Ok(u64_at(&response, "/Data/TotalCount"))
    }

    async fn repositories(&self, offset: u64, limit: u64) -> Result<Vec<String>> {
        let response = self
            .api
            .call(
                "DescribeRepositoryOwnerPersonal",
                &self.region,
                json!({"Offset": offset, "Limit": limit}),
            )
            .await?;
        Ok(strings_at(&response, "/Data/RepoInfo", "RepoName"))
    }

    async fn repo_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut offset = 0u64;
        loop {
            let response = self
                .api
                .call(
                    "DescribeImagePersonal",
                    &self.region,
                    json!({"RepoName": repository, "Offset": offset, "Limit": PAGE_LIMIT}),
                )
                .await?;
            let total = u64_at(&response, "/Data/TagCount");
            if total == 0 {
                return Ok(Vec::new());
            }
            tags.extend(strings_at(&response, "/Data/TagInfo", "TagName"));
            if tags.len() as u64 >= total {
                break;
            }
            offset += PAGE_LIMIT;
        }
        Ok(tags)
    }
}

/// The enterprise registry namespace API. The instance id is resolved
/// from the registry name once and cached.
pub struct TcrCatalog {
    api: TencentApi,
    region: String,
    name: String,
    instance_id: OnceCell<String>,
}

impl TcrCatalog {
    pub fn new(
        secret: &Secret,
        region: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        Ok(TcrCatalog {
            api: TencentApi::new(secret)?,
            region: region.into(),
            name: name.into(),
            instance_id: OnceCell::new(),
        })
    }

    async fn instance_id(&self) -> Result<&String> {
        self.instance_id
            .get_or_try_init(|| async {
                let response = self
                    .api
                    .call(
                        "DescribeInstances",
                        &self.region,
                        json!({
                            "Filters": [{"Name": "RegistryName", "Values": [self.name.as_str()]}],
                            "Offset": 0,
                            "Limit": 1,
                        }),
                    )
                    .await?;
                response
                    .pointer("/Registries/0/RegistryId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        TransferError::VendorApi(format!(
                            "tcr instance {} not found in {}",
                            self.name, self.region
                        ))
                    })
            })
            .await
    }
}

#[async_trait::async_trait]
impl TargetCatalog for TcrCatalog {
    async fn namespaces(&self) -> Result<Vec<String>> {
        let registry_id = self.instance_id().await?.clone();
        let mut namespaces = Vec::new();
        let mut offset = 0u64;
        loop {
            let response = self
                .api
                .call(
                    "DescribeNamespaces",
                    &self.region,
                    json!({"RegistryId": registry_id.as_str(), "Offset": offset, "Limit": PAGE_LIMIT}),
                )
                .await?;
            let total = u64_at(&response, "/TotalCount");
            namespaces.extend(strings_at(&response, "/NamespaceList", "Name"));
            if namespaces.len() as u64 >= total {
                break;
            }
            offset += PAGE_LIMIT;
        }
        Ok(namespaces)
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let registry_id = self.instance_id().await?.clone();
        self.api
            .call(
                "CreateNamespace",
                &self.region,
                json!({
                    "RegistryId": registry_id.as_str(),
                    "NamespaceName": namespace,
                    "IsPublic": false,
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0xab, 0xff]), "00abff");
    }

    #[test]
    fn test_sha256_hex_of_empty_payload() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let api = TencentApi {
            client: reqwest::Client::new(),
            secret_id: "AKIDtest".to_string(),
            secret_key: "secret".to_string(),
        };
        let a = api.sign("{}", 1_600_000_000, "2020-09-13").unwrap();
        let b = api.sign("{}", 1_600_000_000, "2020-09-13").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("TC3-HMAC-SHA256 Credential=AKIDtest/2020-09-13/tcr/tc3_request"));
    }

    #[test]
    fn test_strings_at_navigates_arrays() {
        let value = json!({"Data": {"RepoInfo": [{"RepoName": "ns/app"}, {"RepoName": "ns/tool"}]}});
        assert_eq!(
            strings_at(&value, "/Data/RepoInfo", "RepoName"),
            vec!["ns/app", "ns/tool"]
        );
    }
}
