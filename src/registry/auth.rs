//! Registry token authentication
//!
//! Implements the Docker Registry API v2 token dance: ping `/v2/`, parse
//! the `WWW-Authenticate` challenge, trade credentials for a bearer token
//! at the realm, and cache the token per repository and operation until it
//! expires. Registries without a Bearer challenge fall back to basic auth;
//! registries answering 200 need no authorization at all.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Security;
use crate::error::{Result, TransferError};

#[derive(Debug, Clone)]
pub enum Authorization {
    Anonymous,
    Basic(String, String),
    Bearer(String),
}

impl Authorization {
    pub fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Anonymous => builder,
            Authorization::Basic(user, pass) => builder.basic_auth(user, Some(pass)),
            Authorization::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

#[derive(Debug, Clone)]
struct AuthChallenge {
    realm: String,
    service: Option<String>,
}

/// Parse a `WWW-Authenticate: Bearer realm=...,service=...` header.
fn parse_www_authenticate(header: &str) -> Option<AuthChallenge> {
    let params_str = header.strip_prefix("Bearer ")?;

    let mut params = HashMap::new();
    for param in params_str.split(',') {
        let param = param.trim();
        if let Some(eq) = param.find('=') {
            let key = param[..eq].trim();
            let value = param[eq + 1..].trim().trim_matches('"');
            params.insert(key, value);
        }
    }

    Some(AuthChallenge {
        realm: params.get("realm")?.to_string(),
        service: params.get("service").map(|s| s.to_string()),
    })
}

/// Token endpoints answer with `token`, `access_token`, or both.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

struct CachedAuth {
    authorization: Authorization,
    expires_at: Option<Instant>,
}

impl CachedAuth {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() > at,
            None => false,
        }
    }
}

pub struct Authenticator {
    client: Client,
    base: String,
    security: Security,
    cache: RwLock<HashMap<String, CachedAuth>>,
}

impl Authenticator {
    /// `base` is `scheme://registry-host`.
    pub fn new(client: Client, base: String, security: Security) -> Self {
        Authenticator {
            client,
            base,
            security,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Authorization to attach to a request against `repository`. `push`
    /// widens the requested scope to `pull,push`.
    pub async fn authorization(&self, repository: &str, push: bool) -> Result<Authorization> {
        let key = format!("{}|{}", repository, push);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if !cached.is_expired() {
                    return Ok(cached.authorization.clone());
                }
            }
        }

        let (authorization, expires_at) = self.negotiate(repository, push).await?;
        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CachedAuth {
                authorization: authorization.clone(),
                expires_at,
            },
        );
        Ok(authorization)
    }

    async fn negotiate(
        &self,
        repository: &str,
        push: bool,
    ) -> Result<(Authorization, Option<Instant>)> {
        let ping_url = format!("{}/v2/", self.base);
        let response = self.client.get(&ping_url).send().await?;

        if response.status().is_success() {
            return Ok((Authorization::Anonymous, None));
        }
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransferError::registry(format!(
                "unexpected status {} probing {}",
                response.status(),
                ping_url
            )));
        }

        let header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let challenge = match parse_www_authenticate(&header) {
            Some(challenge) => challenge,
            None => {
                // no Bearer challenge: basic auth when we hold credentials
                debug!(registry = %self.base, "no bearer challenge, falling back to basic auth");
                if self.security.is_anonymous() {
                    return Ok((Authorization::Anonymous, None));
                }
                return Ok((
                    Authorization::Basic(
                        self.security.username.clone(),
                        self.security.password.clone(),
                    ),
                    None,
                ));
            }
        };

        let scope = if push {
            format!("repository:{}:pull,push", repository)
        } else {
            format!("repository:{}:pull", repository)
        };

        let mut url = reqwest::Url::parse(&challenge.realm)
            .map_err(|e| TransferError::registry(format!("invalid auth realm url: {}", e)))?;
        if let Some(service) = &challenge.service {
            url.query_pairs_mut().append_pair("service", service);
        }
        url.query_pairs_mut().append_pair("scope", &scope);

        debug!(%url, "requesting registry token");

        let mut request = self.client.get(url);
        if !self.security.is_anonymous() {
            request = request.basic_auth(&self.security.username, Some(&self.security.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::registry(format!(
                "token request failed (status {}): {}",
                status, body
            )));
        }

        let response: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransferError::registry(format!("bad token response: {}", e)))?;

        // renew one minute before the registry's deadline
        let expires_at = response
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs.saturating_sub(60)));
        let token = response
            .into_token()
            .ok_or_else(|| TransferError::registry("token response carried no token"))?;

        Ok((Authorization::Bearer(token), expires_at))
    }
}
