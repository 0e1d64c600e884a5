//! Repository url parsing
//!
//! A [`RepoUrl`] divides an image url into `<registry>/<namespace>/<repo>:<tag>`.
//! Short forms follow the docker conventions: a bare `repo` resolves to the
//! public hub under the `library` namespace, and a two-segment url is treated
//! as `registry/repo` only when the first segment looks like a domain.

use std::fmt;

use crate::error::{Result, TransferError};

pub const DEFAULT_REGISTRY: &str = "registry.hub.docker.com";
pub const DEFAULT_NAMESPACE: &str = "library";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    url: String,
    registry: String,
    namespace: String,
    repo: String,
    tag: String,
}

impl RepoUrl {
    /// Parse an image url. The tag may be empty or a comma-separated list;
    /// anything with more than one `:` in the final segment is rejected.
    pub fn parse(url: &str) -> Result<Self> {
        let slice: Vec<&str> = url.splitn(3, '/').collect();

        let repo_and_tag = slice[slice.len() - 1];
        let s: Vec<&str> = repo_and_tag.split(':').collect();
        let (repo, tag) = match s.len() {
            1 => (s[0].to_string(), String::new()),
            2 => (s[0].to_string(), s[1].to_string()),
            _ => return Err(TransferError::InvalidUrl(url.to_string())),
        };

        let (registry, namespace) = match slice.len() {
            3 => (slice[0].to_string(), slice[1].to_string()),
            2 => {
                // a dotted first segment is a registry host
                if slice[0].contains('.') {
                    (slice[0].to_string(), String::new())
                } else {
                    (DEFAULT_REGISTRY.to_string(), slice[0].to_string())
                }
            }
            _ => (DEFAULT_REGISTRY.to_string(), DEFAULT_NAMESPACE.to_string()),
        };

        Ok(RepoUrl {
            url: url.to_string(),
            registry,
            namespace,
            repo,
            tag,
        })
    }

    /// The normalized url, including the tag when present.
    pub fn url(&self) -> String {
        let url = self.url_without_tag();
        if self.tag.is_empty() {
            url
        } else {
            format!("{}:{}", url, self.tag)
        }
    }

    /// The string this url was parsed from.
    pub fn origin_url(&self) -> &str {
        &self.url
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `namespace/repo`, or just `repo` when the namespace is empty.
    pub fn repo_with_namespace(&self) -> String {
        if self.namespace.is_empty() {
            self.repo.clone()
        } else {
            format!("{}/{}", self.namespace, self.repo)
        }
    }

    /// `repo:tag`, or just `repo` when the tag is empty.
    pub fn repo_with_tag(&self) -> String {
        if self.tag.is_empty() {
            self.repo.clone()
        } else {
            format!("{}:{}", self.repo, self.tag)
        }
    }

    /// `registry/namespace/repo` without any tag.
    pub fn url_without_tag(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.registry, self.repo)
        } else {
            format!("{}/{}/{}", self.registry, self.namespace, self.repo)
        }
    }
}

impl fmt::Display for RepoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = RepoUrl::parse("registry.example.com/ns/app:v1").unwrap();
        assert_eq!(url.registry(), "registry.example.com");
        assert_eq!(url.namespace(), "ns");
        assert_eq!(url.repo(), "app");
        assert_eq!(url.tag(), "v1");
        assert_eq!(url.repo_with_namespace(), "ns/app");
        assert_eq!(url.url(), "registry.example.com/ns/app:v1");
    }

    #[test]
    fn test_parse_bare_repo_defaults_to_hub() {
        let url = RepoUrl::parse("nginx").unwrap();
        assert_eq!(url.registry(), DEFAULT_REGISTRY);
        assert_eq!(url.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(url.repo(), "nginx");
        assert_eq!(url.tag(), "");
        assert_eq!(url.url(), "registry.hub.docker.com/library/nginx");
    }

    #[test]
    fn test_parse_two_segments_with_domain() {
        let url = RepoUrl::parse("quay.io/app:2.0").unwrap();
        assert_eq!(url.registry(), "quay.io");
        assert_eq!(url.namespace(), "");
        assert_eq!(url.repo_with_namespace(), "app");
        assert_eq!(url.url_without_tag(), "quay.io/app");
    }

    #[test]
    fn test_parse_two_segments_without_domain() {
        let url = RepoUrl::parse("someuser/app:2.0").unwrap();
        assert_eq!(url.registry(), DEFAULT_REGISTRY);
        assert_eq!(url.namespace(), "someuser");
        assert_eq!(url.repo(), "app");
    }

    #[test]
    fn test_parse_rejects_extra_colon() {
        assert!(RepoUrl::parse("reg.example.com/ns/app:v1:v2").is_err());
    }

    #[test]
    fn test_multi_tag_kept_verbatim() {
        let url = RepoUrl::parse("reg.example.com/ns/app:1.0,2.0").unwrap();
        assert_eq!(url.tag(), "1.0,2.0");
        assert_eq!(url.repo(), "app");
    }

    #[test]
    fn test_url_round_trip() {
        for raw in [
            "reg.example.com/ns/app:v1",
            "reg.example.com/ns/app",
            "quay.io/app:v2",
        ] {
            assert_eq!(RepoUrl::parse(raw).unwrap().url(), raw);
        }
    }
}
