//! Rule expansion
//!
//! Turns a declared `source -> target` rule into concrete per-tag pairs on
//! the expanded queue. A rule may name no tag (every source tag is
//! considered), a single tag, or a comma-list of tags. The tag-existence
//! policy decides what happens when the target already carries a tag of
//! the same name.

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::Security;
use crate::error::{Result, TransferError};
use crate::reference::RepoUrl;
use crate::transfer::{TransferClient, UrlPair, TAG_FILTER_WORKERS};

impl TransferClient {
    /// Expand one rule. Errors fail this rule only; the caller routes the
    /// pair to the failed-expansion queue.
    pub(crate) async fn expand_rule(&self, pair: &UrlPair) -> Result<()> {
        if pair.source.is_empty() {
            return Err(TransferError::InvalidUrl(
                "source url should not be empty".to_string(),
            ));
        }
        let source_url = RepoUrl::parse(&pair.source)?;

        // an empty target falls back to the configured default location
        let target_str = if pair.target.is_empty() {
            let options = &self.config.options;
            if options.default_registry.is_empty() || options.default_namespace.is_empty() {
                return Err(TransferError::config(
                    "the default registry and namespace must be set when the target is empty",
                ));
            }
            format!(
                "{}/{}/{}",
                options.default_registry,
                options.default_namespace,
                source_url.repo_with_tag()
            )
        } else {
            pair.target.clone()
        };
        let target_url = RepoUrl::parse(&target_str)?;

        let source_auth = self.lookup_security(&source_url, "pull");
        let target_auth = self.lookup_security(&target_url, "push");

        let multi_tags: Vec<&str> = source_url.tag().split(',').collect();
        if multi_tags.len() > 1 {
            if !target_url.tag().is_empty() && target_url.tag() != source_url.tag() {
                return Err(TransferError::config(format!(
                    "multi-tags source should not correspond to a target with tag: {}:{}",
                    source_url.url(),
                    target_url.url()
                )));
            }
            debug!("source {} tags are {:?}", source_url.url(), multi_tags);

            let target = self.image_target(&target_url, &target_auth, "")?;
            let target_tags = target.tags().await?;
            debug!("target {} tags are {:?}", target_url.url(), target_tags);

            let source_tags: Vec<String> =
                multi_tags.iter().map(|tag| tag.to_string()).collect();
            self.filter_tags(
                source_tags,
                target_tags,
                &source_url,
                &target_url,
                &source_auth,
                &target_auth,
            )
            .await;
            return Ok(());
        }

        if source_url.tag().is_empty() {
            if !target_url.tag().is_empty() {
                return Err(TransferError::config(format!(
                    "source tag is empty but target tag is not, both sides of the rule: {}:{}",
                    source_url.url(),
                    target_url.url()
                )));
            }

            // mirror mode lists source tags through the vendor catalog
            let source_tags = match &self.catalog {
                Some(catalog) => catalog.repo_tags(&source_url.repo_with_namespace()).await?,
                None => {
                    self.image_source(&source_url, &source_auth, "")?
                        .tags()
                        .await?
                }
            };
            debug!("source {} tags are {:?}", source_url.url(), source_tags);

            let target = self.image_target(&target_url, &target_auth, "")?;
            let target_tags = target.tags().await?;
            debug!("target {} tags are {:?}", target_url.url(), target_tags);

            self.filter_tags(
                source_tags,
                target_tags,
                &source_url,
                &target_url,
                &source_auth,
                &target_auth,
            )
            .await;
            return Ok(());
        }

        // single tag: target tag defaults to the source tag
        let dest_tag = if target_url.tag().is_empty() {
            source_url.tag()
        } else {
            target_url.tag()
        };

        let source = self.image_source(&source_url, &source_auth, source_url.tag())?;
        let target = self.image_target(&target_url, &target_auth, dest_tag)?;

        let source_digest = source.digest().await.map_err(|e| {
            error!(
                "failed to get source image digest from {}: {}",
                source_url.url(),
                e
            );
            e
        })?;
        let target_digest = target.digest().await.map_err(|e| {
            error!(
                "failed to get target image digest from {}: {}",
                target_url.url(),
                e
            );
            e
        })?;

        if source_digest == target_digest {
            info!(
                "skip push image, target image {}/{}:{} already exist and has same digest {}",
                target.registry_host(),
                target.repository(),
                target.tag(),
                source_digest
            );
            return Ok(());
        }

        let expanded = UrlPair {
            source: source_url.url(),
            target: format!("{}:{}", target_url.url_without_tag(), dest_tag),
        };
        info!(
            "put expanded url pair source: {}, target: {}",
            expanded.source, expanded.target
        );
        self.push_pair(expanded);
        Ok(())
    }

    /// Apply the tag-existence policy to each source tag, with up to ten
    /// tags filtered concurrently. Filter failures route the prospective
    /// pair to the failed-expansion queue.
    pub(crate) async fn filter_tags(
        &self,
        source_tags: Vec<String>,
        target_tags: Vec<String>,
        source_url: &RepoUrl,
        target_url: &RepoUrl,
        source_auth: &Security,
        target_auth: &Security,
    ) {
        let target_tags = &target_tags;
        futures::stream::iter(source_tags)
            .for_each_concurrent(TAG_FILTER_WORKERS, |tag| async move {
                let pair = UrlPair {
                    source: format!("{}:{}", source_url.url_without_tag(), tag),
                    target: format!("{}:{}", target_url.url_without_tag(), tag),
                };
                debug!("handle tag {}", pair.source);

                if target_tags.contains(&tag) {
                    if !self.config.options.tag_exist_overridden {
                        warn!(
                            "skip push image, target image {}:{} already exist, \
                             flag \"--tag-exist-overridden\" is not set so skip",
                            target_url.url_without_tag(),
                            tag
                        );
                        return;
                    }

                    let digests = self
                        .tag_digests(source_url, target_url, &tag, source_auth, target_auth)
                        .await;
                    match digests {
                        Ok((source_digest, target_digest)) => {
                            if source_digest == target_digest {
                                info!(
                                    "skip push image, target image {}:{} already exist and has same digest {}",
                                    target_url.url_without_tag(),
                                    tag,
                                    source_digest
                                );
                                return;
                            }
                            if !target_digest.is_empty() {
                                warn!(
                                    "target image {}:{} already exist, target digest {} to be overridden as source digest {}",
                                    target_url.url_without_tag(),
                                    tag,
                                    target_digest,
                                    source_digest
                                );
                            }
                        }
                        Err(e) => {
                            error!("filter tag {} error: {}", pair.source, e);
                            self.push_failed_rule(pair);
                            return;
                        }
                    }
                }

                info!(
                    "put expanded url pair source: {}, target: {}",
                    pair.source, pair.target
                );
                self.push_pair(pair);
            })
            .await;
    }

    async fn tag_digests(
        &self,
        source_url: &RepoUrl,
        target_url: &RepoUrl,
        tag: &str,
        source_auth: &Security,
        target_auth: &Security,
    ) -> Result<(String, String)> {
        let source = self.image_source(source_url, source_auth, tag)?;
        let target = self.image_target(target_url, target_auth, tag)?;
        let source_digest = source.digest().await?;
        let target_digest = target.digest().await?;
        Ok((source_digest, target_digest))
    }
}
