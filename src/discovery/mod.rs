//! Mirror-mode discovery
//!
//! Enumerates a vendor's personal registry (CCR) and streams every
//! repository as a tagless rule into the pipeline, after making sure the
//! per-customer target registry (TCR) has every namespace the source
//! uses. The pipeline only depends on the two catalog traits; the Tencent
//! HTTP bindings live in [`tencent`].

pub mod tencent;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransferError};
use crate::transfer::UrlPair;

/// Listing side of the vendor API: names only, no registry wire protocol.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn namespaces(&self) -> Result<Vec<String>>;

    async fn repository_count(&self) -> Result<u64>;

    /// One page of `namespace/name` repository strings.
    async fn repositories(&self, offset: u64, limit: u64) -> Result<Vec<String>>;

    async fn repo_tags(&self, repository: &str) -> Result<Vec<String>>;
}

/// Namespace management side of the target vendor API.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn namespaces(&self) -> Result<Vec<String>>;

    async fn create_namespace(&self, namespace: &str) -> Result<()>;
}

const PAGE_WORKERS: usize = 5;
const PAGE_LIMIT: u64 = 100;
const SNAPSHOT_PATH: &str = "./ccr_to_tcr_rules";

/// CCR region to registry domain prefix.
const REGION_PREFIXES: &[(&str, &str)] = &[
    ("ap-guangzhou", "ccr"),
    ("ap-shanghai", "ccr"),
    ("ap-nanjing", "ccr"),
    ("ap-beijing", "ccr"),
    ("ap-shenzhen", "ccr"),
    ("ap-chongqing", "ccr"),
    ("ap-chengdu", "ccr"),
    ("ap-tianjin", "ccr"),
    ("ap-hongkong", "hkccr"),
    ("ap-shenzhen-fsi", "szjrccr"),
    ("ap-shanghai-fsi", "shjrccr"),
    ("ap-beijing-fsi", "bjjrccr"),
    ("ap-singapore", "sgccr"),
    ("ap-seoul", "krccr"),
    ("ap-tokyo", "jpccr"),
    ("ap-mumbai", "inccr"),
    ("ap-bangkok", "thccr"),
    ("na-toronto", "caccr"),
    ("na-siliconvalley", "uswccr"),
    ("na-ashburn", "useccr"),
    ("eu-frankfurt", "deccr"),
    ("eu-moscow", "ruccr"),
];

pub fn region_prefix(region: &str) -> Option<&'static str> {
    REGION_PREFIXES
        .iter()
        .find(|(name, _)| *name == region)
        .map(|(_, prefix)| *prefix)
}

/// Orchestrates one mirror run: namespace preparation, then the paged
/// repository sweep feeding the pipeline's raw-rule intake.
pub struct MirrorPlanner {
    ccr: Arc<dyn SourceCatalog>,
    tcr: Arc<dyn TargetCatalog>,
    source_host: String,
    target_host: String,
    retry: usize,
}

impl MirrorPlanner {
    pub fn new(
        ccr: Arc<dyn SourceCatalog>,
        tcr: Arc<dyn TargetCatalog>,
        ccr_region: &str,
        tcr_name: &str,
        retry: usize,
    ) -> Result<Self> {
        let prefix = region_prefix(ccr_region).ok_or_else(|| {
            TransferError::VendorApi(format!("unknown ccr region: {}", ccr_region))
        })?;
        Ok(MirrorPlanner {
            ccr,
            tcr,
            source_host: format!("{}.ccs.tencentyun.com", prefix),
            target_host: format!("{}.tencentcloudcr.com", tcr_name),
            retry,
        })
    }

    /// Create every source namespace missing at the target. Creation
    /// failures are retried up to `retry` times and reported; they never
    /// abort discovery. Returns the namespaces that still failed.
    pub async fn prepare_namespaces(&self) -> Result<Vec<String>> {
        let source_ns = self.ccr.namespaces().await?;
        debug!("source namespaces are {:?}", source_ns);
        let target_ns = self.tcr.namespaces().await?;
        debug!("target namespaces are {:?}", target_ns);

        let mut failed = Vec::new();
        for ns in &source_ns {
            if !target_ns.contains(ns) {
                info!("create namespace {}", ns);
                if let Err(e) = self.tcr.create_namespace(ns).await {
                    error!("create namespace {} error: {}", ns, e);
                    failed.push(ns.clone());
                }
            }
        }

        for _ in 0..self.retry {
            if failed.is_empty() {
                break;
            }
            info!("some source namespaces failed to create, retrying");
            let target_ns = match self.tcr.namespaces().await {
                Ok(ns) => ns,
                Err(e) => {
                    error!("retry namespace create, list target error: {}", e);
                    continue;
                }
            };
            let mut still_failed = Vec::new();
            for ns in &failed {
                if !target_ns.contains(ns) {
                    if let Err(e) = self.tcr.create_namespace(ns).await {
                        error!("create namespace {} error: {}", ns, e);
                        still_failed.push(ns.clone());
                    }
                }
            }
            failed = still_failed;
        }

        if !failed.is_empty() {
            warn!("some namespaces could not be created at the target: {:?}", failed);
        }
        Ok(failed)
    }

    /// Page through every source repository with up to five concurrent
    /// page fetches, streaming each one as a tagless rule. Repositories in
    /// `skip_namespaces` are left out. Closes the intake when the sweep
    /// completes and snapshots the synthesized rules best-effort.
    pub async fn stream_rules(
        &self,
        intake_tx: mpsc::Sender<UrlPair>,
        skip_namespaces: Vec<String>,
    ) -> Result<()> {
        let total = self.ccr.repository_count().await?;
        debug!("total repository count is {}", total);

        let semaphore = Arc::new(Semaphore::new(PAGE_WORKERS));
        let rules: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let skip_namespaces = Arc::new(skip_namespaces);

        let mut pages = Vec::new();
        let mut offset = 0u64;
        while offset < total {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ccr = Arc::clone(&self.ccr);
            let intake_tx = intake_tx.clone();
            let skip_namespaces = Arc::clone(&skip_namespaces);
            let rules = Arc::clone(&rules);
            let source_host = self.source_host.clone();
            let target_host = self.target_host.clone();

            pages.push(tokio::spawn(async move {
                let _permit = permit;
                let repos = ccr.repositories(offset, PAGE_LIMIT).await?;
                for repo in repos {
                    let namespace = repo.split('/').next().unwrap_or_default();
                    if skip_namespaces.iter().any(|ns| ns.as_str() == namespace) {
                        continue;
                    }
                    let pair = UrlPair {
                        source: format!("{}/{}", source_host, repo),
                        target: format!("{}/{}", target_host, repo),
                    };
                    rules
                        .lock()
                        .unwrap()
                        .insert(pair.source.clone(), pair.target.clone());
                    if intake_tx.send(pair).await.is_err() {
                        break;
                    }
                }
                Ok::<(), TransferError>(())
            }));
            offset += PAGE_LIMIT;
        }
        drop(intake_tx);

        let mut result = Ok(());
        for page in pages {
            match page.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("repository page sweep error: {}", e);
                    result = Err(e);
                }
                Err(e) => {
                    result = Err(TransferError::registry(format!(
                        "page worker panicked: {}",
                        e
                    )));
                }
            }
        }

        let snapshot = rules.lock().unwrap().clone();
        write_snapshot(snapshot);

        result
    }
}

/// Best-effort JSON snapshot of the synthesized rules; failure is logged
/// and otherwise ignored.
fn write_snapshot(rules: HashMap<String, String>) {
    tokio::spawn(async move {
        match serde_json::to_vec(&rules) {
            Ok(payload) => {
                if let Err(e) = tokio::fs::write(SNAPSHOT_PATH, payload).await {
                    error!("write rules snapshot error: {}", e);
                }
            }
            Err(e) => error!("marshal rules snapshot error: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        repos: Vec<String>,
        namespaces: Vec<String>,
    }

    #[async_trait]
    impl SourceCatalog for FakeSource {
        async fn namespaces(&self) -> Result<Vec<String>> {
            Ok(self.namespaces.clone())
        }

        async fn repository_count(&self) -> Result<u64> {
            Ok(self.repos.len() as u64)
        }

        async fn repositories(&self, offset: u64, limit: u64) -> Result<Vec<String>> {
            let start = offset as usize;
            let end = (offset + limit).min(self.repos.len() as u64) as usize;
            Ok(self.repos.get(start..end).unwrap_or_default().to_vec())
        }

        async fn repo_tags(&self, _repository: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeTarget {
        namespaces: Mutex<Vec<String>>,
        fail_creates: Mutex<usize>,
    }

    #[async_trait]
    impl TargetCatalog for FakeTarget {
        async fn namespaces(&self) -> Result<Vec<String>> {
            Ok(self.namespaces.lock().unwrap().clone())
        }

        async fn create_namespace(&self, namespace: &str) -> Result<()> {
            {
                let mut remaining = self.fail_creates.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransferError::VendorApi("create failed".to_string()));
                }
            }
            self.namespaces
                .lock()
                .unwrap()
                .push(namespace.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_region_prefix_lookup() {
        assert_eq!(region_prefix("ap-guangzhou"), Some("ccr"));
        assert_eq!(region_prefix("eu-frankfurt"), Some("deccr"));
        assert_eq!(region_prefix("nowhere"), None);
    }

    #[tokio::test]
    async fn test_prepare_namespaces_creates_missing() {
        let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeSource {
            repos: Vec::new(),
            namespaces: vec!["team-a".to_string(), "team-b".to_string()],
        });
        let tcr = Arc::new(FakeTarget::default());
        tcr.namespaces.lock().unwrap().push("team-a".to_string());

        let planner = MirrorPlanner::new(
            Arc::clone(&ccr),
            Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
            "ap-guangzhou",
            "mytcr",
            2,
        )
        .unwrap();
        let failed = planner.prepare_namespaces().await.unwrap();
        assert!(failed.is_empty());
        assert_eq!(
            *tcr.namespaces.lock().unwrap(),
            vec!["team-a".to_string(), "team-b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prepare_namespaces_retries_failures() {
        let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeSource {
            repos: Vec::new(),
            namespaces: vec!["team-a".to_string()],
        });
        let tcr = Arc::new(FakeTarget::default());
        *tcr.fail_creates.lock().unwrap() = 1;

        let planner = MirrorPlanner::new(
            Arc::clone(&ccr),
            Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
            "ap-guangzhou",
            "mytcr",
            2,
        )
        .unwrap();
        let failed = planner.prepare_namespaces().await.unwrap();
        assert!(failed.is_empty());
        assert_eq!(*tcr.namespaces.lock().unwrap(), vec!["team-a".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_rules_emits_tagless_pairs() {
        let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeSource {
            repos: vec!["ns/app".to_string(), "ns/tool".to_string()],
            namespaces: vec!["ns".to_string()],
        });
        let tcr = Arc::new(FakeTarget::default());
        let planner = MirrorPlanner::new(
            Arc::clone(&ccr),
            Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
            "ap-tokyo",
            "mytcr",
            2,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        planner.stream_rules(tx, Vec::new()).await.unwrap();

        let mut pairs = Vec::new();
        while let Some(pair) = rx.recv().await {
            pairs.push(pair);
        }
        pairs.sort_by(|a, b| a.source.cmp(&b.source));
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].source, "jpccr.ccs.tencentyun.com/ns/app");
        assert_eq!(pairs[0].target, "mytcr.tencentcloudcr.com/ns/app");
        assert!(!pairs[0].source.contains(':'));
    }

    #[tokio::test]
    async fn test_stream_rules_skips_failed_namespaces() {
        let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeSource {
            repos: vec!["good/app".to_string(), "bad/app".to_string()],
            namespaces: Vec::new(),
        });
        let tcr = Arc::new(FakeTarget::default());
        let planner = MirrorPlanner::new(
            Arc::clone(&ccr),
            Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
            "ap-guangzhou",
            "mytcr",
            2,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        planner
            .stream_rules(tx, vec!["bad".to_string()])
            .await
            .unwrap();

        let mut pairs = Vec::new();
        while let Some(pair) = rx.recv().await {
            pairs.push(pair);
        }
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].source.ends_with("good/app"));
    }
}
