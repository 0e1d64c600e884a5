//! Mirror-mode end-to-end: discovery catalogs feeding the pipeline

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use registry_transfer::config::Options;
use registry_transfer::discovery::{MirrorPlanner, SourceCatalog, TargetCatalog};
use registry_transfer::error::Result;
use registry_transfer::registry::memory::MemoryProvider;
use registry_transfer::transfer::{Intake, TransferClient};
use registry_transfer::TransferError;
use tokio::sync::mpsc;

use common::{configs_with, seed_image};

const SOURCE_HOST: &str = "jpccr.ccs.tencentyun.com";
const TARGET_HOST: &str = "mytcr.tencentcloudcr.com";

struct FakeCcr {
    namespaces: Vec<String>,
    repos: Vec<String>,
    tags: Vec<(String, Vec<String>)>,
}

#[async_trait]
impl SourceCatalog for FakeCcr {
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

    async fn repo_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.tags
            .iter()
            .find(|(repo, _)| repo == repository)
            .map(|(_, tags)| tags.clone())
            .ok_or_else(|| TransferError::VendorApi(format!("unknown repo {}", repository)))
    }
}

#[derive(Default)]
struct FakeTcr {
    namespaces: Mutex<Vec<String>>,
}

#[async_trait]
impl TargetCatalog for FakeTcr {
    async fn namespaces(&self) -> Result<Vec<String>> {
        Ok(self.namespaces.lock().unwrap().clone())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces.lock().unwrap().push(namespace.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_mirror_run_copies_every_repo_and_tag() {
    let provider = Arc::new(MemoryProvider::new());
    let source = provider.registry(SOURCE_HOST);
    let target = provider.registry(TARGET_HOST);

    seed_image(&source, "team/app", "v1", &[b"app-one"]);
    seed_image(&source, "team/app", "v2", &[b"app-two"]);
    seed_image(&source, "team/tool", "latest", &[b"tool"]);

    let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeCcr {
        namespaces: vec!["team".to_string()],
        repos: vec!["team/app".to_string(), "team/tool".to_string()],
        tags: vec![
            (
                "team/app".to_string(),
                vec!["v1".to_string(), "v2".to_string()],
            ),
            ("team/tool".to_string(), vec!["latest".to_string()]),
        ],
    });
    let tcr = Arc::new(FakeTcr::default());

    let planner = MirrorPlanner::new(
        Arc::clone(&ccr),
        Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
        "ap-tokyo",
        "mytcr",
        2,
    )
    .unwrap();

    let failed_namespaces = planner.prepare_namespaces().await.unwrap();
    assert!(failed_namespaces.is_empty());
    assert_eq!(*tcr.namespaces.lock().unwrap(), vec!["team".to_string()]);

    let (intake_tx, intake_rx) = mpsc::channel(16);
    let sweep = tokio::spawn(async move { planner.stream_rules(intake_tx, failed_namespaces).await });

    let client = TransferClient::with_catalog(
        configs_with(Options::default()),
        Arc::clone(&provider) as Arc<dyn registry_transfer::registry::RegistryProvider>,
        ccr,
    );
    let summary = client.run(Intake::Mirror(intake_rx)).await;
    sweep.await.unwrap().unwrap();

    assert!(summary.is_clean());
    assert!(target.has_manifest("team/app", "v1"));
    assert!(target.has_manifest("team/app", "v2"));
    assert!(target.has_manifest("team/tool", "latest"));
}

#[tokio::test]
async fn test_mirror_skips_tags_already_present() {
    let provider = Arc::new(MemoryProvider::new());
    let source = provider.registry(SOURCE_HOST);
    let target = provider.registry(TARGET_HOST);

    seed_image(&source, "team/app", "v1", &[b"app-one"]);
    seed_image(&target, "team/app", "v1", &[b"app-one"]);

    let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeCcr {
        namespaces: vec!["team".to_string()],
        repos: vec!["team/app".to_string()],
        tags: vec![("team/app".to_string(), vec!["v1".to_string()])],
    });
    let tcr = Arc::new(FakeTcr::default());

    let planner = MirrorPlanner::new(
        Arc::clone(&ccr),
        Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
        "ap-tokyo",
        "mytcr",
        2,
    )
    .unwrap();
    let failed_namespaces = planner.prepare_namespaces().await.unwrap();

    let (intake_tx, intake_rx) = mpsc::channel(16);
    let sweep = tokio::spawn(async move { planner.stream_rules(intake_tx, failed_namespaces).await });

    let client = TransferClient::with_catalog(
        configs_with(Options::default()),
        Arc::clone(&provider) as Arc<dyn registry_transfer::registry::RegistryProvider>,
        ccr,
    );
    let summary = client.run(Intake::Mirror(intake_rx)).await;
    sweep.await.unwrap().unwrap();

    assert!(summary.is_clean());
    assert_eq!(target.blob_put_count(), 0);
    assert_eq!(target.manifest_put_count(), 0);
}

#[tokio::test]
async fn test_mirror_repo_without_tags_transfers_nothing() {
    let provider = Arc::new(MemoryProvider::new());
    let target = provider.registry(TARGET_HOST);

    let ccr: Arc<dyn SourceCatalog> = Arc::new(FakeCcr {
        namespaces: vec!["team".to_string()],
        repos: vec!["team/empty".to_string()],
        tags: vec![("team/empty".to_string(), Vec::new())],
    });
    let tcr = Arc::new(FakeTcr::default());

    let planner = MirrorPlanner::new(
        Arc::clone(&ccr),
        Arc::clone(&tcr) as Arc<dyn TargetCatalog>,
        "ap-tokyo",
        "mytcr",
        2,
    )
    .unwrap();
    let failed_namespaces = planner.prepare_namespaces().await.unwrap();

    let (intake_tx, intake_rx) = mpsc::channel(16);
    let sweep = tokio::spawn(async move { planner.stream_rules(intake_tx, failed_namespaces).await });

    let client = TransferClient::with_catalog(
        configs_with(Options::default()),
        Arc::clone(&provider) as Arc<dyn registry_transfer::registry::RegistryProvider>,
        ccr,
    );
    let summary = client.run(Intake::Mirror(intake_rx)).await;
    sweep.await.unwrap().unwrap();

    assert!(summary.is_clean());
    assert_eq!(target.manifest_put_count(), 0);
}
