//! The concurrent transfer pipeline
//!
//! Rules flow through three stages: the raw rule queue is drained by
//! tag-expander workers into the expanded pair queue, job-builder workers
//! turn pairs into runnable [`TransferJob`]s on a bounded channel, and
//! job-runner workers execute them. Each stage has a matching failure
//! queue; a retry loop replays all three after the primary pass drains.
//! The only cross-stage synchronization besides channel closure is the
//! `rules_done` flag, which tells builders that an empty pair queue means
//! "done" rather than "wait".

pub mod job;
pub mod rules;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::{Configs, Security};
use crate::discovery::SourceCatalog;
use crate::error::{Result, TransferError};
use crate::reference::RepoUrl;
use crate::registry::RegistryProvider;

pub use job::{ImageSource, ImageTarget, TransferJob};

/// A pair of source and target urls, before or after tag expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPair {
    pub source: String,
    pub target: String,
}

/// Failure counters reported once the pipeline drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub failed_jobs: usize,
    pub failed_expansions: usize,
    pub failed_builds: usize,
}

impl TransferSummary {
    pub fn is_clean(&self) -> bool {
        self.failed_jobs == 0 && self.failed_expansions == 0 && self.failed_builds == 0
    }
}

/// Where raw rules come from: a declarative map, or the mirror-mode
/// discovery stream.
pub enum Intake {
    Rules(HashMap<String, String>),
    Mirror(mpsc::Receiver<UrlPair>),
}

pub(crate) const TAG_FILTER_WORKERS: usize = 10;
const MIRROR_WORKERS: usize = 5;
const BUILDER_IDLE_WAIT: Duration = Duration::from_millis(100);

type SharedJobReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<TransferJob>>>;

pub struct TransferClient {
    pub(crate) config: Arc<Configs>,
    pub(crate) provider: Arc<dyn RegistryProvider>,
    /// In mirror mode, source tags are listed through the vendor catalog
    /// instead of the registry.
    pub(crate) catalog: Option<Arc<dyn SourceCatalog>>,

    rule_queue: Mutex<VecDeque<UrlPair>>,
    pair_queue: Mutex<VecDeque<UrlPair>>,
    failed_rules: Mutex<VecDeque<UrlPair>>,
    failed_pairs: Mutex<VecDeque<UrlPair>>,
    failed_jobs: Mutex<VecDeque<TransferJob>>,
    rules_done: Mutex<bool>,
}

impl TransferClient {
    pub fn new(config: Arc<Configs>, provider: Arc<dyn RegistryProvider>) -> Arc<Self> {
        Self::build(config, provider, None)
    }

    /// A client whose tag expansion lists source tags through `catalog`.
    pub fn with_catalog(
        config: Arc<Configs>,
        provider: Arc<dyn RegistryProvider>,
        catalog: Arc<dyn SourceCatalog>,
    ) -> Arc<Self> {
        Self::build(config, provider, Some(catalog))
    }

    fn build(
        config: Arc<Configs>,
        provider: Arc<dyn RegistryProvider>,
        catalog: Option<Arc<dyn SourceCatalog>>,
    ) -> Arc<Self> {
        Arc::new(TransferClient {
            config,
            provider,
            catalog,
            rule_queue: Mutex::new(VecDeque::new()),
            pair_queue: Mutex::new(VecDeque::new()),
            failed_rules: Mutex::new(VecDeque::new()),
            failed_pairs: Mutex::new(VecDeque::new()),
            failed_jobs: Mutex::new(VecDeque::new()),
            rules_done: Mutex::new(false),
        })
    }

    /// Run the pipeline to completion, including the retry passes, and
    /// report the failure counters. Per-job failures never fail the run.
    pub async fn run(self: Arc<Self>, intake: Intake) -> TransferSummary {
        let routines = self.config.options.routines;
        info!("start to handle transfer jobs, please wait ...");

        let (job_tx, job_rx) = mpsc::channel::<TransferJob>(routines);
        let job_rx: SharedJobReceiver = Arc::new(tokio::sync::Mutex::new(job_rx));

        let runner = {
            let client = Arc::clone(&self);
            tokio::spawn(async move { client.jobs_handler(job_rx).await })
        };

        let expander = {
            let client = Arc::clone(&self);
            tokio::spawn(async move {
                match intake {
                    Intake::Rules(rules) => {
                        for (source, target) in rules {
                            client.push_rule(UrlPair { source, target });
                        }
                        Arc::clone(&client).expand_rules(routines).await;
                    }
                    Intake::Mirror(intake_rx) => {
                        Arc::clone(&client).mirror_intake(intake_rx).await;
                    }
                }
                client.set_rules_done();
            })
        };

        Arc::clone(&self).build_jobs(job_tx).await;
        let _ = expander.await;
        let _ = runner.await;

        info!("start to retry failed jobs...");
        for _ in 0..self.config.options.retry {
            debug!(
                "failed jobs {}, failed expansions {}, failed builds {}",
                self.failed_jobs.lock().unwrap().len(),
                self.failed_rules.lock().unwrap().len(),
                self.failed_pairs.lock().unwrap().len(),
            );
            Arc::clone(&self).retry_pass().await;
        }

        self.report()
    }

    /// Job-runner pool: `routines` workers sharing one receiver, exiting
    /// when the channel closes. Failed jobs land on the failed-jobs queue.
    async fn jobs_handler(self: Arc<Self>, job_rx: SharedJobReceiver) {
        let routines = self.config.options.routines;
        let mut workers = Vec::with_capacity(routines);
        for _ in 0..routines {
            let client = Arc::clone(&self);
            let job_rx = Arc::clone(&job_rx);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    if let Err(e) = job.run().await {
                        error!("handle job failed {}: {}", job.source_url(), e);
                        client.push_failed_job(job);
                    }
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Job-builder pool: poll the pair queue, build jobs onto the channel,
    /// exit once the queue is empty and expansion has finished. All
    /// senders dropping closes the channel for the runner pool.
    async fn build_jobs(self: Arc<Self>, job_tx: mpsc::Sender<TransferJob>) {
        let routines = self.config.options.routines;
        let mut workers = Vec::with_capacity(routines);
        for _ in 0..routines {
            let client = Arc::clone(&self);
            let job_tx = job_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    match client.pop_pair() {
                        Some(pair) => {
                            info!(
                                "generate job source {}, target {}",
                                pair.source, pair.target
                            );
                            if let Err(e) = client.build_job(&pair, &job_tx).await {
                                error!(
                                    "generate transfer job {} to {} error: {}",
                                    pair.source, pair.target, e
                                );
                                client.push_failed_pair(pair);
                            }
                        }
                        None if client.is_rules_done() => break,
                        None => tokio::time::sleep(BUILDER_IDLE_WAIT).await,
                    }
                }
            }));
        }
        drop(job_tx);
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Turn one fully-tagged pair into a runnable job.
    async fn build_job(&self, pair: &UrlPair, job_tx: &mpsc::Sender<TransferJob>) -> Result<()> {
        if pair.source.is_empty() {
            return Err(TransferError::InvalidUrl(
                "source url should not be empty".to_string(),
            ));
        }
        if pair.target.is_empty() {
            return Err(TransferError::InvalidUrl(
                "target url should not be empty".to_string(),
            ));
        }

        let source_url = RepoUrl::parse(&pair.source)?;
        let target_url = RepoUrl::parse(&pair.target)?;

        if source_url.tag().is_empty() {
            return Err(TransferError::InvalidUrl(format!(
                "source tag empty, source: {}",
                source_url.url()
            )));
        }
        if target_url.tag().is_empty() {
            return Err(TransferError::InvalidUrl(format!(
                "target tag empty, target: {}",
                target_url.url()
            )));
        }

        let source_auth = self.lookup_security(&source_url, "pull");
        let target_auth = self.lookup_security(&target_url, "push");

        let source = self.image_source(&source_url, &source_auth, source_url.tag())?;
        let target = self.image_target(&target_url, &target_auth, target_url.tag())?;
        let job = TransferJob::new(source, target);

        info!(
            "generate a job for {} to {}",
            source_url.url(),
            target_url.url()
        );
        job_tx
            .send(job)
            .await
            .map_err(|_| TransferError::registry("job channel closed"))?;
        Ok(())
    }

    /// Tag-expander pool over the raw rule queue.
    pub(crate) async fn expand_rules(self: Arc<Self>, workers: usize) {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let client = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while let Some(pair) = client.pop_rule() {
                    if let Err(e) = client.expand_rule(&pair).await {
                        error!(
                            "generate tag url pair {} to {} error: {}",
                            pair.source, pair.target, e
                        );
                        client.push_failed_rule(pair);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Mirror-mode intake: five workers expand rules straight off the
    /// discovery stream.
    async fn mirror_intake(self: Arc<Self>, intake_rx: mpsc::Receiver<UrlPair>) {
        let intake_rx = Arc::new(tokio::sync::Mutex::new(intake_rx));
        let mut handles = Vec::with_capacity(MIRROR_WORKERS);
        for _ in 0..MIRROR_WORKERS {
            let client = Arc::clone(&self);
            let intake_rx = Arc::clone(&intake_rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let pair = { intake_rx.lock().await.recv().await };
                    let Some(pair) = pair else { break };
                    info!("mirror repo rule {} -> {}", pair.source, pair.target);
                    if let Err(e) = client.expand_rule(&pair).await {
                        error!(
                            "handle mirror rule {} to {} error: {}",
                            pair.source, pair.target, e
                        );
                        client.push_failed_rule(pair);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One retry pass: replay failed jobs on a fresh runner pool, re-run
    /// expansion for failed rules, and rebuild failed pairs.
    async fn retry_pass(self: Arc<Self>) {
        let routines = self.config.options.routines;
        let (job_tx, job_rx) = mpsc::channel::<TransferJob>(routines);
        let job_rx: SharedJobReceiver = Arc::new(tokio::sync::Mutex::new(job_rx));
        let runner = {
            let client = Arc::clone(&self);
            tokio::spawn(async move { client.jobs_handler(job_rx).await })
        };

        let failed_jobs = self.take_failed_jobs();
        let replay = if failed_jobs.is_empty() {
            None
        } else {
            let (retry_tx, retry_rx) = mpsc::channel::<TransferJob>(failed_jobs.len());
            for job in failed_jobs {
                info!(
                    "put failed job back for retry {} -> {}",
                    job.source_url(),
                    job.target_url()
                );
                let _ = retry_tx.send(job).await;
            }
            drop(retry_tx);
            let retry_rx: SharedJobReceiver = Arc::new(tokio::sync::Mutex::new(retry_rx));
            let client = Arc::clone(&self);
            Some(tokio::spawn(async move {
                client.jobs_handler(retry_rx).await
            }))
        };

        let failed_rules = self.take_failed_rules();
        let had_rules = !failed_rules.is_empty();
        if had_rules {
            for pair in failed_rules {
                self.push_rule(pair);
            }
            let workers = if self.catalog.is_some() {
                MIRROR_WORKERS
            } else {
                routines
            };
            Arc::clone(&self).expand_rules(workers).await;
        }

        let failed_pairs = self.take_failed_pairs();
        let had_pairs = !failed_pairs.is_empty();
        for pair in failed_pairs {
            self.push_pair(pair);
        }

        if had_rules || had_pairs {
            Arc::clone(&self).build_jobs(job_tx).await;
        } else {
            drop(job_tx);
        }

        if let Some(replay) = replay {
            let _ = replay.await;
        }
        let _ = runner.await;
    }

    fn report(&self) -> TransferSummary {
        let failed_jobs = self.failed_jobs.lock().unwrap();
        if !failed_jobs.is_empty() {
            info!(
                "################# {} failed transfer jobs: #################",
                failed_jobs.len()
            );
            for job in failed_jobs.iter() {
                info!("{}", job.source_url());
            }
        }

        let failed_rules = self.failed_rules.lock().unwrap();
        if !failed_rules.is_empty() {
            info!(
                "################# {} failed tag expansions: #################",
                failed_rules.len()
            );
            for pair in failed_rules.iter() {
                info!("{}: {}", pair.source, pair.target);
            }
        }

        let failed_pairs = self.failed_pairs.lock().unwrap();
        if !failed_pairs.is_empty() {
            info!(
                "################# {} failed job builds: #################",
                failed_pairs.len()
            );
            for pair in failed_pairs.iter() {
                info!("{}: {}", pair.source, pair.target);
            }
        }

        let summary = TransferSummary {
            failed_jobs: failed_jobs.len(),
            failed_expansions: failed_rules.len(),
            failed_builds: failed_pairs.len(),
        };
        info!(
            "################# finished, {} transfer jobs failed, {} tag expansions failed, {} job builds failed #################",
            summary.failed_jobs, summary.failed_expansions, summary.failed_builds
        );
        summary
    }

    pub(crate) fn image_source(
        &self,
        url: &RepoUrl,
        auth: &Security,
        tag: &str,
    ) -> Result<ImageSource> {
        let registry = self.provider.connect(url.registry(), auth)?;
        ImageSource::new(registry, url.registry(), url.repo_with_namespace(), tag)
    }

    pub(crate) fn image_target(
        &self,
        url: &RepoUrl,
        auth: &Security,
        tag: &str,
    ) -> Result<ImageTarget> {
        let registry = self.provider.connect(url.registry(), auth)?;
        ImageTarget::new(registry, url.registry(), url.repo_with_namespace(), tag)
    }

    pub(crate) fn lookup_security(&self, url: &RepoUrl, action: &str) -> Security {
        let (auth, found) = self.config.security_for(url.registry(), url.namespace());
        if found {
            info!(
                "find auth information for {}, username: {}",
                url.url(),
                auth.username
            );
        } else {
            info!(
                "cannot find auth information for {}, {} actions will be anonymous",
                url.url(),
                action
            );
        }
        auth
    }

    // queue plumbing; every queue has its own lock and short critical
    // sections

    fn pop_rule(&self) -> Option<UrlPair> {
        self.rule_queue.lock().unwrap().pop_front()
    }

    pub(crate) fn push_rule(&self, pair: UrlPair) {
        self.rule_queue.lock().unwrap().push_back(pair);
    }

    fn pop_pair(&self) -> Option<UrlPair> {
        self.pair_queue.lock().unwrap().pop_front()
    }

    pub(crate) fn push_pair(&self, pair: UrlPair) {
        self.pair_queue.lock().unwrap().push_back(pair);
    }

    pub(crate) fn push_failed_rule(&self, pair: UrlPair) {
        self.failed_rules.lock().unwrap().push_back(pair);
    }

    fn take_failed_rules(&self) -> Vec<UrlPair> {
        self.failed_rules.lock().unwrap().drain(..).collect()
    }

    pub(crate) fn push_failed_pair(&self, pair: UrlPair) {
        self.failed_pairs.lock().unwrap().push_back(pair);
    }

    fn take_failed_pairs(&self) -> Vec<UrlPair> {
        self.failed_pairs.lock().unwrap().drain(..).collect()
    }

    fn push_failed_job(&self, job: TransferJob) {
        self.failed_jobs.lock().unwrap().push_back(job);
    }

    fn take_failed_jobs(&self) -> Vec<TransferJob> {
        self.failed_jobs.lock().unwrap().drain(..).collect()
    }

    fn set_rules_done(&self) {
        *self.rules_done.lock().unwrap() = true;
    }

    fn is_rules_done(&self) -> bool {
        *self.rules_done.lock().unwrap()
    }
}
