//! CLI entry
//!
//! Loads configuration, wires the registry provider and, in mirror mode,
//! the vendor catalogs, then drives the pipeline. Per-job failures are
//! reported in the final summary and never affect the exit code; only
//! startup and discovery failures do.

pub mod args;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::config::Configs;
use crate::discovery::tencent::{CcrCatalog, TcrCatalog};
use crate::discovery::MirrorPlanner;
use crate::registry::http::HttpRegistryProvider;
use crate::registry::RegistryProvider;
use crate::transfer::{Intake, TransferClient};

pub use args::Args;

const MIRROR_INTAKE_BUFFER: usize = 256;

pub async fn run(args: Args) -> anyhow::Result<()> {
    let configs =
        Arc::new(Configs::load(args.into_options()).context("failed to load configuration")?);
    let provider: Arc<dyn RegistryProvider> =
        Arc::new(HttpRegistryProvider::new(configs.options.qps));

    if configs.options.ccr_to_tcr {
        run_mirror(configs, provider).await
    } else {
        let client = TransferClient::new(Arc::clone(&configs), provider);
        client
            .run(Intake::Rules(configs.image_list.clone()))
            .await;
        Ok(())
    }
}

async fn run_mirror(
    configs: Arc<Configs>,
    provider: Arc<dyn RegistryProvider>,
) -> anyhow::Result<()> {
    let ccr_secret = configs.ccr_secret()?;
    let tcr_secret = configs.tcr_secret()?;

    let ccr: Arc<dyn crate::discovery::SourceCatalog> = Arc::new(
        CcrCatalog::new(&ccr_secret, &configs.options.ccr_region)
            .context("failed to build ccr catalog")?,
    );
    let tcr = Arc::new(
        TcrCatalog::new(
            &tcr_secret,
            &configs.options.tcr_region,
            &configs.options.tcr_name,
        )
        .context("failed to build tcr catalog")?,
    );

    let planner = MirrorPlanner::new(
        Arc::clone(&ccr),
        tcr,
        &configs.options.ccr_region,
        &configs.options.tcr_name,
        configs.options.retry,
    )?;

    // namespace creation failures are reported but never fatal
    let failed_namespaces = planner
        .prepare_namespaces()
        .await
        .context("failed to prepare target namespaces")?;

    let (intake_tx, intake_rx) = mpsc::channel(MIRROR_INTAKE_BUFFER);
    let sweep =
        tokio::spawn(async move { planner.stream_rules(intake_tx, failed_namespaces).await });

    let client = TransferClient::with_catalog(Arc::clone(&configs), provider, ccr);
    client.run(Intake::Mirror(intake_rx)).await;

    sweep
        .await
        .context("repository sweep task failed")?
        .context("repository discovery failed")?;
    Ok(())
}
