//! Command-line argument parsing

use clap::Parser;

use crate::config::{Options, DEFAULT_QPS, DEFAULT_RETRY, DEFAULT_ROUTINES};
use crate::logging::LogOptions;

#[derive(Debug, Parser)]
#[command(name = "registry-transfer")]
#[command(about = "Transfer OCI/Docker images between remote registries")]
#[command(version)]
pub struct Args {
    /// Registry auth config file path
    #[arg(long = "securityFile", default_value = "")]
    pub security_file: String,

    /// Image transfer rules file path
    #[arg(long = "ruleFile", default_value = "")]
    pub rule_file: String,

    /// Cloud secretId/secretKey file for mirror mode
    #[arg(long = "secretFile", default_value = "")]
    pub secret_file: String,

    /// Default target registry when a rule has an empty target
    #[arg(long = "registry", default_value = "")]
    pub default_registry: String,

    /// Default target namespace when a rule has an empty target
    #[arg(long = "ns", default_value = "")]
    pub default_namespace: String,

    /// Worker pool size per pipeline stage (capped at 50)
    #[arg(long = "routines", default_value_t = DEFAULT_ROUTINES)]
    pub routines: usize,

    /// Number of retry passes over the failure queues
    #[arg(long = "retry", default_value_t = DEFAULT_RETRY)]
    pub retry: usize,

    /// HTTP request rate (capped at 30000)
    #[arg(long = "qps", default_value_t = DEFAULT_QPS)]
    pub qps: u32,

    /// Mirror a personal registry (CCR) into an enterprise one (TCR)
    #[arg(long = "ccrToTcr", default_value_t = false)]
    pub ccr_to_tcr: bool,

    /// CCR region, used with --ccrToTcr
    #[arg(long = "ccrRegion", default_value = "ap-guangzhou")]
    pub ccr_region: String,

    /// TCR region, used with --ccrToTcr
    #[arg(long = "tcrRegion", default_value = "ap-guangzhou")]
    pub tcr_region: String,

    /// TCR instance name, used with --ccrToTcr
    #[arg(long = "tcrName", default_value = "")]
    pub tcr_name: String,

    /// Overwrite target tags whose digest differs from the source
    #[arg(
        long = "tag-exist-overridden",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub tag_exist_overridden: bool,

    /// Minimum log output level
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log output format: plain or json
    #[arg(long = "log-format", default_value = "plain")]
    pub log_format: String,

    /// Whether to output colored log
    #[arg(long = "log-enable-color", default_value_t = false)]
    pub log_enable_color: bool,

    /// Log output paths, comma separated; stdout when empty
    #[arg(long = "log-output-paths", value_delimiter = ',')]
    pub log_output_paths: Vec<String>,

    /// Log sampling interval in milliseconds
    #[arg(long = "log-sampling-frequency", default_value_t = 100)]
    pub log_sampling_frequency: u64,
}

impl Args {
    pub fn into_options(&self) -> Options {
        Options {
            security_file: self.security_file.clone(),
            rule_file: self.rule_file.clone(),
            secret_file: self.secret_file.clone(),
            routines: self.routines,
            retry: self.retry,
            qps: self.qps,
            default_registry: self.default_registry.clone(),
            default_namespace: self.default_namespace.clone(),
            ccr_to_tcr: self.ccr_to_tcr,
            ccr_region: self.ccr_region.clone(),
            tcr_region: self.tcr_region.clone(),
            tcr_name: self.tcr_name.clone(),
            tag_exist_overridden: self.tag_exist_overridden,
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
            color: self.log_enable_color,
            output_paths: self.log_output_paths.clone(),
            sampling_interval: std::time::Duration::from_millis(self.log_sampling_frequency),
        }
    }
}
