//! Configuration loading and lookup
//!
//! Three YAML files drive a run: the rule file (source url -> target url),
//! the security file (registry or registry/namespace -> credentials), and,
//! in mirror mode, the secret file with the vendor API keys. Flag values are
//! carried in [`Options`] so the pipeline never reads ambient state.

use std::collections::HashMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

pub const MAX_ROUTINES: usize = 50;
pub const MAX_QPS: u32 = 30_000;

pub const DEFAULT_ROUTINES: usize = 5;
pub const DEFAULT_RETRY: usize = 2;
pub const DEFAULT_QPS: u32 = 100;

/// Credentials for one registry or registry/namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Security {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
}

impl Security {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// Vendor API keys for mirror mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    #[serde(rename = "secretId")]
    pub secret_id: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

/// Flag-level options, filled by the CLI layer
#[derive(Debug, Clone)]
pub struct Options {
    pub security_file: String,
    pub rule_file: String,
    pub secret_file: String,
    pub routines: usize,
    pub retry: usize,
    pub qps: u32,
    pub default_registry: String,
    pub default_namespace: String,
    pub ccr_to_tcr: bool,
    pub ccr_region: String,
    pub tcr_region: String,
    pub tcr_name: String,
    pub tag_exist_overridden: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            security_file: String::new(),
            rule_file: String::new(),
            secret_file: String::new(),
            routines: DEFAULT_ROUTINES,
            retry: DEFAULT_RETRY,
            qps: DEFAULT_QPS,
            default_registry: String::new(),
            default_namespace: String::new(),
            ccr_to_tcr: false,
            ccr_region: "ap-guangzhou".to_string(),
            tcr_region: "ap-guangzhou".to_string(),
            tcr_name: String::new(),
            tag_exist_overridden: true,
        }
    }
}

/// All configuration a run needs, loaded once at startup
#[derive(Debug, Clone)]
pub struct Configs {
    pub options: Options,
    pub security: HashMap<String, Security>,
    pub image_list: HashMap<String, String>,
    pub secret: HashMap<String, Secret>,
}

impl Configs {
    /// Load and validate the config files named by `options`. Mirror mode
    /// requires the secret file, the security file and a tcr name; rules
    /// mode requires the rule file and the security file. `routines` and
    /// `qps` are capped after load.
    pub fn load(mut options: Options) -> Result<Self> {
        let mut image_list = HashMap::new();
        let mut secret = HashMap::new();

        if options.ccr_to_tcr {
            if options.secret_file.is_empty() || options.security_file.is_empty() {
                return Err(TransferError::config(
                    "no secret file or security file is provided",
                ));
            }
            if options.tcr_name.is_empty() {
                return Err(TransferError::config("no tcr name is provided"));
            }
            secret = open_and_decode(&options.secret_file)?;
        } else {
            if options.rule_file.is_empty() || options.security_file.is_empty() {
                return Err(TransferError::config(
                    "no rule file or security file is provided",
                ));
            }
            image_list = open_and_decode(&options.rule_file)?;
        }

        let security = open_and_decode(&options.security_file)?;

        if options.routines == 0 {
            options.routines = 1;
        }
        if options.routines > MAX_ROUTINES {
            options.routines = MAX_ROUTINES;
        }
        if options.qps > MAX_QPS {
            options.qps = MAX_QPS;
        }

        Ok(Configs {
            options,
            security,
            image_list,
            secret,
        })
    }

    /// Look up credentials for a registry, preferring the more specific
    /// `registry/namespace` key over the bare `registry` key. The second
    /// return value reports whether a match was found; without one, access
    /// is anonymous.
    pub fn security_for(&self, registry: &str, namespace: &str) -> (Security, bool) {
        let specific = format!("{}/{}", registry, namespace);
        if let Some(auth) = self.security.get(&specific) {
            return (auth.clone(), true);
        }
        match self.security.get(registry) {
            Some(auth) => (auth.clone(), true),
            None => (Security::default(), false),
        }
    }

    /// The CCR keys, falling back to the TCR entry when absent.
    pub fn ccr_secret(&self) -> Result<Secret> {
        self.vendor_secret("ccr", "tcr")
    }

    /// The TCR keys, falling back to the CCR entry when absent.
    pub fn tcr_secret(&self) -> Result<Secret> {
        self.vendor_secret("tcr", "ccr")
    }

    fn vendor_secret(&self, wanted: &str, fallback: &str) -> Result<Secret> {
        self.secret
            .get(wanted)
            .or_else(|| self.secret.get(fallback))
            .cloned()
            .ok_or_else(|| {
                TransferError::config(format!("no {} secret found in secret file", wanted))
            })
    }
}

/// Open a yaml file and decode it into `target`'s type. Only `.yaml` files
/// are accepted.
fn open_and_decode<T: DeserializeOwned>(path: &str) -> Result<T> {
    if !path.ends_with(".yaml") && !path.ends_with(".yml") {
        return Err(TransferError::config(format!(
            "only yaml format file is supported: {}",
            path
        )));
    }
    if !Path::new(path).exists() {
        return Err(TransferError::config(format!("file {} not exist", path)));
    }

    let file = std::fs::File::open(path)
        .map_err(|e| TransferError::config(format!("open file {} error: {}", path, e)))?;
    serde_yaml::from_reader(file)
        .map_err(|e| TransferError::config(format!("unmarshal config {} error: {}", path, e)))
}
