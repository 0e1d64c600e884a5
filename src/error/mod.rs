//! Error types shared across the transfer pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Missing or malformed configuration, fatal at startup
    #[error("config error: {0}")]
    Config(String),

    /// A repository url that does not parse
    #[error("invalid repository url: {0}")]
    InvalidUrl(String),

    /// Registry returned an unexpected response
    #[error("registry error: {0}")]
    Registry(String),

    /// Transport-level failure talking to a registry
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cloud vendor API failure in mirror mode
    #[error("vendor api error: {0}")]
    VendorApi(String),
}

impl TransferError {
    pub fn registry(msg: impl Into<String>) -> Self {
        TransferError::Registry(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TransferError::Config(msg.into())
    }
}
