//! Enrichment collaborator contracts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe cancelled")]
    Cancelled,
    #[error("probe panicked or was aborted")]
    Aborted,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// One open port reported by a scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFinding {
    pub number: u16,
    pub protocol: String,
    pub service: String,
    pub product: String,
    pub version: String,
}

#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn scan(&self, host: &str, cancel: &CancellationToken) -> Result<Vec<PortFinding>, ProbeError>;
}

#[async_trait]
pub trait TakeoverChecker: Send + Sync {
    /// `Some(service)` (lowercase) when `host` is vulnerable to a takeover.
    async fn check(&self, host: &str, cancel: &CancellationToken) -> Result<Option<String>, ProbeError>;
}
