//! Target list loading and periodic refresh.

use anyhow::{Context, Result};
use certhunter_core::{TargetSet, Targets};
use reqwest::Client;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TargetSource {
    pub url: Option<String>,
    pub patterns: Vec<String>,
    pub excluded_sources: Vec<String>,
}

pub async fn fetch_lines(http: &Client, url: &str) -> Result<Vec<String>> {
    let body = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch targets from {}", url))?
        .error_for_status()
        .with_context(|| format!("target list request to {} failed", url))?
        .text()
        .await
        .context("failed to read target list")?;
    Ok(body.lines().map(str::to_string).collect())
}

/// Remote lines followed by local patterns, compiled into one set.
pub fn build_set(remote: &[String], src: &TargetSource) -> Result<TargetSet> {
    let lines = remote.iter().chain(src.patterns.iter());
    TargetSet::compile(lines, &src.excluded_sources).context("failed to compile target patterns")
}

pub async fn load(http: &Client, src: &TargetSource) -> Result<TargetSet> {
    let remote = match src.url.as_deref() {
        Some(url) => fetch_lines(http, url).await?,
        None => Vec::new(),
    };
    let set = build_set(&remote, src)?;
    if set.is_empty() {
        warn!("target list is empty, nothing will match");
    }
    Ok(set)
}

/// Reload the set into `targets`. On any failure the current set stays in place.
pub async fn refresh(http: &Client, src: &TargetSource, targets: &Targets) -> Result<usize> {
    let set = load(http, src).await?;
    let n = set.len();
    targets.replace(set);
    Ok(n)
}

pub fn spawn_refresh(http: Client, src: TargetSource, targets: Targets, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match refresh(&http, &src, &targets).await {
                Ok(n) => info!(patterns = n, "target list refreshed"),
                Err(e) => warn!(error = %format!("{:#}", e), "target refresh failed, keeping previous list"),
            }
        }
    })
}
