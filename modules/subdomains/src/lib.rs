//! One-shot subdomain enumeration from crt.sh certificate search.

use anyhow::{Context, Result};
use certhunter_core::{dedupe, Resolver};
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

pub const CRTSH_URL: &str = "https://crt.sh";
const RESOLVE_CONCURRENCY: usize = 32;

/// Row of the crt.sh JSON output. Only the fields used here are decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct CrtshCert {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub name_value: String,
}

/// Unique names carried by `certs`, in first-seen order. Wildcard entries are skipped.
pub fn names(certs: &[CrtshCert]) -> Vec<String> {
    let split = certs.iter().flat_map(|c| c.name_value.split('\n')).map(str::trim).filter(|n| !n.is_empty() && !n.starts_with('*'));
    dedupe(split)
}

/// Keep only names that resolve, preserving order.
pub async fn resolvable(names: Vec<String>, resolver: &dyn Resolver) -> Vec<String> {
    stream::iter(names)
        .map(|n| async move {
            let live = resolver.resolves(&n).await;
            (n, live)
        })
        .buffered(RESOLVE_CONCURRENCY)
        .filter_map(|(n, live)| async move { live.then_some(n) })
        .collect()
        .await
}

pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Client {
    pub fn new() -> Result<Self> {
        Self::with_base_url(CRTSH_URL)
    }

    pub fn with_base_url(base: &str) -> Result<Self> {
        let http = HttpClient::builder().timeout(Duration::from_secs(120)).build().context("failed to build http client")?;
        Ok(Client { http, base_url: base.trim_end_matches('/').to_string() })
    }

    pub async fn certificates(&self, domain: &str) -> Result<Vec<CrtshCert>> {
        info!(domain, "pulling certificate logs");
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[("q", domain), ("output", "json")])
            .send()
            .await
            .with_context(|| format!("crt.sh request for {} failed", domain))?
            .error_for_status()
            .with_context(|| format!("crt.sh rejected query for {}", domain))?;
        let body = resp.text().await.context("failed to read crt.sh body")?;
        serde_json::from_str(&body).with_context(|| format!("failed parsing crt.sh JSON for {}", domain))
    }

    /// Resolvable subdomains per domain. Any failed query fails the whole call.
    pub async fn enumerate(&self, domains: &[String], resolver: &dyn Resolver) -> Result<BTreeMap<String, Vec<String>>> {
        let per_domain = try_join_all(domains.iter().map(|d| async move {
            let certs = self.certificates(d).await?;
            let live = resolvable(names(&certs), resolver).await;
            info!(domain = %d, certificates = certs.len(), subdomains = live.len(), "enumerated");
            Ok::<_, anyhow::Error>((d.clone(), live))
        }))
        .await?;
        Ok(per_domain.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const BODY: &str = r#"[
        {"issuer_ca_id":16418,"issuer_name":"C=US, O=Let's Encrypt","common_name":"example.com","name_value":"example.com\nwww.example.com","id":1,"entry_timestamp":"2023-01-01T00:00:00","not_before":"2023-01-01T00:00:00","not_after":"2023-04-01T00:00:00"},
        {"common_name":"api.example.com","name_value":"api.example.com\n*.example.com\nwww.example.com","id":2},
        {"common_name":"gone.example.com","name_value":"gone.example.com","id":3}
    ]"#;

    struct OnlyLive(&'static [&'static str]);

    #[async_trait]
    impl Resolver for OnlyLive {
        async fn resolves(&self, name: &str) -> bool {
            self.0.contains(&name)
        }
    }

    #[test]
    fn splits_name_values_and_dedupes() {
        let certs: Vec<CrtshCert> = serde_json::from_str(BODY).unwrap();
        assert_eq!(certs.len(), 3);
        assert_eq!(names(&certs), vec!["example.com", "www.example.com", "api.example.com", "gone.example.com"]);
    }

    #[tokio::test]
    async fn drops_names_that_do_not_resolve() {
        let certs: Vec<CrtshCert> = serde_json::from_str(BODY).unwrap();
        let live = resolvable(names(&certs), &OnlyLive(&["www.example.com", "api.example.com"])).await;
        assert_eq!(live, vec!["www.example.com", "api.example.com"]);
    }

    #[test]
    fn empty_result_set_parses() {
        let certs: Vec<CrtshCert> = serde_json::from_str("[]").unwrap();
        assert!(names(&certs).is_empty());
    }
}
