//! Forward IPv4 liveness check for candidate names.

use async_trait::async_trait;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[async_trait]
pub trait Resolver: Send + Sync {
    /// True when `name` has at least one A record.
    async fn resolves(&self, name: &str) -> bool;
}

/// System-configured DNS resolver bounded by a per-lookup timeout.
pub struct DnsResolver {
    resolver: TokioResolver,
    timeout: Duration,
}

impl DnsResolver {
    pub fn from_system(lookup_timeout: Duration) -> anyhow::Result<Self> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| anyhow::anyhow!("failed to create resolver: {}", e))?
            .build();
        Ok(DnsResolver { resolver, timeout: lookup_timeout })
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolves(&self, name: &str) -> bool {
        match timeout(self.timeout, self.resolver.ipv4_lookup(name)).await {
            Ok(Ok(lookup)) => lookup.iter().next().is_some(),
            Ok(Err(e)) => {
                debug!(name, error = %e, "name does not resolve");
                false
            }
            Err(_) => {
                debug!(name, "resolution timed out");
                false
            }
        }
    }
}
