use certhunter_core::Port;
use serde::{Deserialize, Serialize};

/// A ledger row joined with its port history, as listed by `Db::list_subdomains`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdomainRecord {
    pub subdomain: String,
    pub domain: String,
    pub takeover: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerCounts {
    pub domains: i64,
    pub subdomains: i64,
    pub ports: i64,
}
