//! Asset ledger contract: the single source of truth for "seen before".
//!
//! Every operation is idempotent and safe to call concurrently for the same or
//! different keys.

use crate::model::{Port, Subdomain};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend failure: {0}")]
    Backend(String),
    #[error("subdomain {subdomain:?} references unknown domain {domain:?}")]
    UnknownDomain { subdomain: String, domain: String },
    #[error("port {port} references unknown subdomain {subdomain:?}")]
    UnknownSubdomain { subdomain: String, port: u16 },
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert the domain if absent.
    async fn ensure_domain(&self, name: &str) -> Result<(), LedgerError>;
    /// Side-effect free existence probe.
    async fn subdomain_exists(&self, name: &str, domain: &str) -> Result<bool, LedgerError>;
    /// Current takeover label of a known subdomain.
    async fn takeover_label(&self, name: &str) -> Result<Option<String>, LedgerError>;
    /// Insert a new subdomain, or update the mutable fields of a known one.
    async fn record_subdomain(&self, subdomain: &Subdomain) -> Result<(), LedgerError>;
    /// Append a port row; a duplicate tuple is ignored.
    async fn record_port(&self, port: &Port) -> Result<(), LedgerError>;
    /// Whether this exact port tuple was recorded before.
    async fn port_seen(&self, port: &Port) -> Result<bool, LedgerError>;
}

type PortKey = (u16, String, String, String, String, String);

fn owned_key(p: &Port) -> PortKey {
    (p.number, p.subdomain.clone(), p.protocol.clone(), p.service.clone(), p.product.clone(), p.version.clone())
}

#[derive(Default)]
struct MemoryState {
    domains: HashSet<String>,
    // subdomain -> (domain, takeover)
    subdomains: HashMap<String, (String, String)>,
    ports: Vec<Port>,
    port_keys: HashSet<PortKey>,
}

/// Process-local ledger; nothing survives a restart.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain_count(&self) -> usize {
        self.state.lock().domains.len()
    }

    pub fn subdomain_count(&self) -> usize {
        self.state.lock().subdomains.len()
    }

    pub fn ports_for(&self, subdomain: &str) -> Vec<Port> {
        self.state.lock().ports.iter().filter(|p| p.subdomain == subdomain).cloned().collect()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn ensure_domain(&self, name: &str) -> Result<(), LedgerError> {
        self.state.lock().domains.insert(name.to_string());
        Ok(())
    }

    async fn subdomain_exists(&self, name: &str, domain: &str) -> Result<bool, LedgerError> {
        let st = self.state.lock();
        Ok(st.subdomains.get(name).map(|(d, _)| d == domain).unwrap_or(false))
    }

    async fn takeover_label(&self, name: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.state.lock().subdomains.get(name).map(|(_, t)| t.clone()))
    }

    async fn record_subdomain(&self, subdomain: &Subdomain) -> Result<(), LedgerError> {
        let mut st = self.state.lock();
        if !st.domains.contains(&subdomain.domain) {
            return Err(LedgerError::UnknownDomain { subdomain: subdomain.name.clone(), domain: subdomain.domain.clone() });
        }
        st.subdomains
            .entry(subdomain.name.clone())
            .and_modify(|(_, t)| *t = subdomain.takeover.clone())
            .or_insert_with(|| (subdomain.domain.clone(), subdomain.takeover.clone()));
        Ok(())
    }

    async fn record_port(&self, port: &Port) -> Result<(), LedgerError> {
        let mut st = self.state.lock();
        if !st.subdomains.contains_key(&port.subdomain) {
            return Err(LedgerError::UnknownSubdomain { subdomain: port.subdomain.clone(), port: port.number });
        }
        if st.port_keys.insert(owned_key(port)) {
            st.ports.push(port.clone());
        }
        Ok(())
    }

    async fn port_seen(&self, port: &Port) -> Result<bool, LedgerError> {
        Ok(self.state.lock().port_keys.contains(&owned_key(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(n: u16, version: &str) -> Port {
        Port { number: n, subdomain: "a.example.com".into(), protocol: "tcp".into(), service: "ssh".into(), product: "OpenSSH".into(), version: version.into(), screenshot: None }
    }

    #[tokio::test]
    async fn record_subdomain_twice_keeps_one_row() {
        let l = MemoryLedger::new();
        l.ensure_domain("example.com").await.unwrap();
        l.ensure_domain("example.com").await.unwrap();
        let mut s = Subdomain::new("a.example.com", "example.com");
        l.record_subdomain(&s).await.unwrap();
        s.takeover = "github".into();
        l.record_subdomain(&s).await.unwrap();
        assert_eq!(l.domain_count(), 1);
        assert_eq!(l.subdomain_count(), 1);
        assert_eq!(l.takeover_label("a.example.com").await.unwrap().as_deref(), Some("github"));
    }

    #[tokio::test]
    async fn existence_is_scoped_to_domain() {
        let l = MemoryLedger::new();
        l.ensure_domain("example.com").await.unwrap();
        l.record_subdomain(&Subdomain::new("a.example.com", "example.com")).await.unwrap();
        assert!(l.subdomain_exists("a.example.com", "example.com").await.unwrap());
        assert!(!l.subdomain_exists("a.example.com", "other.com").await.unwrap());
        assert!(!l.subdomain_exists("b.example.com", "example.com").await.unwrap());
    }

    #[tokio::test]
    async fn changed_version_is_a_new_port_row() {
        let l = MemoryLedger::new();
        l.ensure_domain("example.com").await.unwrap();
        l.record_subdomain(&Subdomain::new("a.example.com", "example.com")).await.unwrap();
        l.record_port(&port(22, "8.9")).await.unwrap();
        l.record_port(&port(22, "8.9")).await.unwrap();
        assert!(l.port_seen(&port(22, "8.9")).await.unwrap());
        assert!(!l.port_seen(&port(22, "9.6")).await.unwrap());
        l.record_port(&port(22, "9.6")).await.unwrap();
        assert_eq!(l.ports_for("a.example.com").len(), 2);
    }

    #[tokio::test]
    async fn orphan_rows_are_rejected() {
        let l = MemoryLedger::new();
        let err = l.record_subdomain(&Subdomain::new("a.example.com", "example.com")).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownDomain { .. }));
        let err = l.record_port(&port(80, "")).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownSubdomain { .. }));
    }
}
