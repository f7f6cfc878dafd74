use crate::Db;
use anyhow::Result;
use async_trait::async_trait;
use certhunter_core::{Ledger, LedgerError, Port, Subdomain};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Async `Ledger` over one SQLite connection. Calls are serialized on the
/// connection and run on the blocking pool.
#[derive(Clone)]
pub struct SqliteLedger {
    db: Arc<Mutex<Db>>,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(SqliteLedger { db: Arc::new(Mutex::new(Db::open_or_create(path)?)) })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteLedger { db: Arc::new(Mutex::new(Db::open_in_memory()?)) })
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            f(&guard)
        })
        .await
        .map_err(|e| LedgerError::Backend(format!("ledger task failed: {}", e)))?
        .map_err(|e| LedgerError::Backend(format!("{:#}", e)))
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn ensure_domain(&self, name: &str) -> Result<(), LedgerError> {
        let name = name.to_string();
        self.with_db(move |db| db.ensure_domain(&name)).await
    }

    async fn subdomain_exists(&self, name: &str, domain: &str) -> Result<bool, LedgerError> {
        let (name, domain) = (name.to_string(), domain.to_string());
        self.with_db(move |db| db.subdomain_exists(&name, &domain)).await
    }

    async fn takeover_label(&self, name: &str) -> Result<Option<String>, LedgerError> {
        let name = name.to_string();
        self.with_db(move |db| db.takeover_label(&name)).await
    }

    async fn record_subdomain(&self, subdomain: &Subdomain) -> Result<(), LedgerError> {
        let sub = subdomain.clone();
        self.with_db(move |db| db.upsert_subdomain(&sub)).await
    }

    async fn record_port(&self, port: &Port) -> Result<(), LedgerError> {
        let port = port.clone();
        self.with_db(move |db| db.add_port(&port)).await
    }

    async fn port_seen(&self, port: &Port) -> Result<bool, LedgerError> {
        let port = port.clone();
        self.with_db(move |db| db.port_exists(&port)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerCounts;

    fn port(n: u16, service: &str, version: &str) -> Port {
        Port { number: n, subdomain: "api.example.com".into(), protocol: "tcp".into(), service: service.into(), version: version.into(), ..Default::default() }
    }

    async fn seeded() -> SqliteLedger {
        let l = SqliteLedger::in_memory().unwrap();
        l.ensure_domain("example.com").await.unwrap();
        l.record_subdomain(&Subdomain::new("api.example.com", "example.com")).await.unwrap();
        l
    }

    #[tokio::test]
    async fn schema_is_created() {
        let l = SqliteLedger::in_memory().unwrap();
        for t in ["domains", "subdomains", "ports"] {
            let t = t.to_string();
            assert!(l.with_db(move |db| db.table_exists(&t)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn record_subdomain_twice_is_one_row() {
        let l = seeded().await;
        l.ensure_domain("example.com").await.unwrap();
        let mut s = Subdomain::new("api.example.com", "example.com");
        s.takeover = "github".into();
        l.record_subdomain(&s).await.unwrap();
        let counts = l.with_db(|db| db.counts()).await.unwrap();
        assert_eq!(counts, LedgerCounts { domains: 1, subdomains: 1, ports: 0 });
        assert_eq!(l.takeover_label("api.example.com").await.unwrap().as_deref(), Some("github"));
        assert!(l.subdomain_exists("api.example.com", "example.com").await.unwrap());
        assert!(!l.subdomain_exists("www.example.com", "example.com").await.unwrap());
    }

    #[tokio::test]
    async fn port_rows_are_append_only_per_tuple() {
        let l = seeded().await;
        assert!(!l.port_seen(&port(22, "ssh", "8.9")).await.unwrap());
        l.record_port(&port(22, "ssh", "8.9")).await.unwrap();
        l.record_port(&port(22, "ssh", "8.9")).await.unwrap();
        assert!(l.port_seen(&port(22, "ssh", "8.9")).await.unwrap());
        assert!(!l.port_seen(&port(22, "ssh", "9.6")).await.unwrap());
        l.record_port(&port(22, "ssh", "9.6")).await.unwrap();
        let ports = l.with_db(|db| db.ports_for("api.example.com")).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].version, "9.6");
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let l = SqliteLedger::in_memory().unwrap();
        let err = l.record_subdomain(&Subdomain::new("a.nowhere.com", "nowhere.com")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Backend(_)));
    }

    #[tokio::test]
    async fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let l = SqliteLedger::open(&path).unwrap();
            l.ensure_domain("example.com").await.unwrap();
            l.record_subdomain(&Subdomain::new("api.example.com", "example.com")).await.unwrap();
            l.record_port(&port(443, "https", "")).await.unwrap();
        }
        let l = SqliteLedger::open(&path).unwrap();
        assert!(l.subdomain_exists("api.example.com", "example.com").await.unwrap());
        let listed = l.with_db(|db| db.list_subdomains(Some("example.com"))).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ports[0].number, 443);
        assert!(l.with_db(|db| db.list_subdomains(Some("other.com"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_records_of_one_key_do_not_conflict() {
        let l = seeded().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let l = l.clone();
            handles.push(tokio::spawn(async move { l.record_port(&port(80, "http", "")).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(l.with_db(|db| db.counts()).await.unwrap().ports, 1);
    }
}
