use crate::{Db, LedgerCounts, SubdomainRecord};
use anyhow::Result;
use certhunter_core::Port;
use rusqlite::{params, OptionalExtension};

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    pub fn subdomain_exists(&self, subdomain: &str, domain: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM subdomains WHERE subdomain=? AND domain=? LIMIT 1",
                params![subdomain, domain],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn takeover_label(&self, subdomain: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT takeover FROM subdomains WHERE subdomain=?", [subdomain], |r| r.get(0))
            .optional()?)
    }

    pub fn port_exists(&self, port: &Port) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM ports WHERE port=? AND subdomain=? AND protocol=? AND service=? AND product=? AND version=? LIMIT 1",
                params![port.number as i64, port.subdomain, port.protocol, port.service, port.product, port.version],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn ports_for(&self, subdomain: &str) -> Result<Vec<Port>> {
        let mut stmt = self.conn.prepare(
            "SELECT port,subdomain,protocol,service,product,version,screenshot FROM ports WHERE subdomain=? ORDER BY port, id",
        )?;
        let rows = stmt.query_map([subdomain], |r| {
            Ok(Port {
                number: r.get::<_, i64>(0)? as u16,
                subdomain: r.get(1)?,
                protocol: r.get(2)?,
                service: r.get(3)?,
                product: r.get(4)?,
                version: r.get(5)?,
                screenshot: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Known subdomains, optionally limited to one base domain, oldest first.
    pub fn list_subdomains(&self, domain: Option<&str>) -> Result<Vec<SubdomainRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT subdomain,domain,takeover,first_seen_ms,last_seen_ms FROM subdomains
             WHERE (?1 IS NULL OR domain = ?1) ORDER BY first_seen_ms, subdomain",
        )?;
        let rows = stmt.query_map([domain], |r| {
            Ok(SubdomainRecord {
                subdomain: r.get(0)?,
                domain: r.get(1)?,
                takeover: r.get(2)?,
                first_seen_ms: r.get(3)?,
                last_seen_ms: r.get(4)?,
                ports: Vec::new(),
            })
        })?;
        let mut out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        for rec in &mut out {
            rec.ports = self.ports_for(&rec.subdomain)?;
        }
        Ok(out)
    }

    pub fn counts(&self) -> Result<LedgerCounts> {
        Ok(self.conn.query_row(
            "SELECT (SELECT COUNT(1) FROM domains), (SELECT COUNT(1) FROM subdomains), (SELECT COUNT(1) FROM ports)",
            [],
            |r| Ok(LedgerCounts { domains: r.get(0)?, subdomains: r.get(1)?, ports: r.get(2)? }),
        )?)
    }
}
