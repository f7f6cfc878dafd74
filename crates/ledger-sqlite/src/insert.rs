use crate::{now_ms, Db};
use anyhow::Result;
use certhunter_core::{Port, Subdomain};
use rusqlite::params;

impl Db {
    pub fn ensure_domain(&self, domain: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO domains(domain, first_seen_ms) VALUES (?,?)",
            params![domain, now_ms()],
        )?;
        Ok(())
    }

    /// New rows keep `first_seen_ms`; a rescan refreshes the takeover label and `last_seen_ms`.
    pub fn upsert_subdomain(&self, sub: &Subdomain) -> Result<()> {
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO subdomains(subdomain,domain,takeover,first_seen_ms,last_seen_ms) VALUES (?,?,?,?,?)
             ON CONFLICT(subdomain) DO UPDATE SET takeover=excluded.takeover, last_seen_ms=excluded.last_seen_ms",
            params![sub.name, sub.domain, sub.takeover, now, now],
        )?;
        Ok(())
    }

    pub fn add_port(&self, port: &Port) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO ports(port,subdomain,protocol,service,product,version,screenshot,first_seen_ms) VALUES (?,?,?,?,?,?,?,?)",
            params![port.number as i64, port.subdomain, port.protocol, port.service, port.product, port.version, port.screenshot, now_ms()],
        )?;
        Ok(())
    }
}
