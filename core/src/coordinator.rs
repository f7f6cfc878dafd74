//! Per-candidate unit of work: existence verdict, probe fan-out/join, persistence
//! and the notification policy.

use crate::join::join2;
use crate::ledger::{Ledger, LedgerError};
use crate::model::{base_domain, Port, Subdomain};
use crate::notify::{Notification, Notifier};
use crate::probe::{PortFinding, PortScanner, TakeoverChecker};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as NameLock, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    New,
    Existing,
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("cannot derive a base domain for {0:?}")]
    NoBaseDomain(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("unit cancelled")]
    Cancelled,
}

/// What one unit of work did.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub verdict: Verdict,
    pub subdomain: Subdomain,
    pub fresh_ports: Vec<u16>,
    pub notified: usize,
    pub notify_failures: usize,
    pub probe_errors: Vec<String>,
}

pub struct ScanCoordinator {
    ledger: Arc<dyn Ledger>,
    scanner: Arc<dyn PortScanner>,
    takeover: Arc<dyn TakeoverChecker>,
    notifier: Arc<dyn Notifier>,
    probe_timeout: Duration,
    names: Arc<Mutex<HashMap<String, Arc<NameLock<()>>>>>,
}

/// Exclusive claim on one subdomain name for the length of a unit.
struct NameClaim {
    names: Arc<Mutex<HashMap<String, Arc<NameLock<()>>>>>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.names.lock();
        if map.get(&self.name).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            map.remove(&self.name);
        }
    }
}

fn to_ports(subdomain: &str, findings: Vec<PortFinding>) -> Vec<Port> {
    let mut seen = HashSet::new();
    let mut ports = Vec::with_capacity(findings.len());
    for f in findings {
        if !seen.insert((f.number, f.protocol.clone(), f.service.clone(), f.product.clone(), f.version.clone())) {
            continue;
        }
        ports.push(Port {
            number: f.number,
            subdomain: subdomain.to_string(),
            protocol: f.protocol,
            service: f.service,
            product: f.product,
            version: f.version,
            screenshot: None,
        });
    }
    ports
}

impl ScanCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        scanner: Arc<dyn PortScanner>,
        takeover: Arc<dyn TakeoverChecker>,
        notifier: Arc<dyn Notifier>,
        probe_timeout: Duration,
    ) -> Self {
        ScanCoordinator { ledger, scanner, takeover, notifier, probe_timeout, names: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Evaluate one matched, resolvable name. Ledger failures abort the unit;
    /// probe and notification failures are logged and reported in the outcome.
    ///
    /// Units for the same name run one after another, so a second sighting that
    /// arrives mid-scan sees the first one's ledger writes.
    pub async fn run(&self, name: &str, cancel: &CancellationToken) -> Result<Outcome, UnitError> {
        if cancel.is_cancelled() {
            return Err(UnitError::Cancelled);
        }
        let lock = self.names.lock().entry(name.to_string()).or_insert_with(|| Arc::new(NameLock::new(()))).clone();
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            g = lock.clone().lock_owned() => Some(g),
        };
        drop(lock);
        let claim = NameClaim { names: self.names.clone(), name: name.to_string(), guard };
        if claim.guard.is_none() {
            return Err(UnitError::Cancelled);
        }
        let outcome = self.run_claimed(name, cancel).await;
        drop(claim);
        outcome
    }

    #[cfg(test)]
    fn claimed_names(&self) -> usize {
        self.names.lock().len()
    }

    async fn run_claimed(&self, name: &str, cancel: &CancellationToken) -> Result<Outcome, UnitError> {
        let domain = base_domain(name).ok_or_else(|| UnitError::NoBaseDomain(name.to_string()))?;
        self.ledger.ensure_domain(&domain).await?;
        let verdict = if self.ledger.subdomain_exists(name, &domain).await? { Verdict::Existing } else { Verdict::New };
        let previous = match verdict {
            Verdict::Existing => self.ledger.takeover_label(name).await?.unwrap_or_default(),
            Verdict::New => String::new(),
        };

        let (scanner, takeover) = (self.scanner.clone(), self.takeover.clone());
        let (host_a, host_b) = (name.to_string(), name.to_string());
        let (cancel_a, cancel_b) = (cancel.clone(), cancel.clone());
        let joined = join2(
            self.probe_timeout,
            cancel,
            async move { scanner.scan(&host_a, &cancel_a).await },
            async move { takeover.check(&host_b, &cancel_b).await },
        )
        .await;
        // A shutdown mid-scan leaves the name unrecorded so the next sighting is still new.
        if cancel.is_cancelled() {
            return Err(UnitError::Cancelled);
        }

        let mut probe_errors = Vec::new();
        let mut subdomain = Subdomain::new(name, domain.as_str());
        match joined.first {
            Ok(findings) => subdomain.ports = to_ports(name, findings),
            Err(e) => {
                warn!(name, error = %e, "port scan failed");
                probe_errors.push(format!("port scan: {}", e));
            }
        }
        match joined.second {
            Ok(label) => subdomain.takeover = label.map(|s| s.to_lowercase()).unwrap_or_default(),
            Err(e) => {
                warn!(name, error = %e, "takeover check failed");
                probe_errors.push(format!("takeover: {}", e));
                subdomain.takeover = previous.clone();
            }
        }

        self.ledger.record_subdomain(&subdomain).await?;
        let mut fresh = Vec::new();
        for port in &subdomain.ports {
            if !self.ledger.port_seen(port).await? {
                self.ledger.record_port(port).await?;
                fresh.push(port.clone());
            }
        }

        let mut notifications = Vec::new();
        match verdict {
            Verdict::New => {
                info!(name, domain = %domain, ports = subdomain.ports.len(), takeover = %subdomain.takeover, "new subdomain");
                notifications.push(Notification::NewSubdomain(subdomain.clone()));
            }
            Verdict::Existing => {
                notifications.extend(fresh.iter().cloned().map(Notification::OpenPort));
                if previous.is_empty() && subdomain.is_vulnerable() {
                    notifications.push(Notification::Takeover { subdomain: name.to_string(), service: subdomain.takeover.clone() });
                }
            }
        }

        let (mut notified, mut notify_failures) = (0, 0);
        for n in &notifications {
            match self.notifier.notify(n).await {
                Ok(()) => notified += 1,
                Err(e) => {
                    warn!(name, error = %e, "notification failed");
                    notify_failures += 1;
                }
            }
        }

        Ok(Outcome {
            verdict,
            fresh_ports: fresh.iter().map(|p| p.number).collect(),
            subdomain,
            notified,
            notify_failures,
            probe_errors,
        })
    }
}
