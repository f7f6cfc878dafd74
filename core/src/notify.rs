//! Notification payloads and the delivery contract.

use crate::model::{Port, Subdomain};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

impl From<anyhow::Error> for NotifyError {
    fn from(e: anyhow::Error) -> Self {
        NotifyError(format!("{:#}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Consolidated report for a subdomain seen for the first time.
    NewSubdomain(Subdomain),
    /// Port newly observed on a known subdomain.
    OpenPort(Port),
    /// Takeover newly detected on a known subdomain.
    Takeover { subdomain: String, service: String },
}

impl Notification {
    pub fn subject(&self) -> &str {
        match self {
            Notification::NewSubdomain(s) => &s.name,
            Notification::OpenPort(p) => &p.subdomain,
            Notification::Takeover { subdomain, .. } => subdomain,
        }
    }
}

fn port_line(p: &Port) -> String {
    format!("\tPort: {}/{} {} {} {}", p.number, p.protocol, p.service, p.product, p.version)
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::NewSubdomain(s) => {
                write!(f, "New subdomain found: {}", s.name)?;
                for p in &s.ports {
                    write!(f, "\n{}", port_line(p).trim_end())?;
                }
                if s.is_vulnerable() {
                    write!(f, "\nVulnerable to subdomain takeover: {}", s.takeover)?;
                }
                for shot in s.ports.iter().filter_map(|p| p.screenshot.as_deref()) {
                    write!(f, "\nScreenshot: {}", shot)?;
                }
                Ok(())
            }
            Notification::OpenPort(p) => {
                write!(f, "Newly opened port on host: {}\n{}", p.subdomain, port_line(p).trim_end())
            }
            Notification::Takeover { subdomain, service } => {
                write!(f, "New subdomain takeover on host: {}\n\tService: {}", subdomain, service)
            }
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}
