//! Certificate stream consumption: decode, dedupe, match and hand off.

use crate::admission::Admission;
use crate::coordinator::{ScanCoordinator, UnitError};
use crate::liveness::Resolver;
use crate::matcher::Targets;
use crate::model::base_domain;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Raw item delivered by the stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Message(String),
    /// The transport lost its connection; it reconnects on its own.
    Disconnected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateEvent {
    Heartbeat,
    CertificateUpdate { all_domains: Vec<String> },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no {0}")]
    Missing(&'static str),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

#[derive(Deserialize)]
struct RawMessage {
    message_type: Option<String>,
    data: Option<RawData>,
}

#[derive(Deserialize)]
struct RawData {
    leaf_cert: Option<RawLeaf>,
}

#[derive(Deserialize)]
struct RawLeaf {
    all_domains: Option<Vec<String>>,
}

impl CertificateEvent {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let msg: RawMessage = serde_json::from_str(raw)?;
        match msg.message_type.as_deref() {
            Some("heartbeat") => Ok(CertificateEvent::Heartbeat),
            Some("certificate_update") => {
                let all_domains = msg
                    .data
                    .and_then(|d| d.leaf_cert)
                    .and_then(|l| l.all_domains)
                    .ok_or(DecodeError::Missing("data.leaf_cert.all_domains"))?;
                Ok(CertificateEvent::CertificateUpdate { all_domains })
            }
            Some(other) => Err(DecodeError::UnknownType(other.to_string())),
            None => Err(DecodeError::Missing("message_type")),
        }
    }
}

/// Drop repeated names, keeping the first occurrence. Comparison is exact and case-sensitive.
pub fn dedupe<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let name = name.into();
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    heartbeats: AtomicU64,
    malformed: AtomicU64,
    matched: AtomicU64,
    rejected: AtomicU64,
    unresolved: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub messages: u64,
    pub heartbeats: u64,
    pub malformed: u64,
    pub matched: u64,
    pub rejected: u64,
    pub unresolved: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Single logical consumer of the certificate feed. Matching runs inline; everything
/// that does I/O runs as an admitted unit of work.
pub struct StreamProcessor {
    targets: Targets,
    resolver: Arc<dyn Resolver>,
    coordinator: Arc<ScanCoordinator>,
    admission: Admission,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl StreamProcessor {
    pub fn new(targets: Targets, resolver: Arc<dyn Resolver>, coordinator: Arc<ScanCoordinator>, admission: Admission, cancel: CancellationToken) -> Self {
        StreamProcessor { targets, resolver, coordinator, admission, cancel, counters: Arc::new(Counters::default()) }
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.counters;
        StreamStats {
            messages: c.messages.load(Ordering::Relaxed),
            heartbeats: c.heartbeats.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            unresolved: c.unresolved.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Consume the feed until it closes or the processor is cancelled.
    pub async fn run(&self, mut feed: mpsc::Receiver<FeedItem>) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = feed.recv() => item,
            };
            match item {
                Some(FeedItem::Message(raw)) => {
                    self.handle_message(&raw);
                }
                Some(FeedItem::Disconnected(reason)) => warn!(%reason, "certificate stream disconnected"),
                None => {
                    info!("certificate feed closed");
                    break;
                }
            }
        }
    }

    /// Decode one raw message and submit its matched names. Malformed messages are skipped.
    pub fn handle_message(&self, raw: &str) -> usize {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        match CertificateEvent::decode(raw) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "skipping malformed stream message");
                0
            }
        }
    }

    pub fn handle_event(&self, event: CertificateEvent) -> usize {
        let names = match event {
            CertificateEvent::Heartbeat => {
                self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            CertificateEvent::CertificateUpdate { all_domains } => all_domains,
        };
        let matched = self.matched_candidates(names);
        let mut submitted = 0;
        for name in matched {
            if self.submit(name) {
                submitted += 1;
            }
        }
        submitted
    }

    /// Dedupe, then keep the names matching at least one target pattern.
    pub fn matched_candidates(&self, names: Vec<String>) -> Vec<String> {
        let targets = self.targets.snapshot();
        dedupe(names).into_iter().filter(|n| targets.matches(n)).collect()
    }

    fn submit(&self, name: String) -> bool {
        self.counters.matched.fetch_add(1, Ordering::Relaxed);
        debug!(name = %name, "candidate matched");
        let target = base_domain(&name).unwrap_or_else(|| name.to_ascii_lowercase());
        let resolver = self.resolver.clone();
        let coordinator = self.coordinator.clone();
        let cancel = self.cancel.clone();
        let counters = self.counters.clone();
        let accepted = self.admission.submit(&target, async move {
            if !resolver.resolves(&name).await {
                counters.unresolved.fetch_add(1, Ordering::Relaxed);
                debug!(name = %name, "candidate does not resolve, discarded");
                return;
            }
            match coordinator.run(&name, &cancel).await {
                Ok(outcome) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(name = %name, verdict = ?outcome.verdict, fresh_ports = ?outcome.fresh_ports, "unit finished");
                }
                Err(UnitError::Cancelled) => debug!(name = %name, "unit cancelled"),
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(name = %name, error = %e, "unit of work aborted");
                }
            }
        });
        if !accepted {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_seen_order() {
        assert_eq!(dedupe(["a", "a", "b"]), vec!["a", "b"]);
        assert_eq!(dedupe(["b", "a", "b", "c", "a"]), vec!["b", "a", "c"]);
    }

    #[test]
    fn dedupe_is_idempotent_and_case_sensitive() {
        let once = dedupe(["Foo.com", "foo.com", "Foo.com"]);
        assert_eq!(once, vec!["Foo.com", "foo.com"]);
        assert_eq!(dedupe(once.clone()), once);
    }

    #[test]
    fn decode_heartbeat() {
        let ev = CertificateEvent::decode(r#"{"message_type":"heartbeat","timestamp":1700000000.0}"#).unwrap();
        assert_eq!(ev, CertificateEvent::Heartbeat);
    }

    #[test]
    fn decode_certificate_update() {
        let raw = r#"{"message_type":"certificate_update","data":{"update_type":"X509LogEntry","leaf_cert":{"subject":{"CN":"a.example.com"},"all_domains":["a.example.com","b.example.com"]},"seen":1.0}}"#;
        let ev = CertificateEvent::decode(raw).unwrap();
        assert_eq!(ev, CertificateEvent::CertificateUpdate { all_domains: vec!["a.example.com".into(), "b.example.com".into()] });
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(matches!(CertificateEvent::decode("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(CertificateEvent::decode(r#"{"data":{}}"#), Err(DecodeError::Missing("message_type"))));
        assert!(matches!(CertificateEvent::decode(r#"{"message_type":"certificate_update","data":{}}"#), Err(DecodeError::Missing(_))));
        assert!(matches!(CertificateEvent::decode(r#"{"message_type":"dns_entries"}"#), Err(DecodeError::UnknownType(_))));
    }
}
