//! TCP connect scan with timeouts, per-host concurrency and passive banner capture.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use certhunter_core::{PortFinding, PortScanner, ProbeError};
use rand::{thread_rng, Rng};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Parse a comma-separated list of ports/ranges (e.g., "22,80,443", "1-1024,8080").
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            ports.push(p);
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

const CURATED: &[(u16, &str)] = &[
    (80, "http"), (443, "https"), (22, "ssh"), (21, "ftp"), (25, "smtp"), (8080, "http-proxy"), (8443, "https-alt"),
    (3306, "mysql"), (5432, "postgresql"), (6379, "redis"), (9200, "elasticsearch"), (27017, "mongodb"),
    (23, "telnet"), (53, "domain"), (110, "pop3"), (143, "imap"), (445, "microsoft-ds"), (465, "smtps"),
    (587, "submission"), (993, "imaps"), (995, "pop3s"), (1433, "ms-sql-s"), (1521, "oracle"), (2375, "docker"),
    (2376, "docker-tls"), (3000, "http-alt"), (3389, "ms-wbt-server"), (5000, "http-alt"), (5601, "kibana"),
    (5900, "vnc"), (5985, "wsman"), (6443, "kubernetes-api"), (7001, "weblogic"), (8000, "http-alt"),
    (8081, "http-alt"), (8088, "http-alt"), (8200, "vault"), (8500, "consul"), (8888, "http-alt"),
    (9000, "http-alt"), (9090, "http-alt"), (9092, "kafka"), (9300, "elasticsearch-transport"),
    (9443, "https-alt"), (10000, "webmin"), (10250, "kubelet"), (11211, "memcached"), (15672, "rabbitmq-mgmt"),
];

/// Return the first N ports from a curated list of commonly exposed ports.
pub fn top_ports(n: usize) -> Vec<u16> {
    CURATED.iter().take(n).map(|(p, _)| *p).collect()
}

/// Default commonly-used ports if none are specified.
pub fn default_top_ports() -> Vec<u16> {
    top_ports(CURATED.len())
}

/// Well-known service name for a port, or "unknown".
pub fn service_name(port: u16) -> &'static str {
    CURATED.iter().find(|(p, _)| *p == port).map(|(_, s)| *s).unwrap_or("unknown")
}

/// Product and version from a passive banner. Only SSH identification strings are
/// trusted; other banners often embed timestamps or hostnames.
pub fn parse_banner(banner: &str) -> Option<(String, String)> {
    let line = banner.lines().next()?.trim();
    let rest = line.strip_prefix("SSH-")?;
    let (_proto, software) = rest.split_once('-')?;
    let software = software.split_whitespace().next()?;
    Some(match software.split_once('_') {
        Some((product, version)) => (product.to_string(), version.to_string()),
        None => (software.to_string(), String::new()),
    })
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    pub timeout_per_port: Duration,
    pub per_host_concurrency: usize,
    pub retries: u32,
    pub retry_delay: Duration,
    pub banner_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            ports: default_top_ports(),
            timeout_per_port: Duration::from_millis(800),
            per_host_concurrency: 32,
            retries: 1,
            retry_delay: Duration::from_millis(50),
            banner_timeout: Duration::from_millis(700),
        }
    }
}

/// `PortScanner` backed by plain TCP connects.
#[derive(Debug, Clone, Default)]
pub struct ConnectScanner {
    opts: ScanOptions,
}

impl ConnectScanner {
    pub fn new(opts: ScanOptions) -> Self {
        ConnectScanner { opts }
    }
}

async fn resolve_v4(host: &str) -> Result<IpAddr> {
    let addrs = tokio::net::lookup_host((host, 0u16)).await?;
    let mut first = None;
    for sa in addrs {
        if sa.is_ipv4() {
            return Ok(sa.ip());
        }
        first.get_or_insert(sa.ip());
    }
    first.ok_or_else(|| anyhow!("{} has no addresses", host))
}

async fn probe_port(ip: IpAddr, port: u16, opts: &ScanOptions) -> Option<PortFinding> {
    let addr = SocketAddr::new(ip, port);
    let mut attempts = 0;
    let mut stream = None;
    while attempts <= opts.retries {
        if let Ok(Ok(s)) = timeout(opts.timeout_per_port, TcpStream::connect(addr)).await {
            stream = Some(s);
            break;
        }
        attempts += 1;
        if attempts <= opts.retries {
            let base = opts.retry_delay.as_millis() as u64;
            let exp = base.saturating_mul(1u64 << (attempts.min(6))); // cap growth
            let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
            tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
        }
    }
    let mut stream = stream?;
    let mut finding = PortFinding { number: port, protocol: "tcp".into(), service: service_name(port).into(), ..Default::default() };
    let mut buf = [0u8; 256];
    if let Ok(Ok(n)) = timeout(opts.banner_timeout, stream.read(&mut buf)).await {
        let banner = String::from_utf8_lossy(&buf[..n]);
        if let Some((product, version)) = parse_banner(&banner) {
            finding.service = "ssh".into();
            finding.product = product;
            finding.version = version;
        }
    }
    Some(finding)
}

#[async_trait]
impl PortScanner for ConnectScanner {
    async fn scan(&self, host: &str, cancel: &CancellationToken) -> Result<Vec<PortFinding>, ProbeError> {
        let ip = resolve_v4(host).await?;
        let host_sem = Arc::new(Semaphore::new(self.opts.per_host_concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<PortFinding>(self.opts.ports.len().max(1));
        let opts = Arc::new(self.opts.clone());

        for &port in &self.opts.ports {
            let tx = tx.clone();
            let host_sem = host_sem.clone();
            let opts = opts.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let Ok(_permit) = host_sem.acquire_owned().await else { return };
                let found = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    f = probe_port(ip, port, &opts) => f,
                };
                if let Some(f) = found {
                    let _ = tx.send(f).await;
                }
            });
        }
        drop(tx);

        let mut open = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                f = rx.recv() => match f {
                    Some(f) => open.push(f),
                    None => break,
                },
            }
        }
        open.sort_by_key(|f| f.number);
        debug!(host, %ip, open = open.len(), "port scan finished");
        Ok(open)
    }
}
