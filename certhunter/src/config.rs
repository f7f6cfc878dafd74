use anyhow::{Context, Result};
use certhunter_core::AdmissionLimits;
use port_scan::ScanOptions;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BOUNTY_TARGETS_URL: &str = "https://raw.githubusercontent.com/arkadiyt/bounty-targets-data/master/data/wildcards.txt";
pub const DEFAULT_DB: &str = "certhunter.db";
pub const DEFAULT_TOKEN_ENV: &str = "SLACK_TOKEN";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct TargetsConfig {
    pub url: Option<String>,
    pub bounty_targets: Option<bool>,
    #[serde(default)]
    pub patterns: Vec<String>,
    pub excluded_sources: Option<Vec<String>>,
    pub refresh_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct StreamConfig {
    pub url: Option<String>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LedgerConfig {
    pub path: Option<PathBuf>,
    pub ephemeral: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct PipelineConfig {
    pub max_pending: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub per_target: Option<usize>,
    pub probe_timeout_secs: Option<u64>,
    pub dns_timeout_ms: Option<u64>,
    pub drain_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct PortScanConfig {
    pub ports: Option<String>,
    pub top: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct TakeoverConfig {
    pub fingerprints: Option<PathBuf>,
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct NotifyConfig {
    pub slack: Option<bool>,
    pub slack_token_env: Option<String>,
    pub slack_channels: Option<Vec<String>>,
    /// File for JSON lines output; `-` is stdout.
    pub jsonl: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub targets: Option<TargetsConfig>,
    pub stream: Option<StreamConfig>,
    pub ledger: Option<LedgerConfig>,
    pub pipeline: Option<PipelineConfig>,
    pub port_scan: Option<PortScanConfig>,
    pub takeover: Option<TakeoverConfig>,
    pub notify: Option<NotifyConfig>,
}

/// Load `path`, or `./certhunter.yaml` when present. A missing default file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("certhunter.yaml");
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(Some(cfg))
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub targets_url: Option<String>,
    pub targets: Vec<String>,
    pub no_bounty_targets: bool,
    pub db: Option<PathBuf>,
    pub ephemeral: bool,
    pub max_in_flight: Option<usize>,
    pub per_target: Option<usize>,
    pub fingerprints: Option<PathBuf>,
    pub jsonl: Option<PathBuf>,
    pub no_slack: bool,
}

/// Effective settings after merging flags, config and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Remote pattern list; `None` when only local patterns are used.
    pub targets_url: Option<String>,
    pub patterns: Vec<String>,
    pub excluded_sources: Vec<String>,
    pub refresh: Option<Duration>,
    pub stream_url: String,
    pub idle_timeout: Duration,
    /// `None` keeps the ledger in memory.
    pub db: Option<PathBuf>,
    pub limits: AdmissionLimits,
    pub probe_timeout: Duration,
    pub dns_timeout: Duration,
    pub drain_grace: Duration,
    pub scan: ScanOptions,
    pub fingerprints: Option<PathBuf>,
    pub takeover_timeout: Duration,
    pub slack: bool,
    pub slack_token_env: String,
    pub slack_channels: Vec<String>,
    pub jsonl: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(cfg: Option<&Config>, o: &Overrides) -> Result<Self> {
        let cfg = cfg.cloned().unwrap_or_default();
        let t = cfg.targets.unwrap_or_default();
        let st = cfg.stream.unwrap_or_default();
        let l = cfg.ledger.unwrap_or_default();
        let p = cfg.pipeline.unwrap_or_default();
        let ps = cfg.port_scan.unwrap_or_default();
        let tk = cfg.takeover.unwrap_or_default();
        let n = cfg.notify.unwrap_or_default();

        let bounty = !o.no_bounty_targets && t.bounty_targets.unwrap_or(true);
        let targets_url = o.targets_url.clone().or(t.url).or_else(|| bounty.then(|| BOUNTY_TARGETS_URL.to_string()));
        let mut patterns = t.patterns;
        patterns.extend(o.targets.iter().cloned());

        let ephemeral = o.ephemeral || l.ephemeral.unwrap_or(false);
        let db = if ephemeral { None } else { Some(o.db.clone().or(l.path).unwrap_or_else(|| PathBuf::from(DEFAULT_DB))) };

        let defaults = AdmissionLimits::default();
        let limits = AdmissionLimits {
            max_pending: p.max_pending.unwrap_or(defaults.max_pending),
            max_in_flight: o.max_in_flight.or(p.max_in_flight).unwrap_or(defaults.max_in_flight),
            per_target: o.per_target.or(p.per_target).unwrap_or(defaults.per_target),
        };

        let mut scan = ScanOptions::default();
        if let Some(spec) = ps.ports.as_deref() {
            scan.ports = port_scan::parse_ports(spec).context("invalid port_scan.ports")?;
        } else if let Some(n) = ps.top {
            scan.ports = port_scan::top_ports(n);
        }
        if let Some(ms) = ps.timeout_ms { scan.timeout_per_port = Duration::from_millis(ms); }
        if let Some(c) = ps.concurrency { scan.per_host_concurrency = c.max(1); }
        if let Some(r) = ps.retries { scan.retries = r; }
        if let Some(ms) = ps.retry_delay_ms { scan.retry_delay = Duration::from_millis(ms); }

        Ok(Settings {
            targets_url,
            patterns,
            excluded_sources: t.excluded_sources.unwrap_or_else(|| vec!["zendesk".to_string()]),
            refresh: match t.refresh_secs.unwrap_or(6 * 3600) {
                0 => None,
                s => Some(Duration::from_secs(s)),
            },
            stream_url: st.url.unwrap_or_else(|| certstream::DEFAULT_URL.to_string()),
            idle_timeout: Duration::from_secs(st.idle_timeout_secs.unwrap_or(120)),
            db,
            limits,
            probe_timeout: Duration::from_secs(p.probe_timeout_secs.unwrap_or(300)),
            dns_timeout: Duration::from_millis(p.dns_timeout_ms.unwrap_or(3000)),
            drain_grace: Duration::from_secs(p.drain_grace_secs.unwrap_or(10)),
            scan,
            fingerprints: o.fingerprints.clone().or(tk.fingerprints),
            takeover_timeout: Duration::from_secs(tk.http_timeout_secs.unwrap_or(10)),
            slack: !o.no_slack && n.slack.unwrap_or(true),
            slack_token_env: n.slack_token_env.unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_string()),
            slack_channels: n.slack_channels.unwrap_or_default(),
            jsonl: o.jsonl.clone().or(n.jsonl),
        })
    }
}
