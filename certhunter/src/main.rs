use anyhow::{Context, Result};
use certhunter_core::{Admission, DnsResolver, Ledger, Notifier, Resolver, ScanCoordinator, StreamProcessor, Targets};
use clap::{Args, Parser, Subcommand};
use ledger_sqlite::{Db, SqliteLedger};
use notify::{FanoutNotifier, JsonlNotifier, SlackNotifier, SlackOptions};
use port_scan::ConnectScanner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use takeover::{CheckOptions, FingerprintChecker};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod targets;

use config::{Overrides, Settings};
use targets::TargetSource;

const STATS_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "certhunter", version, about = "Watch certificate transparency logs for new subdomains of bounty targets")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./certhunter.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging (otherwise RUST_LOG, default info)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct PipelineArgs {
    /// URL of a newline-delimited wildcard target list
    #[arg(long)]
    targets_url: Option<String>,
    /// Extra target pattern (repeatable), e.g. *.example.com
    #[arg(long = "target", value_name = "PATTERN")]
    targets: Vec<String>,
    /// Do not fetch the public bounty targets list
    #[arg(long)]
    no_bounty_targets: bool,
    /// SQLite ledger path
    #[arg(long, value_name = "FILE", conflicts_with = "ephemeral")]
    db: Option<PathBuf>,
    /// Keep the ledger in memory only
    #[arg(long)]
    ephemeral: bool,
    /// Units of work running at once
    #[arg(long)]
    max_in_flight: Option<usize>,
    /// Units of work running at once per registrable domain
    #[arg(long)]
    per_target: Option<usize>,
    /// Takeover fingerprints (subjack JSON)
    #[arg(long, value_name = "FILE")]
    fingerprints: Option<PathBuf>,
    /// Append notifications as JSON lines to FILE ("-" for stdout)
    #[arg(long, value_name = "FILE")]
    jsonl: Option<PathBuf>,
    /// Disable Slack delivery
    #[arg(long)]
    no_slack: bool,
}

impl PipelineArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            targets_url: self.targets_url.clone(),
            targets: self.targets.clone(),
            no_bounty_targets: self.no_bounty_targets,
            db: self.db.clone(),
            ephemeral: self.ephemeral,
            max_in_flight: self.max_in_flight,
            per_target: self.per_target,
            fingerprints: self.fingerprints.clone(),
            jsonl: self.jsonl.clone(),
            no_slack: self.no_slack,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Follow the certificate stream and scan new subdomains of targets
    Watch {
        #[command(flatten)]
        args: PipelineArgs,
    },
    /// Run one host through liveness, probes and the ledger, then print the outcome
    Scan {
        host: String,
        #[command(flatten)]
        args: PipelineArgs,
    },
    /// Enumerate existing subdomains from crt.sh (JSON lines)
    #[cfg(feature = "enumerate")]
    Enumerate {
        #[arg(required = true)]
        domains: Vec<String>,
        /// Also record the resolvable names in the ledger
        #[arg(long)]
        record: bool,
        #[arg(long, value_name = "FILE")]
        db: Option<PathBuf>,
    },
    /// Print known subdomains and their ports from the ledger (JSON lines)
    List {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, value_name = "FILE")]
        db: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug,hickory_proto=warn,hickory_resolver=warn,rustls=warn,hyper_util=warn,tungstenite=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).compact().init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let loaded_cfg = config::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Version => {
            println!("certhunter {} (core {})", env!("CARGO_PKG_VERSION"), certhunter_core::version());
        }
        Commands::Watch { args } => {
            let settings = Settings::resolve(loaded_cfg.as_ref(), &args.overrides())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(watch(settings))?;
        }
        Commands::Scan { host, args } => {
            let settings = Settings::resolve(loaded_cfg.as_ref(), &args.overrides())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(scan_one(settings, host))?;
        }
        #[cfg(feature = "enumerate")]
        Commands::Enumerate { domains, record, db } => {
            let overrides = Overrides { db, ..Overrides::default() };
            let settings = Settings::resolve(loaded_cfg.as_ref(), &overrides)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(enumerate(settings, domains, record))?;
        }
        Commands::List { domain, db } => {
            let overrides = Overrides { db, ..Overrides::default() };
            let settings = Settings::resolve(loaded_cfg.as_ref(), &overrides)?;
            let path = settings.db.unwrap_or_else(|| PathBuf::from(config::DEFAULT_DB));
            let db = Db::open_existing(&path)?;
            for rec in db.list_subdomains(domain.as_deref())? {
                println!("{}", serde_json::to_string(&rec)?);
            }
        }
    }
    Ok(())
}

fn open_ledger(settings: &Settings) -> Result<SqliteLedger> {
    match settings.db.as_deref() {
        Some(path) => {
            info!(path = %path.display(), "opening ledger");
            SqliteLedger::open(path)
        }
        None => {
            info!("using in-memory ledger");
            SqliteLedger::in_memory()
        }
    }
}

fn open_jsonl(path: &Path) -> Result<JsonlNotifier> {
    if path == Path::new("-") {
        Ok(JsonlNotifier::stdout())
    } else {
        JsonlNotifier::append(path)
    }
}

async fn build_notifier(settings: &Settings) -> Result<Arc<dyn Notifier>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = Vec::new();
    if settings.slack {
        let opts = SlackOptions { channels: settings.slack_channels.clone(), ..SlackOptions::default() };
        let slack = SlackNotifier::from_env(&settings.slack_token_env, opts)
            .await
            .context("slack notifier unavailable (use --no-slack to disable)")?;
        info!(channels = slack.channels().len(), "slack notifications enabled");
        sinks.push(Arc::new(slack));
    }
    if let Some(path) = settings.jsonl.as_deref() {
        sinks.push(Arc::new(open_jsonl(path)?));
    }
    if sinks.is_empty() {
        info!("no notifier configured, writing notifications to stdout");
        sinks.push(Arc::new(JsonlNotifier::stdout()));
    }
    if sinks.len() == 1 {
        return Ok(sinks.remove(0));
    }
    Ok(Arc::new(FanoutNotifier::new(sinks)))
}

async fn build_coordinator(settings: &Settings) -> Result<Arc<ScanCoordinator>> {
    let ledger: Arc<dyn Ledger> = Arc::new(open_ledger(settings)?);
    let fingerprints = match settings.fingerprints.as_deref() {
        Some(p) => takeover::load_fingerprints(p)?,
        None => takeover::default_fingerprints(),
    };
    let checker = FingerprintChecker::new(fingerprints, CheckOptions { http_timeout: settings.takeover_timeout, ..CheckOptions::default() })?;
    info!(fingerprints = checker.fingerprint_count(), ports = settings.scan.ports.len(), "probes ready");
    let scanner = ConnectScanner::new(settings.scan.clone());
    let notifier = build_notifier(settings).await?;
    Ok(Arc::new(ScanCoordinator::new(ledger, Arc::new(scanner), Arc::new(checker), notifier, settings.probe_timeout)))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

async fn watch(settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let http = reqwest::Client::builder().timeout(Duration::from_secs(60)).build().context("failed to build http client")?;
    let source = TargetSource { url: settings.targets_url.clone(), patterns: settings.patterns.clone(), excluded_sources: settings.excluded_sources.clone() };
    let set = targets::load(&http, &source).await?;
    info!(patterns = set.len(), "targets loaded");
    let targets = Targets::new(set);
    if let Some(every) = settings.refresh {
        targets::spawn_refresh(http, source, targets.clone(), every, cancel.clone());
    }

    let coordinator = build_coordinator(&settings).await?;
    let resolver: Arc<dyn Resolver> = Arc::new(DnsResolver::from_system(settings.dns_timeout)?);
    let admission = Admission::new(settings.limits, cancel.clone());
    let processor = Arc::new(StreamProcessor::new(targets, resolver, coordinator, admission, cancel.clone()));

    let reporter = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATS_EVERY);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let s = processor.stats();
                let a = processor.admission();
                info!(messages = s.messages, matched = s.matched, completed = s.completed, failed = s.failed, unresolved = s.unresolved, pending = a.pending(), dropped = a.dropped(), "pipeline stats");
            }
        })
    };

    let feed = certstream::spawn_with(
        certstream::StreamOptions { url: settings.stream_url.clone(), idle_timeout: settings.idle_timeout, ..certstream::StreamOptions::default() },
        cancel.clone(),
    );
    info!(url = %settings.stream_url, "watching certificate stream");
    processor.run(feed).await;

    cancel.cancel();
    if !processor.admission().drain(settings.drain_grace).await {
        warn!(pending = processor.admission().pending(), "units still running at shutdown");
    }
    let _ = reporter.await;
    let s = processor.stats();
    info!(messages = s.messages, matched = s.matched, completed = s.completed, failed = s.failed, dropped = processor.admission().dropped(), "stopped");
    Ok(())
}

async fn scan_one(settings: Settings, host: String) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let resolver = DnsResolver::from_system(settings.dns_timeout)?;
    if !resolver.resolves(&host).await {
        println!("{}", serde_json::json!({ "host": host, "resolves": false }));
        return Ok(());
    }
    let coordinator = build_coordinator(&settings).await?;
    let outcome = coordinator.run(&host, &cancel).await?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

#[cfg(feature = "enumerate")]
async fn enumerate(settings: Settings, domains: Vec<String>, record: bool) -> Result<()> {
    use certhunter_core::{base_domain, Subdomain};

    let resolver = DnsResolver::from_system(settings.dns_timeout)?;
    let client = subdomains::Client::new()?;
    let found = client.enumerate(&domains, &resolver).await?;
    let ledger = if record { Some(open_ledger(&settings)?) } else { None };
    for (domain, names) in found {
        for name in names {
            println!("{}", serde_json::json!({ "domain": domain, "subdomain": name }));
            let Some(ledger) = ledger.as_ref() else { continue };
            let Some(base) = base_domain(&name) else { continue };
            ledger.ensure_domain(&base).await?;
            if !ledger.subdomain_exists(&name, &base).await? {
                ledger.record_subdomain(&Subdomain::new(name.as_str(), base.as_str())).await?;
            }
        }
    }
    Ok(())
}
