//! Subdomain takeover detection from dangling CNAMEs and provider error pages.
//!
//! Fingerprints use the subjack JSON layout:
//! `[{"service": "github", "cname": ["github.io"], "fingerprint": ["..."], "nxdomain": false}]`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use certhunter_core::{ProbeError, TakeoverChecker};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::{ResolveError, TokioResolver};
use reqwest::{redirect::Policy, Client, Response};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_CNAME_HOPS: usize = 8;
const MAX_BODY: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub service: String,
    #[serde(default)]
    pub cname: Vec<String>,
    #[serde(default)]
    pub fingerprint: Vec<String>,
    #[serde(default)]
    pub nxdomain: bool,
}

impl Fingerprint {
    fn applies_to(&self, cnames: &[String]) -> bool {
        cnames.iter().any(|c| self.cname.iter().any(|p| !p.is_empty() && c.contains(&p.to_lowercase())))
    }
}

pub fn load_fingerprints(path: &Path) -> Result<Vec<Fingerprint>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read fingerprints file {}", path.display()))?;
    serde_json::from_str(&raw).context("failed to parse fingerprints json")
}

fn fp(service: &str, cname: &[&str], fingerprint: &[&str], nxdomain: bool) -> Fingerprint {
    Fingerprint {
        service: service.into(),
        cname: cname.iter().map(|s| s.to_string()).collect(),
        fingerprint: fingerprint.iter().map(|s| s.to_string()).collect(),
        nxdomain,
    }
}

/// Built-in set used when no fingerprints file is configured.
pub fn default_fingerprints() -> Vec<Fingerprint> {
    vec![
        fp("github", &["github.io"], &["There isn't a GitHub Pages site here."], false),
        fp("heroku", &["herokuapp.com", "herokudns.com", "herokussl.com"], &["No such app", "herokucdn.com/error-pages/no-such-app.html"], false),
        fp("aws/s3", &["amazonaws.com"], &["The specified bucket does not exist", "NoSuchBucket"], false),
        fp("shopify", &["myshopify.com"], &["Sorry, this shop is currently unavailable."], false),
        fp("fastly", &["fastly.net"], &["Fastly error: unknown domain"], false),
        fp("pantheon", &["pantheonsite.io"], &["The gods are wise, but do not know of the site which you seek."], false),
        fp("tumblr", &["domains.tumblr.com"], &["Whatever you were looking for doesn't currently exist at this address."], false),
        fp("surge", &["surge.sh"], &["project not found"], false),
        fp("bitbucket", &["bitbucket.io"], &["Repository not found"], false),
        fp("ghost", &["ghost.io"], &["The thing you were looking for is no longer here, or never was"], false),
        fp("readme", &["readme.io"], &["Project doesnt exist... yet!"], false),
        fp("unbounce", &["unbouncepages.com"], &["The requested URL was not found on this server."], false),
        fp("azure", &["azurewebsites.net", "cloudapp.net", "cloudapp.azure.com", "trafficmanager.net", "blob.core.windows.net"], &[], true),
    ]
}

/// Decide vulnerability from gathered evidence. Returns the lowercase service id.
pub fn identify(fingerprints: &[Fingerprint], cnames: &[String], cname_dangling: bool, body: Option<&str>) -> Option<String> {
    for f in fingerprints.iter().filter(|f| f.applies_to(cnames)) {
        if f.nxdomain && cname_dangling {
            return Some(f.service.to_lowercase());
        }
        if let Some(body) = body {
            if f.fingerprint.iter().any(|s| !s.is_empty() && body.contains(s.as_str())) {
                return Some(f.service.to_lowercase());
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions { http_timeout: Duration::from_secs(10), user_agent: format!("certhunter/{}", env!("CARGO_PKG_VERSION")) }
    }
}

/// Outcome of one DNS question. `Absent` is an authoritative "no such name or record";
/// anything else that went wrong is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer<T> {
    Found(T),
    Absent,
    Failed(String),
}

impl<T> Answer<T> {
    fn from_lookup<L>(r: Result<L, ResolveError>, found: impl FnOnce(L) -> Option<T>) -> Self {
        match r {
            Ok(l) => found(l).map(Answer::Found).unwrap_or(Answer::Absent),
            Err(e) if e.is_nx_domain() || e.is_no_records_found() => Answer::Absent,
            Err(e) => Answer::Failed(e.to_string()),
        }
    }
}

/// DNS and HTTP lookups a takeover verdict is built from.
#[async_trait]
trait Evidence: Send + Sync {
    /// CNAME target of `name`, lowercased without the trailing dot.
    async fn cname(&self, name: &str) -> Answer<String>;
    async fn address(&self, name: &str) -> Answer<()>;
    /// Landing page body of `host`, capped at `MAX_BODY` bytes.
    async fn body(&self, host: &str) -> Result<String, String>;
}

fn failed(msg: String) -> ProbeError {
    ProbeError::Failed(anyhow::anyhow!(msg))
}

async fn cname_chain<E: Evidence + ?Sized>(evidence: &E, host: &str) -> Result<Vec<String>, ProbeError> {
    let mut chain: Vec<String> = Vec::new();
    let mut current = host.to_string();
    for _ in 0..MAX_CNAME_HOPS {
        match evidence.cname(&current).await {
            Answer::Found(next) => {
                if chain.contains(&next) {
                    break;
                }
                chain.push(next.clone());
                current = next;
            }
            Answer::Absent => break,
            Answer::Failed(e) => return Err(failed(format!("cname lookup for {} failed: {}", current, e))),
        }
    }
    Ok(chain)
}

async fn evaluate<E: Evidence + ?Sized>(fingerprints: &[Fingerprint], evidence: &E, host: &str) -> Result<Option<String>, ProbeError> {
    let cnames = cname_chain(evidence, host).await?;
    let candidates: Vec<&Fingerprint> = fingerprints.iter().filter(|f| f.applies_to(&cnames)).collect();
    if candidates.is_empty() {
        return Ok(None);
    }
    let dangling = match cnames.last() {
        Some(target) if candidates.iter().any(|f| f.nxdomain) => match evidence.address(target).await {
            Answer::Absent => true,
            Answer::Found(()) => false,
            Answer::Failed(e) => return Err(failed(format!("lookup of cname target {} failed: {}", target, e))),
        },
        _ => false,
    };
    if let Some(service) = identify(fingerprints, &cnames, dangling, None) {
        return Ok(Some(service));
    }
    if !candidates.iter().any(|f| !f.fingerprint.is_empty()) {
        return Ok(None);
    }
    let body = evidence.body(host).await.map_err(failed)?;
    Ok(identify(fingerprints, &cnames, dangling, Some(&body)))
}

/// Read at most `MAX_BODY` bytes of the response without buffering the rest.
async fn read_capped(mut resp: Response) -> reqwest::Result<String> {
    let mut buf = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = MAX_BODY - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= MAX_BODY {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `TakeoverChecker` driven by a fingerprint set.
pub struct FingerprintChecker {
    fingerprints: Vec<Fingerprint>,
    resolver: TokioResolver,
    http: Client,
}

impl FingerprintChecker {
    pub fn new(fingerprints: Vec<Fingerprint>, opts: CheckOptions) -> Result<Self> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| anyhow::anyhow!("failed to create resolver: {}", e))?
            .build();
        let http = Client::builder()
            .redirect(Policy::limited(3))
            .timeout(opts.http_timeout)
            .user_agent(opts.user_agent)
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build http client")?;
        Ok(FingerprintChecker { fingerprints, resolver, http })
    }

    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.len()
    }
}

#[async_trait]
impl Evidence for FingerprintChecker {
    async fn cname(&self, name: &str) -> Answer<String> {
        Answer::from_lookup(self.resolver.lookup(name, RecordType::CNAME).await, |l| {
            l.iter().find_map(|r| r.as_cname().map(|c| c.0.to_utf8().trim_end_matches('.').to_lowercase()))
        })
    }

    async fn address(&self, name: &str) -> Answer<()> {
        Answer::from_lookup(self.resolver.lookup_ip(name).await, |l| l.iter().next().map(|_| ()))
    }

    async fn body(&self, host: &str) -> Result<String, String> {
        let mut errors = Vec::new();
        for scheme in ["http", "https"] {
            let url = format!("{}://{}/", scheme, host);
            match self.http.get(&url).send().await {
                Ok(resp) => match read_capped(resp).await {
                    Ok(body) => return Ok(body),
                    Err(e) => errors.push(format!("{}: {}", url, e)),
                },
                Err(e) => {
                    debug!(url, error = %e, "takeover fetch failed");
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }
        Err(format!("fetch failed ({})", errors.join("; ")))
    }
}

#[async_trait]
impl TakeoverChecker for FingerprintChecker {
    async fn check(&self, host: &str, cancel: &CancellationToken) -> Result<Option<String>, ProbeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            verdict = evaluate(&self.fingerprints, self, host) => verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn body_fingerprint_on_matching_cname() {
        let fps = default_fingerprints();
        let body = "<h1>404</h1><p>There isn't a GitHub Pages site here.</p>";
        assert_eq!(identify(&fps, &chain(&["acme.github.io"]), false, Some(body)), Some("github".into()));
    }

    #[test]
    fn body_alone_is_not_enough_without_cname() {
        let fps = default_fingerprints();
        let body = "There isn't a GitHub Pages site here.";
        assert_eq!(identify(&fps, &[], false, Some(body)), None);
        assert_eq!(identify(&fps, &chain(&["lb.example.net"]), false, Some(body)), None);
    }

    #[test]
    fn dangling_cname_for_nxdomain_service() {
        let fps = default_fingerprints();
        assert_eq!(identify(&fps, &chain(&["old-app.azurewebsites.net"]), true, None), Some("azure".into()));
        assert_eq!(identify(&fps, &chain(&["old-app.azurewebsites.net"]), false, None), None);
    }

    #[test]
    fn service_id_is_lowercased() {
        let fps = vec![fp("Shopify", &["myshopify.com"], &["Sorry, this shop is currently unavailable."], false)];
        let body = "Sorry, this shop is currently unavailable.";
        assert_eq!(identify(&fps, &chain(&["shops.myshopify.com"]), false, Some(body)), Some("shopify".into()));
    }

    #[test]
    fn subjack_json_loads() {
        let dir = std::env::temp_dir().join(format!("certhunter-fp-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fingerprints.json");
        std::fs::write(&path, r#"[{"service":"github","cname":["github.io"],"fingerprint":["There isn't a GitHub Pages site here."],"nxdomain":false},{"service":"azure","cname":["cloudapp.net"],"nxdomain":true}]"#).unwrap();
        let fps = load_fingerprints(&path).unwrap();
        assert_eq!(fps.len(), 2);
        assert!(fps[1].nxdomain);
        assert!(fps[1].fingerprint.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    struct Fake {
        cnames: Vec<(&'static str, Answer<String>)>,
        address: Answer<()>,
        body: Result<String, String>,
        fetched: parking_lot::Mutex<usize>,
    }

    impl Fake {
        fn new(cnames: Vec<(&'static str, Answer<String>)>) -> Self {
            Fake { cnames, address: Answer::Found(()), body: Ok(String::new()), fetched: parking_lot::Mutex::new(0) }
        }
    }

    #[async_trait]
    impl Evidence for Fake {
        async fn cname(&self, name: &str) -> Answer<String> {
            self.cnames.iter().find(|(n, _)| *n == name).map(|(_, a)| a.clone()).unwrap_or(Answer::Absent)
        }
        async fn address(&self, _name: &str) -> Answer<()> {
            self.address.clone()
        }
        async fn body(&self, _host: &str) -> Result<String, String> {
            *self.fetched.lock() += 1;
            self.body.clone()
        }
    }

    #[tokio::test]
    async fn cname_lookup_failure_is_an_error() {
        let fake = Fake::new(vec![("app.example.com", Answer::Failed("SERVFAIL".into()))]);
        let err = evaluate(&default_fingerprints(), &fake, "app.example.com").await.unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
    }

    #[tokio::test]
    async fn no_cname_is_not_vulnerable() {
        let fake = Fake::new(vec![]);
        assert_eq!(evaluate(&default_fingerprints(), &fake, "app.example.com").await.unwrap(), None);
        assert_eq!(*fake.fetched.lock(), 0);
    }

    #[tokio::test]
    async fn unreachable_page_is_an_error_not_a_clean_verdict() {
        let mut fake = Fake::new(vec![("app.example.com", Answer::Found("acme.github.io".into()))]);
        fake.body = Err("connection refused".into());
        let err = evaluate(&default_fingerprints(), &fake, "app.example.com").await.unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
    }

    #[tokio::test]
    async fn page_fingerprint_reports_service() {
        let mut fake = Fake::new(vec![("app.example.com", Answer::Found("acme.github.io".into()))]);
        fake.body = Ok("There isn't a GitHub Pages site here.".into());
        assert_eq!(evaluate(&default_fingerprints(), &fake, "app.example.com").await.unwrap(), Some("github".into()));
    }

    #[tokio::test]
    async fn only_nxdomain_counts_as_dangling() {
        let chain = vec![("old.example.com", Answer::Found("old-app.azurewebsites.net".into()))];

        let mut fake = Fake::new(chain.clone());
        fake.address = Answer::Absent;
        assert_eq!(evaluate(&default_fingerprints(), &fake, "old.example.com").await.unwrap(), Some("azure".into()));

        let mut fake = Fake::new(chain.clone());
        fake.address = Answer::Failed("timed out".into());
        assert!(evaluate(&default_fingerprints(), &fake, "old.example.com").await.is_err());

        let fake = Fake::new(chain);
        assert_eq!(evaluate(&default_fingerprints(), &fake, "old.example.com").await.unwrap(), None);
    }

    #[test]
    fn lookup_errors_other_than_missing_records_are_failures() {
        let failed: Answer<()> = Answer::from_lookup(Err::<(), _>(ResolveError::from("request timed out")), |_: ()| Some(()));
        assert!(matches!(failed, Answer::Failed(_)));
        let empty: Answer<()> = Answer::from_lookup(Ok(Vec::<u8>::new()), |v| v.first().map(|_| ()));
        assert_eq!(empty, Answer::Absent);
    }

    #[tokio::test]
    async fn body_read_stops_at_cap() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 2048];
            let _ = sock.read(&mut req).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n", 64 * MAX_BODY);
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.write_all(&vec![b'a'; MAX_BODY + 8192]).await;
            // Hold the connection open with the rest of the declared body unsent.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let resp = Client::new().get(format!("http://{}/", addr)).send().await.unwrap();
        let body = tokio::time::timeout(Duration::from_secs(5), read_capped(resp)).await.unwrap().unwrap();
        assert_eq!(body.len(), MAX_BODY);
    }
}
