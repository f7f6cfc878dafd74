use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use certhunter_core::{Notification, Notifier, NotifyError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

pub const SLACK_API: &str = "https://slack.com/api";

#[derive(Debug, Clone)]
pub struct SlackOptions {
    /// Channel ids to post to. Empty means every conversation the bot is a member of.
    pub channels: Vec<String>,
    pub api_base: String,
    pub timeout: Duration,
}

impl Default for SlackOptions {
    fn default() -> Self {
        SlackOptions { channels: Vec::new(), api_base: SLACK_API.to_string(), timeout: Duration::from_secs(10) }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    channels: Vec<Channel>,
    #[serde(default)]
    response_metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    next_cursor: String,
}

impl Envelope {
    fn check(self, method: &str) -> Result<Self> {
        if !self.ok {
            bail!("slack {} failed: {}", method, self.error.as_deref().unwrap_or("unknown error"));
        }
        Ok(self)
    }
}

/// Posts every notification to a fixed set of Slack channels.
pub struct SlackNotifier {
    http: Client,
    token: String,
    api_base: String,
    channels: Vec<String>,
}

impl SlackNotifier {
    /// Verify the token and resolve target channels. Fails when no channel is available.
    pub async fn connect(token: impl Into<String>, opts: SlackOptions) -> Result<Self> {
        let http = Client::builder().timeout(opts.timeout).build().context("failed to build http client")?;
        let mut slack = SlackNotifier { http, token: token.into(), api_base: opts.api_base.trim_end_matches('/').to_string(), channels: Vec::new() };
        let auth = slack.call("auth.test", &[]).await?;
        info!(user = auth.user.as_deref().unwrap_or(""), "authenticated with slack");
        slack.channels = if opts.channels.is_empty() { slack.member_channels().await? } else { opts.channels };
        if slack.channels.is_empty() {
            bail!("slack bot is not a member of any channel");
        }
        Ok(slack)
    }

    /// Read the token from `var` and connect.
    pub async fn from_env(var: &str, opts: SlackOptions) -> Result<Self> {
        let token = std::env::var(var).map_err(|_| anyhow!("environment variable {} is not set", var))?;
        if token.trim().is_empty() {
            bail!("environment variable {} is empty", var);
        }
        Self::connect(token.trim(), opts).await
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    async fn call(&self, method: &str, form: &[(&str, &str)]) -> Result<Envelope> {
        let url = format!("{}/{}", self.api_base, method);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await
            .with_context(|| format!("slack {} request failed", method))?;
        let env: Envelope = resp.json().await.with_context(|| format!("slack {} returned invalid json", method))?;
        env.check(method)
    }

    async fn member_channels(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut cursor = String::new();
        loop {
            let page = self
                .call("users.conversations", &[("types", "public_channel,private_channel"), ("exclude_archived", "true"), ("limit", "200"), ("cursor", cursor.as_str())])
                .await?;
            for ch in page.channels {
                debug!(id = %ch.id, name = %ch.name, "slack channel");
                ids.push(ch.id);
            }
            cursor = page.response_metadata.map(|m| m.next_cursor).unwrap_or_default();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let text = notification.to_string();
        for channel in &self.channels {
            self.call("chat.postMessage", &[("channel", channel.as_str()), ("text", text.as_str())]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 responder keyed on request path. Records `path body` per request.
    async fn fake_slack(routes: Vec<(&'static str, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let (head, body_start) = loop {
                    let n = sock.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break (String::new(), 0);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break (String::from_utf8_lossy(&buf[..pos]).into_owned(), pos + 4);
                    }
                };
                let len = head
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                    .unwrap_or(0);
                while buf.len() < body_start + len {
                    let n = sock.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let path = head.split_whitespace().nth(1).unwrap_or("").to_string();
                let body = String::from_utf8_lossy(&buf[body_start.min(buf.len())..]).into_owned();
                seen.lock().push(format!("{} {}", path, body));
                let reply = routes.iter().find(|(p, _)| path.ends_with(p)).map(|(_, r)| *r).unwrap_or(r#"{"ok":false,"error":"unknown_method"}"#);
                let resp = format!("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}", reply.len(), reply);
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{}", addr), log)
    }

    fn opts(base: String, channels: Vec<String>) -> SlackOptions {
        SlackOptions { channels, api_base: base, timeout: Duration::from_secs(5) }
    }

    #[tokio::test]
    async fn posts_to_member_channels() {
        let (base, log) = fake_slack(vec![
            ("/auth.test", r#"{"ok":true,"user":"certbot"}"#),
            ("/users.conversations", r#"{"ok":true,"channels":[{"id":"C1","name":"recon"},{"id":"C2","name":"alerts"}],"response_metadata":{"next_cursor":""}}"#),
            ("/chat.postMessage", r#"{"ok":true}"#),
        ])
        .await;
        let slack = SlackNotifier::connect("xoxb-test", opts(base, vec![])).await.unwrap();
        assert_eq!(slack.channels(), &["C1".to_string(), "C2".to_string()]);
        slack.notify(&Notification::Takeover { subdomain: "a.example.com".into(), service: "github".into() }).await.unwrap();
        let posts: Vec<String> = log.lock().iter().filter(|l| l.starts_with("/chat.postMessage")).cloned().collect();
        assert_eq!(posts.len(), 2);
        assert!(posts[0].contains("channel=C1"));
        assert!(posts[1].contains("channel=C2"));
    }

    #[tokio::test]
    async fn no_channels_is_a_construction_error() {
        let (base, _) = fake_slack(vec![
            ("/auth.test", r#"{"ok":true}"#),
            ("/users.conversations", r#"{"ok":true,"channels":[]}"#),
        ])
        .await;
        let err = SlackNotifier::connect("xoxb-test", opts(base, vec![])).await.err().unwrap();
        assert!(err.to_string().contains("not a member"));
    }

    #[tokio::test]
    async fn rejected_token_fails_auth() {
        let (base, _) = fake_slack(vec![("/auth.test", r#"{"ok":false,"error":"invalid_auth"}"#)]).await;
        let err = SlackNotifier::connect("bad", opts(base, vec!["C9".into()])).await.err().unwrap();
        assert!(err.to_string().contains("invalid_auth"));
    }

    #[tokio::test]
    async fn post_failure_surfaces_as_notify_error() {
        let (base, _) = fake_slack(vec![
            ("/auth.test", r#"{"ok":true}"#),
            ("/chat.postMessage", r#"{"ok":false,"error":"channel_not_found"}"#),
        ])
        .await;
        let slack = SlackNotifier::connect("xoxb-test", opts(base, vec!["C9".into()])).await.unwrap();
        let err = slack.notify(&Notification::Takeover { subdomain: "a.example.com".into(), service: "s3".into() }).await.unwrap_err();
        assert!(err.0.contains("channel_not_found"));
    }
}
