//! Websocket transport for the public certificate transparency stream.
//!
//! Delivers raw frames as [`FeedItem`]s and reconnects on its own after
//! errors, closes or idle periods.

use certhunter_core::FeedItem;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_URL: &str = "wss://certstream.calidog.io/";

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub url: String,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Reconnect when nothing arrives for this long.
    pub idle_timeout: Duration,
    pub buffer: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            url: DEFAULT_URL.to_string(),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            buffer: 1024,
        }
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff { min, max: max.max(min), next: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        current
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

enum Session {
    /// Cancelled or nobody is listening any more.
    Stopped,
    Lost(String),
}

/// Start the transport with default options against `url`.
pub fn spawn(url: impl Into<String>, cancel: CancellationToken) -> mpsc::Receiver<FeedItem> {
    spawn_with(StreamOptions { url: url.into(), ..StreamOptions::default() }, cancel)
}

pub fn spawn_with(opts: StreamOptions, cancel: CancellationToken) -> mpsc::Receiver<FeedItem> {
    let (tx, rx) = mpsc::channel(opts.buffer.max(1));
    tokio::spawn(run(opts, tx, cancel));
    rx
}

async fn run(opts: StreamOptions, tx: mpsc::Sender<FeedItem>, cancel: CancellationToken) {
    let mut backoff = Backoff::new(opts.min_backoff, opts.max_backoff);
    loop {
        if cancel.is_cancelled() || tx.is_closed() {
            break;
        }
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = connect_async(opts.url.as_str()) => r,
        };
        let reason = match connected {
            Ok((ws, _)) => {
                info!(url = %opts.url, "connected to certificate stream");
                backoff.reset();
                match session(ws, &tx, &cancel, opts.idle_timeout).await {
                    Session::Stopped => break,
                    Session::Lost(reason) => reason,
                }
            }
            Err(e) => format!("connect failed: {}", e),
        };
        let delay = backoff.next_delay();
        warn!(url = %opts.url, reason = %reason, retry_in = ?delay, "certificate stream disconnected");
        if tx.send(FeedItem::Disconnected(reason)).await.is_err() {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
    debug!("certificate stream transport stopped");
}

async fn session<S>(mut ws: S, tx: &mpsc::Sender<FeedItem>, cancel: &CancellationToken, idle: Duration) -> Session
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message>
        + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = ws.close().await;
                return Session::Stopped;
            }
            n = timeout(idle, ws.next()) => n,
        };
        let text = match next {
            Err(_) => return Session::Lost(format!("no frames for {:?}", idle)),
            Ok(None) => return Session::Lost("stream ended".into()),
            Ok(Some(Err(e))) => return Session::Lost(e.to_string()),
            Ok(Some(Ok(Message::Text(t)))) => t,
            Ok(Some(Ok(Message::Binary(b)))) => match String::from_utf8(b) {
                Ok(t) => t,
                Err(_) => continue,
            },
            Ok(Some(Ok(Message::Close(frame)))) => {
                return Session::Lost(frame.map(|f| format!("closed: {}", f.reason)).unwrap_or_else(|| "closed".into()))
            }
            Ok(Some(Ok(_))) => continue,
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Session::Stopped,
            r = tx.send(FeedItem::Message(text)) => r,
        };
        if sent.is_err() {
            let _ = ws.close().await;
            return Session::Stopped;
        }
    }
}
