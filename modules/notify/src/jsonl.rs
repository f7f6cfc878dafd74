use async_trait::async_trait;
use certhunter_core::{Notification, Notifier, NotifyError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    subject: &'a str,
    text: String,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// Writes one JSON object per notification to stdout or an append-only file.
pub struct JsonlNotifier {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonlNotifier {
    pub fn stdout() -> Self {
        JsonlNotifier { out: Mutex::new(Box::new(io::stdout())) }
    }

    pub fn append(path: &Path) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
        Ok(JsonlNotifier { out: Mutex::new(Box::new(BufWriter::new(f))) })
    }

    pub fn from_writer(w: Box<dyn Write + Send>) -> Self {
        JsonlNotifier { out: Mutex::new(w) }
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let line = Line { ts: now_rfc3339(), subject: notification.subject(), text: notification.to_string(), notification };
        let mut s = serde_json::to_string(&line).map_err(|e| NotifyError(e.to_string()))?;
        s.push('\n');
        let mut out = self.out.lock();
        out.write_all(s.as_bytes()).and_then(|_| out.flush()).map_err(|e| NotifyError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certhunter_core::Subdomain;

    #[tokio::test]
    async fn appends_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let sink = JsonlNotifier::append(&path).unwrap();
        sink.notify(&Notification::NewSubdomain(Subdomain::new("new.example.com", "example.com"))).await.unwrap();
        sink.notify(&Notification::Takeover { subdomain: "new.example.com".into(), service: "github".into() }).await.unwrap();
        drop(sink);

        let again = JsonlNotifier::append(&path).unwrap();
        again.notify(&Notification::Takeover { subdomain: "b.example.com".into(), service: "heroku".into() }).await.unwrap();
        drop(again);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "new_subdomain");
        assert_eq!(lines[0]["subject"], "new.example.com");
        assert_eq!(lines[1]["service"], "github");
        assert_eq!(lines[2]["text"], "New subdomain takeover on host: b.example.com\n\tService: heroku");
    }
}
