//! Notification sinks: Slack, JSON lines and fan-out.

mod jsonl;
mod slack;

pub use jsonl::JsonlNotifier;
pub use slack::{SlackNotifier, SlackOptions};

use async_trait::async_trait;
use certhunter_core::{Notification, Notifier, NotifyError};
use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

/// Delivers every notification to all inner sinks. Fails when any sink fails.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        FanoutNotifier { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let results = join_all(self.sinks.iter().map(|s| s.notify(notification))).await;
        let failures: Vec<String> = results.into_iter().filter_map(|r| r.err()).map(|e| e.0).collect();
        if failures.is_empty() {
            return Ok(());
        }
        warn!(subject = notification.subject(), failed = failures.len(), "notification sink failed");
        Err(NotifyError(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Sink {
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Sink {
        async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
            self.seen.lock().push(n.to_string());
            if self.fail {
                return Err(NotifyError("sink down".into()));
            }
            Ok(())
        }
    }

    fn alert() -> Notification {
        Notification::Takeover { subdomain: "a.example.com".into(), service: "github".into() }
    }

    #[tokio::test]
    async fn delivers_to_every_sink() {
        let a = Arc::new(Sink::default());
        let b = Arc::new(Sink::default());
        let fan = FanoutNotifier::new(vec![a.clone(), b.clone()]);
        fan.notify(&alert()).await.unwrap();
        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn one_failing_sink_fails_delivery_but_others_still_receive() {
        let bad = Arc::new(Sink { fail: true, ..Sink::default() });
        let good = Arc::new(Sink::default());
        let fan = FanoutNotifier::new(vec![bad, good.clone()]);
        let err = fan.notify(&alert()).await.unwrap_err();
        assert!(err.0.contains("sink down"));
        assert_eq!(good.seen.lock().len(), 1);
    }
}
