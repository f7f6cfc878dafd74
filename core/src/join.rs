//! Bounded fan-out/join for enrichment probes.

use crate::probe::ProbeError;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Run `fut` until it finishes, the deadline passes, or `cancel` fires.
pub async fn bounded<T, F>(deadline: Duration, cancel: &CancellationToken, fut: F) -> ProbeResult<T>
where
    F: Future<Output = ProbeResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        r = timeout(deadline, fut) => r.unwrap_or(Err(ProbeError::Timeout(deadline))),
    }
}

/// Both results of a two-way join. Each side fails independently.
#[derive(Debug)]
pub struct Joined<A, B> {
    pub first: ProbeResult<A>,
    pub second: ProbeResult<B>,
}

impl<A, B> Joined<A, B> {
    pub fn is_complete(&self) -> bool {
        self.first.is_ok() && self.second.is_ok()
    }

    pub fn errors(&self) -> Vec<&ProbeError> {
        self.first.as_ref().err().into_iter().chain(self.second.as_ref().err()).collect()
    }
}

/// Spawn both probes, each bounded by `deadline` and `cancel`, and wait for both.
pub async fn join2<A, B, FA, FB>(deadline: Duration, cancel: &CancellationToken, a: FA, b: FB) -> Joined<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
    FA: Future<Output = ProbeResult<A>> + Send + 'static,
    FB: Future<Output = ProbeResult<B>> + Send + 'static,
{
    let (ca, cb) = (cancel.clone(), cancel.clone());
    let ha = tokio::spawn(async move { bounded(deadline, &ca, a).await });
    let hb = tokio::spawn(async move { bounded(deadline, &cb, b).await });
    let (ra, rb) = tokio::join!(ha, hb);
    Joined {
        first: ra.unwrap_or(Err(ProbeError::Aborted)),
        second: rb.unwrap_or(Err(ProbeError::Aborted)),
    }
}
