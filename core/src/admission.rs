//! Bounded admission of per-candidate work: a cap on queued units, a global
//! in-flight cap and a per-target cap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    /// Units spawned but not yet finished.
    pub max_pending: usize,
    /// Units running at once across all targets.
    pub max_in_flight: usize,
    /// Units running at once for one target.
    pub per_target: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        AdmissionLimits { max_pending: 4096, max_in_flight: 32, per_target: 2 }
    }
}

#[derive(Clone)]
pub struct Admission {
    limits: AdmissionLimits,
    in_flight: Arc<Semaphore>,
    targets: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    pending: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Admission {
    pub fn new(limits: AdmissionLimits, cancel: CancellationToken) -> Self {
        Admission {
            limits,
            in_flight: Arc::new(Semaphore::new(limits.max_in_flight.max(1))),
            targets: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Spawn `work` for `target` without waiting. Returns false when the pending
    /// bound is reached or shutdown has begun; the unit is then dropped.
    pub fn submit<F>(&self, target: &str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() || self.tracker.is_closed() {
            return false;
        }
        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.limits.max_pending.max(1) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(target_domain = target, dropped, "admission queue full, dropping candidate");
            return false;
        }
        let guard = PendingGuard(self.pending.clone());
        let this = self.clone();
        let target = target.to_string();
        self.tracker.spawn(async move {
            let _guard = guard;
            let target_sem = this.target_semaphore(&target);
            let permits = tokio::select! {
                _ = this.cancel.cancelled() => None,
                p = async {
                    let t = target_sem.clone().acquire_owned().await.ok()?;
                    let g = this.in_flight.clone().acquire_owned().await.ok()?;
                    Some((t, g))
                } => p,
            };
            if let Some(_permits) = permits {
                work.await;
            }
            drop(target_sem);
            this.release_target(&target);
        });
        true
    }

    fn target_semaphore(&self, target: &str) -> Arc<Semaphore> {
        let per_target = self.limits.per_target.max(1);
        self.targets
            .lock()
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(per_target)))
            .clone()
    }

    fn release_target(&self, target: &str) {
        let mut map = self.targets.lock();
        if map.get(target).map(|s| Arc::strong_count(s) == 1).unwrap_or(false) {
            map.remove(target);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn tracked_targets(&self) -> usize {
        self.targets.lock().len()
    }

    /// Stop accepting work and wait up to `grace` for running units.
    /// Returns true when everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}
