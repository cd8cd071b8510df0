//! Seams between the orchestrator and the outside world, plus the retry and
//! timeout wrappers every network operation runs under.

use crate::digest::TreeDigest;
use carve_core::config::SyncConfig;
use carve_core::{CarveError, ErrorKind, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Longest wait for a timed-out worker to notice it was abandoned.
const ABANDON_GRACE: Duration = Duration::from_secs(30);

/// What a fetch produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    /// Upstream commit the snapshot was taken from.
    pub revision: String,
}

/// The read-only upstream repository.
pub trait SourceRepo {
    /// Materialize the upstream tree at `dest`, which must not exist yet.
    fn fetch(&self, dest: &Path) -> Result<SourceSnapshot>;
}

/// The last published state of the distribution branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributionState {
    pub commit: String,
    /// Digest recorded with the commit; `None` if the commit carries none.
    pub digest: Option<TreeDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    pub digest: TreeDigest,
    pub source_revision: String,
    /// First line of the commit message.
    pub summary: String,
}

/// The distribution repository, fully overwritten on every publish.
pub trait DistributionRepo {
    /// `None` when nothing has been published yet.
    fn current_state(&self) -> Result<Option<DistributionState>>;

    /// Replace the distribution contents with `tree`. Returns the new commit.
    fn publish(&self, tree: &Path, request: &PublishRequest) -> Result<String>;
}

/// Exclusion between concurrent runs. The guard releases on drop.
pub trait RunLock {
    type Guard;

    fn acquire(&self) -> Result<Self::Guard>;
}

/// Attempts, backoff delays and per-attempt timeout for network operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delays: Vec<Duration>,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.retries.max(1),
            delays: config
                .retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Delay after failed attempt `attempt` (0-based); the last configured
    /// delay repeats.
    pub fn delay(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::from_secs(4))
    }
}

/// Set when the caller stopped waiting for a worker. Long-running work
/// checks it at every opportunity and bails out.
#[derive(Debug, Clone, Default)]
pub struct Abandon(Arc<AtomicBool>);

impl Abandon {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Whether another attempt could succeed. Credentials do not fix themselves.
pub fn is_retryable(error: &CarveError) -> bool {
    matches!(error.kind(), ErrorKind::TransportTimeout | ErrorKind::Transport)
}

/// Run `op` up to `policy.attempts` times, sleeping between failures.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.attempts.max(1) as usize;
    let mut last_err = None;

    for attempt in 0..max_attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                if attempt + 1 < max_attempts {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        "{operation} failed (attempt {}/{}): {e}. Retrying in {}ms",
                        attempt + 1,
                        max_attempts,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CarveError::Transport {
        operation: operation.to_string(),
        reason: "no attempts were made".to_string(),
    }))
}

/// Run `op` on a worker thread and stop waiting after `timeout`.
///
/// On timeout the worker's [`Abandon`] flag is raised and the caller waits
/// for it to exit, up to a grace period, so a retry never overlaps an older
/// attempt. A worker that still completes reports its own result; one that
/// keeps running past the grace period yields `TransportStalled`.
pub fn with_timeout<T, F>(operation: &str, timeout: Duration, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Abandon) -> Result<T> + Send + 'static,
{
    let abandon = Abandon::default();
    let (tx, rx) = mpsc::channel();
    let worker = {
        let abandon = abandon.clone();
        std::thread::Builder::new()
            .name(format!("carve-{}", operation.replace(' ', "-")))
            .spawn(move || {
                let _ = tx.send(op(&abandon));
            })
            .map_err(|e| CarveError::Transport {
                operation: operation.to_string(),
                reason: format!("failed to spawn worker: {e}"),
            })?
    };
    let disconnected = || CarveError::Transport {
        operation: operation.to_string(),
        reason: "worker exited without a result".to_string(),
    };

    let late = match rx.recv_timeout(timeout) {
        Ok(result) => {
            let _ = worker.join();
            return result;
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => return Err(disconnected()),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            abandon.set();
            rx.recv_timeout(timeout.min(ABANDON_GRACE))
        }
    };
    let timed_out = CarveError::TransportTimeout {
        operation: operation.to_string(),
        seconds: timeout.as_secs(),
    };
    match late {
        Ok(Ok(value)) => {
            let _ = worker.join();
            tracing::warn!("{operation} completed after its {}s timeout", timeout.as_secs());
            Ok(value)
        }
        Ok(Err(e)) => {
            let _ = worker.join();
            tracing::debug!("{operation} stopped after timeout: {e}");
            Err(timed_out)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = worker.join();
            Err(timed_out)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CarveError::TransportStalled {
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}
