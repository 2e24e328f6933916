//! Background settlement: ledger writes that run after the HTTP response
//! has been sent, with bounded retries and counters.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use crate::config::SettlementConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::{with_deadline, LedgerClient};

/// Retry schedule for background jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SettlementConfig::default())
    }
}

/// Runs once a job has failed for good
type Fallback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Debug, Default)]
struct SettlementStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SettlementSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub in_flight: usize,
}

/// Runs settlement jobs on the tokio runtime.
///
/// Jobs sharing an ordering key run one after another in submission
/// order; unrelated jobs run concurrently.
#[derive(Clone)]
pub struct SettlementQueue {
    policy: RetryPolicy,
    stats: Arc<SettlementStats>,
    idle: Arc<Notify>,
    // ordering key -> (generation, completion signal of the latest job)
    tails: Arc<Mutex<HashMap<String, (u64, oneshot::Receiver<()>)>>>,
    generation: Arc<AtomicU64>,
}

impl SettlementQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: Arc::new(SettlementStats::default()),
            idle: Arc::new(Notify::new()),
            tails: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `job` in the background, retrying retryable failures.
    pub fn submit<F, Fut>(&self, kind: &'static str, subject: impl Into<String>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(kind, subject.into(), None, job, None);
    }

    /// Like `submit`, running `on_exhausted` if the job never succeeds.
    pub fn submit_with_fallback<F, Fut, G, GFut>(
        &self,
        kind: &'static str,
        subject: impl Into<String>,
        job: F,
        on_exhausted: G,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        G: FnOnce() -> GFut + Send + 'static,
        GFut: Future<Output = ()> + Send + 'static,
    {
        let fallback: Fallback = Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(on_exhausted())
        });
        self.spawn(kind, subject.into(), None, job, Some(fallback));
    }

    /// Like `submit`, but waits for earlier jobs with the same `key`.
    pub fn submit_ordered<F, Fut>(
        &self,
        kind: &'static str,
        key: impl Into<String>,
        subject: impl Into<String>,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(kind, subject.into(), Some(key.into()), job, None);
    }

    fn spawn<F, Fut>(
        &self,
        kind: &'static str,
        subject: String,
        key: Option<String>,
        job: F,
        fallback: Option<Fallback>,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);

        let ordering = key.map(|key| self.chain(key));
        let queue = self.clone();

        tokio::spawn(async move {
            let mut done = None;
            if let Some((key, generation, previous, signal)) = ordering {
                if let Some(previous) = previous {
                    // Err means the earlier job is gone, which is just as final
                    let _ = previous.await;
                }
                done = Some((key, generation, signal));
            }

            let ok = queue.run(kind, &subject, &job).await;
            if ok {
                queue.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                queue.stats.failed.fetch_add(1, Ordering::Relaxed);
                if let Some(fallback) = fallback {
                    fallback().await;
                }
            }

            if let Some((key, generation, signal)) = done {
                queue.release(&key, generation);
                let _ = signal.send(());
            }

            if queue.stats.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                queue.idle.notify_waiters();
            }
        });
    }

    /// Register a new tail for `key`, returning the previous one to wait on.
    fn chain(
        &self,
        key: String,
    ) -> (String, u64, Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        let (signal, tail) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = match self.tails.lock() {
            Ok(mut tails) => tails
                .insert(key.clone(), (generation, tail))
                .map(|(_, rx)| rx),
            Err(poisoned) => poisoned
                .into_inner()
                .insert(key.clone(), (generation, tail))
                .map(|(_, rx)| rx),
        };
        (key, generation, previous, signal)
    }

    fn release(&self, key: &str, generation: u64) {
        let mut tails = match self.tails.lock() {
            Ok(tails) => tails,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tails.get(key).map(|(g, _)| *g) == Some(generation) {
            tails.remove(key);
        }
    }

    async fn run<F, Fut>(&self, kind: &'static str, subject: &str, job: &F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 1;
        loop {
            match job().await {
                Ok(()) => {
                    tracing::debug!("{} job for {} succeeded (attempt {})", kind, subject, attempt);
                    return true;
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        "{} job for {} failed (attempt {}/{}), retrying in {:?}: {}",
                        kind,
                        subject,
                        attempt,
                        self.policy.max_attempts,
                        delay,
                        e
                    );
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "{} job for {} failed after {} attempt(s): {}",
                        kind,
                        subject,
                        attempt,
                        e
                    );
                    return false;
                }
            }
        }
    }

    pub fn stats(&self) -> SettlementSnapshot {
        SettlementSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Wait until no job is running or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stats.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Ledger client plus the queue and deadline every ledger call goes through
#[derive(Clone)]
pub struct LedgerHandle {
    pub client: Arc<dyn LedgerClient>,
    pub queue: SettlementQueue,
    pub deadline: Duration,
}

impl LedgerHandle {
    pub fn new(client: Arc<dyn LedgerClient>, queue: SettlementQueue, deadline: Duration) -> Self {
        Self {
            client,
            queue,
            deadline,
        }
    }

    /// Run one ledger call under the configured deadline
    pub async fn call<T, F>(&self, call: F) -> std::result::Result<T, LedgerError>
    where
        F: Future<Output = std::result::Result<T, LedgerError>>,
    {
        with_deadline(self.deadline, call).await
    }
}
