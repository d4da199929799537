//! synk queue: drives a [`Reconcile`] implementation from a stream of keys.
//!
//! Keys are coalesced while pending, never run twice at once, retried with
//! per-key exponential backoff, and each pass is bounded by a timeout.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use synk_core::{Action, Reconcile, SyncError, SyncKey, SyncResult, SyncStatus};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

mod coalesce;
mod resync;

pub use coalesce::Coalescer;
pub use resync::{enqueue_known, spawn_resync};

/// Backoff for failed keys: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), max: Duration::from_secs(300) }
    }
}

impl RetryPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// What to do with a key after a pass. `Err` means the whole dispatcher must stop.
    pub fn action(&self, res: &SyncResult<SyncStatus>, failures: u32) -> Result<Action, SyncError> {
        match res {
            Ok(_) => Ok(Action::await_change()),
            Err(e @ SyncError::Config(_)) => Err(e.clone()),
            Err(SyncError::Fatal(_)) => Ok(Action::await_change()),
            // a fresh read usually resolves a conflict; don't grow the delay for it
            Err(SyncError::Conflict(_)) => Ok(Action::requeue_after(self.base)),
            Err(_) => Ok(Action::requeue_after(self.delay(failures))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub pass_timeout: Duration,
    pub retry: RetryPolicy,
    /// Capacity of the inbound key channel.
    pub queue_cap: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4, pass_timeout: Duration::from_secs(30), retry: RetryPolicy::default(), queue_cap: 1024 }
    }
}

type Finished = (SyncKey, SyncResult<SyncStatus>);

struct Dispatcher<R> {
    reconciler: Arc<R>,
    cfg: DispatchConfig,
    queue: Coalescer,
    in_flight: FxHashSet<SyncKey>,
    /// Keys that received an event while in flight.
    dirty: FxHashSet<SyncKey>,
    failures: FxHashMap<SyncKey, u32>,
    delayed: DelayQueue<SyncKey>,
    delayed_keys: FxHashMap<SyncKey, delay_queue::Key>,
    tasks: JoinSet<Finished>,
}

impl<R: Reconcile + 'static> Dispatcher<R> {
    fn new(reconciler: Arc<R>, mut cfg: DispatchConfig) -> Self {
        cfg.workers = cfg.workers.max(1);
        Self {
            reconciler,
            cfg,
            queue: Coalescer::new(),
            in_flight: FxHashSet::default(),
            dirty: FxHashSet::default(),
            failures: FxHashMap::default(),
            delayed: DelayQueue::new(),
            delayed_keys: FxHashMap::default(),
            tasks: JoinSet::new(),
        }
    }

    fn idle(&self) -> bool {
        self.queue.is_empty() && self.tasks.is_empty() && self.delayed.is_empty()
    }

    fn enqueue(&mut self, key: SyncKey) {
        // a fresh event supersedes a scheduled retry
        if let Some(dk) = self.delayed_keys.remove(&key) {
            self.delayed.remove(&dk);
        }
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
        } else if !self.queue.push(key) {
            counter!("queue_coalesced_total", 1u64);
        }
        gauge!("queue_depth", self.queue.len() as f64);
    }

    fn schedule(&mut self, key: SyncKey, after: Duration) {
        if let Some(dk) = self.delayed_keys.remove(&key) {
            self.delayed.remove(&dk);
        }
        let dk = self.delayed.insert(key.clone(), after);
        self.delayed_keys.insert(key, dk);
        counter!("queue_requeued_total", 1u64);
    }

    fn fill(&mut self) {
        while self.tasks.len() < self.cfg.workers {
            let Some(key) = self.queue.pop() else { break };
            self.in_flight.insert(key.clone());
            let reconciler = Arc::clone(&self.reconciler);
            let timeout = self.cfg.pass_timeout;
            self.tasks.spawn(async move {
                let pass = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind();
                let res = match tokio::time::timeout(timeout, pass).await {
                    Ok(Ok(res)) => res,
                    Ok(Err(_)) => Err(SyncError::Fatal("reconcile pass panicked".into())),
                    Err(_) => Err(SyncError::Transient(format!("pass exceeded {:?}", timeout))),
                };
                (key, res)
            });
        }
        gauge!("queue_depth", self.queue.len() as f64);
    }

    fn finish(&mut self, joined: Result<Finished, JoinError>) -> Result<(), SyncError> {
        let (key, res) = match joined {
            Ok(v) => v,
            Err(e) => {
                // tasks are only aborted when the set is dropped; keep going
                error!(error = %e, "reconcile task aborted");
                return Ok(());
            }
        };
        self.in_flight.remove(&key);
        let failures = match &res {
            Ok(_) => {
                self.failures.remove(&key);
                0
            }
            Err(_) => {
                let f = self.failures.entry(key.clone()).or_insert(0);
                *f += 1;
                *f
            }
        };
        if let Err(e) = &res {
            match e {
                SyncError::Config(_) => error!(key = %key, error = %e, "configuration error; stopping dispatcher"),
                SyncError::Fatal(_) => error!(key = %key, error = %e, "reconcile failed; waiting for next event"),
                _ => warn!(key = %key, error = %e, class = e.class().as_str(), failures, "reconcile failed; will retry"),
            }
        }
        let action = self.cfg.retry.action(&res, failures)?;
        if self.dirty.remove(&key) {
            self.enqueue(key);
        } else if action.requeue {
            self.schedule(key, action.requeue_after.unwrap_or(self.cfg.retry.base));
        }
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SyncKey>, shutdown: CancellationToken) -> Result<(), SyncError> {
        info!(workers = self.cfg.workers, timeout = ?self.cfg.pass_timeout, "dispatcher started");
        let mut input_open = true;
        let result = loop {
            self.fill();
            if !input_open && self.idle() {
                debug!("key channel closed and queue drained");
                break Ok(());
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(in_flight = self.tasks.len(), "shutdown requested");
                    break Ok(());
                }
                maybe = rx.recv(), if input_open => match maybe {
                    Some(key) => self.enqueue(key),
                    None => input_open = false,
                },
                Some(expired) = std::future::poll_fn(|cx| self.delayed.poll_expired(cx)), if !self.delayed.is_empty() => {
                    let key = expired.into_inner();
                    self.delayed_keys.remove(&key);
                    self.enqueue(key);
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = self.finish(joined) {
                        break Err(e);
                    }
                }
            }
        };
        // let in-flight passes land; each one is bounded by the pass timeout
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok((key, Err(e))) = joined {
                warn!(key = %key, error = %e, "in-flight pass failed during shutdown");
            }
        }
        info!("dispatcher stopped");
        result
    }
}

/// Spawn a dispatcher. Send keys into the returned sender; dropping every
/// sender drains the queue and stops the dispatcher, as does `shutdown`.
///
/// The handle resolves to `Err` only for configuration errors, which stop
/// the whole subsystem.
pub fn spawn_dispatcher<R>(
    reconciler: Arc<R>,
    cfg: DispatchConfig,
    shutdown: CancellationToken,
) -> (mpsc::Sender<SyncKey>, JoinHandle<Result<(), SyncError>>)
where
    R: Reconcile + 'static,
{
    let (tx, rx) = mpsc::channel::<SyncKey>(cfg.queue_cap.max(1));
    let handle = tokio::spawn(Dispatcher::new(reconciler, cfg).run(rx, shutdown));
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy { base: Duration::from_millis(100), max: Duration::from_secs(2) }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_millis(1600));
        assert_eq!(p.delay(6), Duration::from_secs(2));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn action_follows_error_class() {
        let p = policy();
        assert_eq!(p.action(&Ok(SyncStatus::Created), 0), Ok(Action::await_change()));
        assert_eq!(
            p.action(&Err(SyncError::Transient("x".into())), 3),
            Ok(Action::requeue_after(Duration::from_millis(400)))
        );
        assert_eq!(
            p.action(&Err(SyncError::Conflict("x".into())), 5),
            Ok(Action::requeue_after(Duration::from_millis(100)))
        );
        assert_eq!(p.action(&Err(SyncError::Fatal("x".into())), 1), Ok(Action::await_change()));
        assert_eq!(p.action(&Err(SyncError::Config("bad".into())), 1), Err(SyncError::Config("bad".into())));
    }
}
