//! Periodic correction of per-tenant key counters.
//!
//! Counters only move when the kv resource creates or deletes a key, so keys
//! that expire leave them too high. One instance at a time scans the store,
//! recomputes each tenant's true count, and writes it back. A pass may span
//! several periods; progress is persisted after every step.

mod lock;
mod status;

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::keys;
use crate::store::SharedStore;

pub use lock::ReconciliationLock;
pub use status::{Phase, ReconciliationStatus};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Time between attempts; also the lock TTL.
    pub period: Duration,
    /// Age after which a completed pass is redone.
    pub expiry: Duration,
    /// Share of the period an attempt may spend working.
    pub work_fraction: f64,
    /// Keys requested per scan step.
    pub scan_batch: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            expiry: DEFAULT_EXPIRY,
            work_fraction: 0.95,
            scan_batch: 100,
        }
    }
}

/// What one attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Another instance holds the lock.
    LockHeld,
    /// The last pass is recent enough.
    UpToDate,
    /// Work was done; the pass is now in this phase.
    Worked(Phase),
}

pub struct Reconciler {
    store: SharedStore,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(store: SharedStore, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Do one period's worth of reconciliation if the lock is free.
    ///
    /// The lock is released on every path out of the work, including errors.
    pub async fn attempt_reconciliation(
        &self,
        stop: &CancellationToken,
    ) -> Result<Attempt, ReconcileError> {
        let lock = ReconciliationLock::new(self.store.as_ref(), self.config.period);
        if !lock.acquire().await? {
            debug!("reconciliation lock held elsewhere");
            return Ok(Attempt::LockHeld);
        }
        let result = self.reconcile(stop).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release reconciliation lock");
        }
        result
    }

    async fn reconcile(&self, stop: &CancellationToken) -> Result<Attempt, ReconcileError> {
        let deadline = Instant::now() + self.config.period.mul_f64(self.config.work_fraction);
        let keep_going = || !stop.is_cancelled() && Instant::now() <= deadline;
        let store = self.store.as_ref();

        let mut status = ReconciliationStatus::load(store).await?;
        if status.is_complete() && status.is_expired(self.config.expiry, Utc::now()) {
            info!("starting key count reconciliation");
            status.reset();
            status.save(store).await?;
        }
        if status.is_complete() {
            return Ok(Attempt::UpToDate);
        }

        while status.is_scanning() && keep_going() {
            let (cursor, batch) = store
                .scan(&status.cursor, "*", self.config.scan_batch)
                .await?;
            status.update_scan(cursor, &batch, Utc::now());
            status.save(store).await?;
        }

        while status.is_saving() && keep_going() {
            let Some((sandbox_id, count)) = status.pop_count() else {
                break;
            };
            store
                .set(&keys::count_key(&sandbox_id), &count.to_string(), None)
                .await?;
            debug!(sandbox_id = %sandbox_id, count, "key count reconciled");
            status.finish_if_saved(Utc::now());
            status.save(store).await?;
        }

        if status.is_complete() {
            info!("key count reconciliation complete");
        }
        Ok(Attempt::Worked(status.phase))
    }

    /// Attempt once per period, the first attempt one full period from now.
    pub fn start(self) -> ReconcilerHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone()));
        ReconcilerHandle { stop, task }
    }

    async fn run(self, stop: CancellationToken) {
        let period = self.config.period;
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                _ = ticks.tick() => {}
            }
            match self.attempt_reconciliation(&stop).await {
                Ok(attempt) => debug!(?attempt, "reconciliation attempt finished"),
                Err(e) => error!(error = %e, "reconciliation attempt failed"),
            }
        }
    }
}

/// A running reconciler.
pub struct ReconcilerHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Cancel future attempts and wait for an in-flight one to wrap up.
    ///
    /// An in-flight attempt stops between steps, saving its progress and
    /// releasing the lock.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Err(e) = (&mut self.task).await {
            error!(error = %e, "reconciliation task failed");
        }
    }
}

/// Dropping the handle without [`ReconcilerHandle::stop`] cancels the task.
impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::Result as StoreResult;
    use crate::store::{MemoryStore, Store};

    const PERIOD: Duration = Duration::from_secs(600);

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            period: PERIOD,
            scan_batch: 3,
            ..ReconcileConfig::default()
        }
    }

    async fn seed(store: &MemoryStore, sandbox_id: &str, live: usize, counter: i64) {
        for i in 0..live {
            let key = keys::sandboxed_key(sandbox_id, &format!("k{i}"));
            store.set(&key, "1", None).await.unwrap();
        }
        store
            .set(&keys::count_key(sandbox_id), &counter.to_string(), None)
            .await
            .unwrap();
    }

    async fn counter(store: &MemoryStore, sandbox_id: &str) -> Option<String> {
        store.get(&keys::count_key(sandbox_id)).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn full_pass_corrects_counters() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", 4, 9).await;
        seed(&store, "b", 0, 5).await;
        seed(&store, "c", 2, 2).await;
        let reconciler = Reconciler::new(store.clone(), config());

        let stop = CancellationToken::new();
        let attempt = reconciler.attempt_reconciliation(&stop).await.unwrap();
        assert_eq!(attempt, Attempt::Worked(Phase::Complete));
        assert_eq!(counter(&store, "a").await.as_deref(), Some("4"));
        assert_eq!(counter(&store, "b").await.as_deref(), Some("0"));
        assert_eq!(counter(&store, "c").await.as_deref(), Some("2"));
        assert!(!store.exists(keys::LOCK_KEY).await.unwrap());

        let attempt = reconciler.attempt_reconciliation(&stop).await.unwrap();
        assert_eq!(attempt, Attempt::UpToDate);
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_skips_the_period() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", 1, 3).await;
        let other = ReconciliationLock::new(&*store, PERIOD);
        assert!(other.acquire().await.unwrap());

        let reconciler = Reconciler::new(store.clone(), config());
        let attempt = reconciler
            .attempt_reconciliation(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempt, Attempt::LockHeld);
        assert_eq!(counter(&store, "a").await.as_deref(), Some("3"));
        assert!(other.release().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_pauses_and_resumes() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", 5, 8).await;
        let reconciler = Reconciler::new(store.clone(), config());

        let stop = CancellationToken::new();
        stop.cancel();
        let attempt = reconciler.attempt_reconciliation(&stop).await.unwrap();
        assert_eq!(attempt, Attempt::Worked(Phase::Scanning));
        assert_eq!(counter(&store, "a").await.as_deref(), Some("8"));
        let saved = ReconciliationStatus::load(&*store).await.unwrap();
        assert!(saved.is_scanning());
        assert!(!store.exists(keys::LOCK_KEY).await.unwrap());

        let attempt = reconciler
            .attempt_reconciliation(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempt, Attempt::Worked(Phase::Complete));
        assert_eq!(counter(&store, "a").await.as_deref(), Some("5"));
    }

    /// Memory store whose every scan step takes `step` of (paused) time.
    struct SlowScan {
        inner: Arc<MemoryStore>,
        step: Duration,
    }

    #[async_trait]
    impl Store for SlowScan {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }

        async fn incr_by(&self, key: &str, amount: i64) -> StoreResult<i64> {
            self.inner.incr_by(key, amount).await
        }

        async fn scan(
            &self,
            cursor: &str,
            pattern: &str,
            count: usize,
        ) -> StoreResult<(String, Vec<String>)> {
            tokio::time::advance(self.step).await;
            self.inner.scan(cursor, pattern, count).await
        }

        async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
            self.inner.delete_if_equals(key, value).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn work_stops_at_the_deadline_and_resumes() {
        let inner = Arc::new(MemoryStore::new());
        seed(&inner, "a", 10, 99).await;
        let store = Arc::new(SlowScan {
            inner: inner.clone(),
            step: Duration::from_secs(200),
        });
        let reconciler = Reconciler::new(store, config());
        let stop = CancellationToken::new();

        // The deadline is 570s in; the third scan step ends at 600s with keys left.
        let attempt = reconciler.attempt_reconciliation(&stop).await.unwrap();
        assert_eq!(attempt, Attempt::Worked(Phase::Scanning));
        assert_eq!(counter(&inner, "a").await.as_deref(), Some("99"));
        let saved = ReconciliationStatus::load(&*inner).await.unwrap();
        assert!(saved.is_scanning());
        assert_ne!(saved.cursor, crate::store::SCAN_START);

        let attempt = reconciler.attempt_reconciliation(&stop).await.unwrap();
        assert_eq!(attempt, Attempt::Worked(Phase::Complete));
        assert_eq!(counter(&inner, "a").await.as_deref(), Some("10"));
        assert!(!inner.exists(keys::LOCK_KEY).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pass_is_redone() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", 1, 1).await;
        let reconciler = Reconciler::new(
            store.clone(),
            ReconcileConfig {
                expiry: Duration::ZERO,
                ..config()
            },
        );
        let stop = CancellationToken::new();
        reconciler.attempt_reconciliation(&stop).await.unwrap();
        store.set(&keys::count_key("a"), "7", None).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let attempt = reconciler.attempt_reconciliation(&stop).await.unwrap();
        assert_eq!(attempt, Attempt::Worked(Phase::Complete));
        assert_eq!(counter(&store, "a").await.as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_stops_the_daemon() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", 1, 9).await;
        let handle = Reconciler::new(store.clone(), config()).start();
        drop(handle);

        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(counter(&store, "a").await.as_deref(), Some("9"));
        assert!(store.get(keys::STATUS_KEY).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn daemon_waits_a_period_then_runs() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", 2, 6).await;
        let handle = Reconciler::new(store.clone(), config()).start();

        tokio::time::sleep(PERIOD - Duration::from_secs(1)).await;
        assert_eq!(counter(&store, "a").await.as_deref(), Some("6"));
        assert!(store.get(keys::STATUS_KEY).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter(&store, "a").await.as_deref(), Some("2"));

        handle.stop().await;
        store.set(&keys::count_key("a"), "6", None).await.unwrap();
        store.set(keys::STATUS_KEY, "{\"phase\":\"scanning\",\"cursor\":\"0\"}", None).await.unwrap();
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(counter(&store, "a").await.as_deref(), Some("6"));
    }
}
