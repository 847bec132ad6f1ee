use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Persistent state for one rate limit key.
///
/// `expires_at` is always `window_start + window`; stores reclaim the record
/// at or after that instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Bucket identifier, e.g. `ip:203.0.113.4:/auth/login`.
    pub key: String,
    /// Requests observed in the window starting at `window_start`.
    pub count: u64,
    /// Epoch milliseconds; a multiple of the window duration.
    pub window_start: u64,
    /// Epoch milliseconds after which the record may be reclaimed.
    pub expires_at: u64,
}

/// Abstract storage interface for rate limit counters.
///
/// This trait is designed to front a shared, strongly consistent key-value
/// store with per-record expiry. All limiter coordination happens through
/// these primitives; implementations must make `increment` atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically add one to the count for `key`, or create the record with
    /// `count = 1` and the given `window_start` if it does not exist.
    ///
    /// `expires_at` is written on every call. An existing record keeps its own
    /// `window_start`, even if stale; detecting that is the caller's job.
    ///
    /// Returns `(count, window_start)` as stored after the increment.
    async fn increment(
        &self,
        key: &str,
        window_start: u64,
        expires_at: u64,
    ) -> Result<(u64, u64), Self::Error>;

    /// Replace the record for `record.key` with `record`, but only if no record
    /// exists or the stored `window_start` is older than `record.window_start`.
    ///
    /// Returns `Ok(true)` if written, `Ok(false)` if another writer already
    /// moved the record into this (or a later) window.
    async fn overwrite_if_stale(&self, record: &RateLimitRecord) -> Result<bool, Self::Error>;

    /// Fetch the live record for `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<RateLimitRecord>, Self::Error>;

    /// Remove the record for `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;
}

#[async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    type Error = S::Error;

    async fn increment(
        &self,
        key: &str,
        window_start: u64,
        expires_at: u64,
    ) -> Result<(u64, u64), Self::Error> {
        (**self).increment(key, window_start, expires_at).await
    }

    async fn overwrite_if_stale(&self, record: &RateLimitRecord) -> Result<bool, Self::Error> {
        (**self).overwrite_if_stale(record).await
    }

    async fn read(&self, key: &str) -> Result<Option<RateLimitRecord>, Self::Error> {
        (**self).read(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        (**self).delete(key).await
    }
}

/// Errors from [`InMemoryCounterStore`].
#[derive(thiserror::Error, Debug)]
pub enum InMemoryStoreError {
    /// A thread panicked while holding the store lock.
    #[error("in-memory counter store lock poisoned")]
    Poisoned,
}

/// In-process counter store.
///
/// Suitable for single-instance deployments and tests. Expired records are
/// reclaimed when their key is touched again, and every record is swept at
/// most once per [`with_sweep_interval`](Self::with_sweep_interval) during
/// `increment`, so idle keys do not accumulate.
/// [`with_reclaim_delay`](Self::with_reclaim_delay) keeps expired records
/// visible for a while, the way stores with background TTL sweepers behave.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, RateLimitRecord>>>,
    clock: Arc<dyn Clock>,
    reclaim_delay: Duration,
    sweep_interval: Duration,
    // Epoch ms of the next full sweep; only touched under the data lock.
    next_sweep: Arc<AtomicU64>,
}

/// Default spacing between full sweeps of expired records.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(SystemClock),
            reclaim_delay: Duration::ZERO,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            next_sweep: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the clock used to judge expiry.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Keep expired records around for `delay` before reclaiming them.
    pub fn with_reclaim_delay(mut self, delay: Duration) -> Self {
        self.reclaim_delay = delay;
        self
    }

    /// How often `increment` sweeps every expired record.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Number of records not yet reclaimed.
    pub fn len(&self) -> Result<usize, InMemoryStoreError> {
        let now = self.clock.now_millis();
        let guard = self.lock()?;
        Ok(guard.values().filter(|r| !self.reclaimable(r, now)).count())
    }

    pub fn is_empty(&self) -> Result<bool, InMemoryStoreError> {
        Ok(self.len()? == 0)
    }

    /// Drop every reclaimable record, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, InMemoryStoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock()?;
        let before = guard.len();
        guard.retain(|_, r| !self.reclaimable(r, now));
        Ok(before - guard.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, RateLimitRecord>>, InMemoryStoreError> {
        self.data.lock().map_err(|_| InMemoryStoreError::Poisoned)
    }

    fn sweep_if_due(&self, guard: &mut HashMap<String, RateLimitRecord>, now: u64) {
        if now < self.next_sweep.load(Ordering::Relaxed) {
            return;
        }
        let before = guard.len();
        guard.retain(|_, r| !self.reclaimable(r, now));
        let interval = u64::try_from(self.sweep_interval.as_millis()).unwrap_or(u64::MAX);
        self.next_sweep.store(now.saturating_add(interval), Ordering::Relaxed);
        if before > guard.len() {
            tracing::debug!(
                target: "ratewarden::store",
                reclaimed = before - guard.len(),
                remaining = guard.len(),
                "swept expired counter records"
            );
        }
    }

    fn reclaimable(&self, record: &RateLimitRecord, now: u64) -> bool {
        let delay = u64::try_from(self.reclaim_delay.as_millis()).unwrap_or(u64::MAX);
        now >= record.expires_at.saturating_add(delay)
    }

    fn live_entry<'a>(
        &self,
        guard: &'a mut HashMap<String, RateLimitRecord>,
        key: &str,
        now: u64,
    ) -> Option<&'a mut RateLimitRecord> {
        if guard.get(key).is_some_and(|r| self.reclaimable(r, now)) {
            guard.remove(key);
        }
        guard.get_mut(key)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    type Error = InMemoryStoreError;

    async fn increment(
        &self,
        key: &str,
        window_start: u64,
        expires_at: u64,
    ) -> Result<(u64, u64), Self::Error> {
        let now = self.clock.now_millis();
        let mut guard = self.lock()?;
        self.sweep_if_due(&mut guard, now);
        if let Some(record) = self.live_entry(&mut guard, key, now) {
            record.count = record.count.saturating_add(1);
            record.expires_at = expires_at;
            return Ok((record.count, record.window_start));
        }
        guard.insert(
            key.to_string(),
            RateLimitRecord { key: key.to_string(), count: 1, window_start, expires_at },
        );
        Ok((1, window_start))
    }

    async fn overwrite_if_stale(&self, record: &RateLimitRecord) -> Result<bool, Self::Error> {
        let now = self.clock.now_millis();
        let mut guard = self.lock()?;
        if let Some(current) = self.live_entry(&mut guard, &record.key, now) {
            if current.window_start >= record.window_start {
                return Ok(false);
            }
        }
        guard.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    async fn read(&self, key: &str) -> Result<Option<RateLimitRecord>, Self::Error> {
        let now = self.clock.now_millis();
        let mut guard = self.lock()?;
        Ok(self.live_entry(&mut guard, key, now).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(millis: u64) -> (InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::at_millis(millis);
        (InMemoryCounterStore::new().with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn increment_creates_then_counts() {
        let (store, _) = store_at(1_000);
        assert_eq!(store.increment("k", 0, 60_000).await.unwrap(), (1, 0));
        assert_eq!(store.increment("k", 0, 60_000).await.unwrap(), (2, 0));
        let record = store.read("k").await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.key, "k");
    }

    #[tokio::test]
    async fn increment_keeps_existing_window_start() {
        let store = InMemoryCounterStore::new()
            .with_clock(ManualClock::at_millis(61_000))
            .with_reclaim_delay(Duration::from_secs(3600));
        store.overwrite_if_stale(&RateLimitRecord {
            key: "k".into(),
            count: 9,
            window_start: 0,
            expires_at: 60_000,
        })
        .await
        .unwrap();
        // Past expiry but not reclaimed yet: stale window is reported back.
        assert_eq!(store.increment("k", 60_000, 120_000).await.unwrap(), (10, 0));
    }

    #[tokio::test]
    async fn expired_records_are_reclaimed() {
        let (store, clock) = store_at(0);
        store.increment("k", 0, 60_000).await.unwrap();
        clock.set_millis(60_000);
        assert!(store.read("k").await.unwrap().is_none());
        assert_eq!(store.increment("k", 60_000, 120_000).await.unwrap(), (1, 60_000));
    }

    #[tokio::test]
    async fn overwrite_only_replaces_older_windows() {
        let (store, _) = store_at(0);
        let fresh = RateLimitRecord { key: "k".into(), count: 1, window_start: 60_000, expires_at: 120_000 };
        assert!(store.overwrite_if_stale(&fresh).await.unwrap(), "absent key is writable");
        assert!(!store.overwrite_if_stale(&fresh).await.unwrap(), "same window loses");
        let older = RateLimitRecord { window_start: 0, ..fresh.clone() };
        assert!(!store.overwrite_if_stale(&older).await.unwrap(), "older window loses");
        let newer = RateLimitRecord { window_start: 120_000, expires_at: 180_000, ..fresh };
        assert!(store.overwrite_if_stale(&newer).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, _) = store_at(0);
        store.increment("k", 0, 60_000).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_drops_idle_keys() {
        let (store, clock) = store_at(0);
        store.increment("a", 0, 1_000).await.unwrap();
        store.increment("b", 0, 5_000).await.unwrap();
        clock.set_millis(2_000);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(!store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn increments_sweep_idle_keys() {
        let (store, clock) = store_at(0);
        for i in 0..1_000 {
            store.increment(&format!("ip:198.51.100.{i}:/x"), 0, 60_000).await.unwrap();
        }
        clock.set_millis(600_000);
        store.increment("hot", 600_000, 660_000).await.unwrap();
        assert_eq!(store.purge_expired().unwrap(), 0, "idle keys were already swept");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn sweep_waits_for_interval() {
        let (store, clock) = store_at(0);
        let store = store.with_sweep_interval(Duration::from_secs(3600));
        store.increment("a", 0, 1_000).await.unwrap();
        clock.set_millis(2_000);
        store.increment("b", 0, 60_000).await.unwrap();
        // "a" is expired but the next sweep is an hour out.
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = InMemoryCounterStore::new();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k", 0, u64::MAX).await.unwrap() })
            })
            .collect();
        let mut counts: Vec<u64> = Vec::new();
        for t in tasks {
            counts.push(t.await.unwrap().0);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<_>>());
    }
}
