use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterError, StoreOperation};
use crate::policy::RatePolicy;
use crate::rate_limit::store::{CounterStore, RateLimitRecord};
use crate::rate_limit::{log_fail_open, Decision, RateLimiter};
use crate::window::{canonical_window_start, has_rolled_over, retry_after, window_end};
use async_trait::async_trait;
use std::sync::Arc;

/// A fixed-window rate limiter over a shared [`CounterStore`].
///
/// Each check is increment first, then compare: the request that pushes the
/// count past the limit is itself counted and denied, so callers see their
/// quota exhausted exactly at `limit`. Counts are never rolled back, even if
/// the request that consumed one is later cancelled.
///
/// The limiter holds no locks and spawns nothing; concurrent callers for the
/// same key are serialized by the store's atomic increment.
///
/// # Window rollover
///
/// When the store hands back a record from an older window, the limiter
/// overwrites it with `count = 1` for the current window, conditional on the
/// record still being stale. The writer whose overwrite lands is the first
/// request of the new window. A writer that loses that race increments once
/// more and is judged like any other request in the window. Exact counts at
/// a rollover under heavy contention are approximate; the count for a window
/// can be short by the requests that raced the overwrite.
#[derive(Debug)]
pub struct FixedWindowLimiter<S> {
    store: Arc<S>,
    default_policy: RatePolicy,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for FixedWindowLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            default_policy: self.default_policy,
            clock: self.clock.clone(),
        }
    }
}

impl<S> FixedWindowLimiter<S>
where
    S: CounterStore + 'static,
{
    /// Create a limiter backed by `store`; `default_policy` applies to [`allow`](Self::allow).
    pub fn new(store: S, default_policy: RatePolicy) -> Self {
        Self { store: Arc::new(store), default_policy, clock: Arc::new(SystemClock) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn default_policy(&self) -> RatePolicy {
        self.default_policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Count a request against `key` under the default policy.
    pub async fn allow(&self, key: &str) -> bool {
        self.allow_with_limit(key, self.default_policy).await
    }

    /// Count a request against `key` under `policy`.
    ///
    /// Never fails: if the store is unavailable the request is allowed and the
    /// failure is logged.
    pub async fn allow_with_limit(&self, key: &str, policy: RatePolicy) -> bool {
        match self.acquire(key, policy).await {
            Ok(decision) => decision.is_allowed(),
            Err(err) => {
                log_fail_open("limiter", &err);
                true
            }
        }
    }

    /// Requests left for `key` under the default policy.
    pub async fn remaining_requests(&self, key: &str) -> u32 {
        self.remaining_requests_with_limit(key, self.default_policy).await
    }

    /// Requests left for `key` under `policy`; the full limit if the store is unavailable.
    pub async fn remaining_requests_with_limit(&self, key: &str, policy: RatePolicy) -> u32 {
        match self.remaining(key, policy).await {
            Ok(remaining) => remaining,
            Err(err) => {
                log_fail_open("limiter", &err);
                policy.limit()
            }
        }
    }

    /// Delete the record for `key`, e.g. to clear failed attempts after a
    /// successful password change.
    pub async fn reset(&self, key: &str) {
        if let Err(err) = self.clear(key).await {
            log_fail_open("limiter", &err);
        }
    }

    async fn increment(
        &self,
        key: &str,
        window_start: u64,
        expires_at: u64,
    ) -> Result<(u64, u64), LimiterError> {
        self.store
            .increment(key, window_start, expires_at)
            .await
            .map_err(|e| LimiterError::store(StoreOperation::Increment, key, e))
    }

    /// Count after resolving a stale record into the current window.
    async fn roll_over(
        &self,
        key: &str,
        stale_window_start: u64,
        window_start: u64,
        expires_at: u64,
    ) -> Result<u64, LimiterError> {
        let fresh =
            RateLimitRecord { key: key.to_string(), count: 1, window_start, expires_at };
        let won = self
            .store
            .overwrite_if_stale(&fresh)
            .await
            .map_err(|e| LimiterError::store(StoreOperation::Overwrite, key, e))?;
        if won {
            tracing::debug!(
                target: "ratewarden::limiter",
                key = %key,
                stale_window_start,
                window_start,
                "window rolled over"
            );
            return Ok(1);
        }

        // Another caller already opened this window; count ourselves in it.
        let (count, stored_start) = self.increment(key, window_start, expires_at).await?;
        if has_rolled_over(stored_start, window_start) {
            // The record went stale again between our two calls. Treat this
            // request as the first of the window rather than looping.
            return Ok(1);
        }
        Ok(count)
    }
}

#[async_trait]
impl<S> RateLimiter for FixedWindowLimiter<S>
where
    S: CounterStore + 'static,
{
    async fn acquire(&self, key: &str, policy: RatePolicy) -> Result<Decision, LimiterError> {
        let now = self.clock.now_millis();
        let current = canonical_window_start(now, policy.window());
        let expires_at = window_end(current, policy.window());

        let (count, stored_start) = self.increment(key, current, expires_at).await?;
        let (count, window_start) = if has_rolled_over(stored_start, current) {
            (self.roll_over(key, stored_start, current, expires_at).await?, current)
        } else {
            // A record ahead of our window means another writer's clock is ahead; trust it.
            (count, stored_start.max(current))
        };

        let limit = policy.limit();
        let reset_at = window_end(window_start, policy.window());
        if count <= u64::from(limit) {
            let remaining = u32::try_from(u64::from(limit) - count).unwrap_or(limit);
            Ok(Decision::Allowed { limit, remaining, reset_at })
        } else {
            Ok(Decision::Denied { limit, reset_at, retry_after: retry_after(now, reset_at) })
        }
    }

    async fn remaining(&self, key: &str, policy: RatePolicy) -> Result<u32, LimiterError> {
        let current = canonical_window_start(self.clock.now_millis(), policy.window());
        let record = self
            .store
            .read(key)
            .await
            .map_err(|e| LimiterError::store(StoreOperation::Read, key, e))?;
        let limit = policy.limit();
        Ok(match record {
            Some(r) if !has_rolled_over(r.window_start, current) => {
                u32::try_from(u64::from(limit).saturating_sub(r.count)).unwrap_or(limit)
            }
            _ => limit,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), LimiterError> {
        self.store.delete(key).await.map_err(|e| LimiterError::store(StoreOperation::Delete, key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryCounterStore;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    fn limiter(limit: u32) -> (FixedWindowLimiter<InMemoryCounterStore>, ManualClock) {
        let clock = ManualClock::at_millis(0);
        let store = InMemoryCounterStore::new().with_clock(clock.clone());
        let policy = RatePolicy::new(limit, MINUTE).unwrap();
        (FixedWindowLimiter::new(store, policy).with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn allows_exactly_limit_requests_per_window() {
        let (limiter, clock) = limiter(5);
        let mut remaining = Vec::new();
        for _ in 0..5 {
            assert!(limiter.allow("k").await);
            remaining.push(limiter.remaining_requests("k").await);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        clock.set_millis(1_000);
        assert!(!limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
        assert_eq!(limiter.remaining_requests("k").await, 0);

        clock.set_millis(61_000);
        assert!(limiter.allow("k").await);
        assert_eq!(limiter.remaining_requests("k").await, 4);
    }

    #[tokio::test]
    async fn denial_carries_retry_guidance() {
        let (limiter, clock) = limiter(1);
        let policy = limiter.default_policy();
        clock.set_millis(45_500);
        assert!(limiter.acquire("k", policy).await.unwrap().is_allowed());
        match limiter.acquire("k", policy).await.unwrap() {
            Decision::Denied { limit, reset_at, retry_after } => {
                assert_eq!(limit, 1);
                assert_eq!(reset_at, 60_000);
                assert_eq!(retry_after, Duration::from_secs(15));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _) = limiter(1);
        assert!(limiter.allow("ip:203.0.113.4:/a").await);
        assert!(!limiter.allow("ip:203.0.113.4:/a").await);
        assert!(limiter.allow("ip:203.0.113.4:/b").await);
    }

    #[tokio::test]
    async fn reset_behaves_like_first_call() {
        let (limiter, _) = limiter(3);
        for _ in 0..4 {
            limiter.allow("k").await;
        }
        limiter.reset("k").await;
        assert!(limiter.allow("k").await);
        assert_eq!(limiter.remaining_requests("k").await, 2);
    }

    #[tokio::test]
    async fn stale_record_is_rolled_over_once() {
        let clock = ManualClock::at_millis(0);
        // Store that keeps expired records visible, like a lazy TTL sweeper.
        let store = InMemoryCounterStore::new()
            .with_clock(clock.clone())
            .with_reclaim_delay(Duration::from_secs(3600));
        let policy = RatePolicy::new(2, MINUTE).unwrap();
        let limiter = FixedWindowLimiter::new(store, policy).with_clock(clock.clone());

        for _ in 0..5 {
            limiter.allow("k").await;
        }
        clock.set_millis(61_000);
        assert_eq!(limiter.remaining_requests("k").await, 2, "stale record counts as absent");

        assert!(limiter.allow("k").await);
        let record = limiter.store().read("k").await.unwrap().unwrap();
        assert_eq!((record.count, record.window_start, record.expires_at), (1, 60_000, 120_000));

        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await, "second call is counted in the new window");
    }

    #[tokio::test]
    async fn rollover_loser_is_counted_in_new_window() {
        let clock = ManualClock::at_millis(61_000);
        let store = InMemoryCounterStore::new()
            .with_clock(clock.clone())
            .with_reclaim_delay(Duration::from_secs(3600));
        let policy = RatePolicy::new(5, MINUTE).unwrap();
        let limiter = FixedWindowLimiter::new(store.clone(), policy).with_clock(clock);

        store
            .overwrite_if_stale(&RateLimitRecord {
                key: "k".into(),
                count: 1,
                window_start: 60_000,
                expires_at: 120_000,
            })
            .await
            .unwrap();
        // The loser saw the old window on its increment but the winner already rolled over.
        let count = limiter.roll_over("k", 0, 60_000, 120_000).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_limit_within_window() {
        let (limiter, _) = limiter(10);
        let limiter = Arc::new(limiter);
        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("hot").await })
            })
            .collect();
        let mut allowed = 0;
        for t in tasks {
            if t.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
