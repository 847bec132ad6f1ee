//! etcd counter store for `ratewarden` (companion crate).
//! Bring your own `etcd_client::Client`; records are stored as JSON under a prefix
//! and reclaimed by etcd leases once their window ends.
//!
//! Increments are optimistic: read the record, then write it back in a
//! transaction guarded by its `mod_revision` (or by absence for a new key).
//! A writer that loses the comparison re-reads and tries again, up to a bounded
//! number of attempts.

use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp};
use ratewarden::clock::{Clock, SystemClock};
use ratewarden::{CounterStore, RateLimitRecord};
use std::sync::Arc;

/// Attempts per operation before giving up with [`EtcdStoreError::Contention`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Errors from [`EtcdCounterStore`].
#[derive(thiserror::Error, Debug)]
pub enum EtcdStoreError {
    /// The etcd client reported a failure.
    #[error("etcd request failed: {0}")]
    Client(#[from] etcd_client::Error),
    /// A stored value was not a valid record.
    #[error("malformed counter record: {0}")]
    Codec(#[from] serde_json::Error),
    /// Every optimistic write lost to a concurrent writer.
    #[error("gave up on {key:?} after {attempts} contended attempts")]
    Contention {
        /// Full etcd key.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The key prefix was rejected at construction.
    #[error("invalid key prefix: {0}")]
    InvalidPrefix(&'static str),
}

/// Counter store backed by etcd. Keys are `prefix/<rate limit key>`.
#[derive(Clone)]
pub struct EtcdCounterStore {
    prefix: String,
    client: etcd_client::Client,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl std::fmt::Debug for EtcdCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCounterStore")
            .field("prefix", &self.prefix)
            .field("client", &"<etcd_client::Client>")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

struct Stored {
    record: RateLimitRecord,
    mod_revision: i64,
    lease: i64,
}

impl EtcdCounterStore {
    /// Create a store using an existing etcd client.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains control characters.
    pub fn new(
        prefix: impl Into<String>,
        client: etcd_client::Client,
    ) -> Result<Self, EtcdStoreError> {
        Ok(Self {
            prefix: normalize_prefix(prefix.into())?,
            client,
            clock: Arc::new(SystemClock),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Clock used to size leases; must agree with the limiter's clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Bound optimistic retries per operation (at least one).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    async fn fetch(&self, full_key: &str) -> Result<Option<Stored>, EtcdStoreError> {
        let mut client = self.client.clone();
        let resp = client.get(full_key, None).await?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        let record = serde_json::from_slice(kv.value())?;
        Ok(Some(Stored { record, mod_revision: kv.mod_revision(), lease: kv.lease() }))
    }

    async fn lease_until(&self, expires_at: u64) -> Result<i64, EtcdStoreError> {
        let ttl = lease_ttl_secs(self.clock.now_millis(), expires_at);
        let mut client = self.client.clone();
        Ok(client.lease_grant(ttl, None).await?.id())
    }

    /// Revoke a lease whose write lost the compare. Failure only delays
    /// reclamation until the TTL runs out, so it is logged, not returned.
    async fn release_lease(&self, lease: i64) {
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(lease).await {
            tracing::debug!(
                target: "ratewarden::etcd",
                lease,
                error = %e,
                "failed to revoke unused lease"
            );
        }
    }

    /// Write `record` if `guard` still holds. `Ok(false)` means another writer got there first.
    async fn put_if(
        &self,
        guard: Compare,
        full_key: &str,
        record: &RateLimitRecord,
        lease: i64,
    ) -> Result<bool, EtcdStoreError> {
        let value = serde_json::to_vec(record)?;
        let txn = Txn::new().when(vec![guard]).and_then(vec![TxnOp::put(
            full_key,
            value,
            Some(PutOptions::new().with_lease(lease)),
        )]);
        let mut client = self.client.clone();
        Ok(client.txn(txn).await?.succeeded())
    }

    fn contended(&self, full_key: String) -> EtcdStoreError {
        tracing::debug!(
            target: "ratewarden::etcd",
            key = %full_key,
            attempts = self.max_attempts,
            "optimistic write kept losing; giving up"
        );
        EtcdStoreError::Contention { key: full_key, attempts: self.max_attempts }
    }
}

#[async_trait]
impl CounterStore for EtcdCounterStore {
    type Error = EtcdStoreError;

    async fn increment(
        &self,
        key: &str,
        window_start: u64,
        expires_at: u64,
    ) -> Result<(u64, u64), Self::Error> {
        let full_key = self.full_key(key);
        for _ in 0..self.max_attempts {
            let (next, guard, lease, granted) = match self.fetch(&full_key).await? {
                Some(Stored { mut record, mod_revision, lease }) => {
                    let reuse = lease != 0 && record.expires_at == expires_at;
                    let lease = if reuse { lease } else { self.lease_until(expires_at).await? };
                    record.count = record.count.saturating_add(1);
                    record.expires_at = expires_at;
                    let guard = Compare::mod_revision(full_key.as_str(), CompareOp::Equal, mod_revision);
                    (record, guard, lease, !reuse)
                }
                None => {
                    let record =
                        RateLimitRecord { key: key.to_string(), count: 1, window_start, expires_at };
                    let guard = Compare::version(full_key.as_str(), CompareOp::Equal, 0);
                    (record, guard, self.lease_until(expires_at).await?, true)
                }
            };
            if self.put_if(guard, &full_key, &next, lease).await? {
                return Ok((next.count, next.window_start));
            }
            if granted {
                self.release_lease(lease).await;
            }
        }
        Err(self.contended(full_key))
    }

    async fn overwrite_if_stale(&self, record: &RateLimitRecord) -> Result<bool, Self::Error> {
        let full_key = self.full_key(&record.key);
        for _ in 0..self.max_attempts {
            let guard = match self.fetch(&full_key).await? {
                Some(current) if current.record.window_start >= record.window_start => {
                    return Ok(false);
                }
                Some(current) => {
                    Compare::mod_revision(full_key.as_str(), CompareOp::Equal, current.mod_revision)
                }
                None => Compare::version(full_key.as_str(), CompareOp::Equal, 0),
            };
            let lease = self.lease_until(record.expires_at).await?;
            if self.put_if(guard, &full_key, record, lease).await? {
                return Ok(true);
            }
            self.release_lease(lease).await;
        }
        Err(self.contended(full_key))
    }

    async fn read(&self, key: &str) -> Result<Option<RateLimitRecord>, Self::Error> {
        Ok(self.fetch(&self.full_key(key)).await?.map(|stored| stored.record))
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut client = self.client.clone();
        client.delete(self.full_key(key), None).await?;
        Ok(())
    }
}

fn normalize_prefix(prefix: String) -> Result<String, EtcdStoreError> {
    let p = prefix.trim().trim_end_matches('/');
    if p.is_empty() {
        return Err(EtcdStoreError::InvalidPrefix("prefix cannot be empty"));
    }
    if p.chars().any(char::is_control) {
        return Err(EtcdStoreError::InvalidPrefix("prefix cannot contain control characters"));
    }
    Ok(p.to_string())
}

/// Whole seconds until `expires_at`, at least one (etcd rejects zero TTLs).
fn lease_ttl_secs(now_millis: u64, expires_at: u64) -> i64 {
    let secs = expires_at.saturating_sub(now_millis).div_ceil(1000).max(1);
    i64::try_from(secs).unwrap_or(i64::MAX)
}
