//! Error types for the rate limiter.
//!
//! Only a denied request is ever visible to end callers, and it is a
//! [`Decision`](crate::Decision), not an error. Store failures surface as
//! [`LimiterError::StoreUnavailable`] to code that asks for them explicitly
//! and are turned into "allow" everywhere else. Policy errors are raised at
//! construction time only.
use std::fmt;
use std::time::Duration;

/// Boxed error from a counter store backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Counter store primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Atomic increment-or-create.
    Increment,
    /// Conditional overwrite during window rollover.
    Overwrite,
    /// Point read.
    Read,
    /// Unconditional delete.
    Delete,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Increment => "increment",
            Self::Overwrite => "overwrite",
            Self::Read => "read",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A configured (limit, window) pair is unusable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyError {
    /// Limit must be > 0 and window must be at least one millisecond.
    #[error("malformed rate limit policy: limit={limit}, window={window:?}")]
    MalformedPolicy {
        /// Limit provided by caller.
        limit: u32,
        /// Window provided by caller.
        window: Duration,
    },
    /// An endpoint entry path does not start with `/`.
    #[error("endpoint policy path must start with '/' (got {path:?})")]
    InvalidPath {
        /// Path provided by caller.
        path: String,
    },
}

/// Failure reported by [`RateLimiter`](crate::RateLimiter) methods.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LimiterError {
    /// The backing store could not be reached or rejected the operation.
    #[error("counter store unavailable during {operation} of {key:?}: {source}")]
    StoreUnavailable {
        /// Store primitive that failed.
        operation: StoreOperation,
        /// Rate limit key being evaluated.
        key: String,
        /// Backend error.
        #[source]
        source: BoxError,
    },
}

impl LimiterError {
    pub(crate) fn store<E>(operation: StoreOperation, key: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable { operation, key: key.to_string(), source: Box::new(source) }
    }

    /// Check if the failure came from the counter store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Operation that failed, if this is a store failure.
    pub fn operation(&self) -> Option<StoreOperation> {
        match self {
            Self::StoreUnavailable { operation, .. } => Some(*operation),
        }
    }
}

/// Errors raised while loading [`RateLimitSettings`](crate::config::RateLimitSettings).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// Environment could not be read or deserialized.
    #[error("rate limit configuration: {0}")]
    Source(#[from] config::ConfigError),
    /// A configured policy is invalid.
    #[error("rate limit configuration: {setting}: {source}")]
    Policy {
        /// Setting group that produced the policy (e.g. "login").
        setting: &'static str,
        /// Validation failure.
        #[source]
        source: PolicyError,
    },
}
