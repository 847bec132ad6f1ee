//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: The core trait for rate limiting logic.
//! - [`FixedWindowLimiter`]: Fixed-window counting over a shared [`CounterStore`].
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit on HTTP requests.
//! - [`Decision`]: The result of a rate limit check (Allowed/Denied).
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` for a key and policy.
//! - **Logic**: `FixedWindowLimiter` (in `fixed_window` module) handles the window math.
//! - **Storage**: `CounterStore` (in `store` module) holds the counters. Every limiter
//!   process sharing one store agrees on the counts without talking to the others.
//!
//! # Failure policy
//!
//! Store failures fail open. The fallible trait methods report
//! [`LimiterError::StoreUnavailable`] so callers can log it; the boolean
//! helpers on [`FixedWindowLimiter`] and the middleware both allow the request.

use crate::error::LimiterError;
use crate::policy::RatePolicy;
use std::time::Duration;

pub mod fixed_window;
pub mod middleware;
pub mod store;
pub use fixed_window::FixedWindowLimiter;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{CounterStore, InMemoryCounterStore, RateLimitRecord};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Requests allowed per window.
        limit: u32,
        /// Requests left in this window after this one.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
        /// Epoch milliseconds at which the window ends.
        reset_at: u64,
    },
    /// The request is denied. It was still counted.
    Denied {
        /// Requests allowed per window.
        limit: u32,
        /// Epoch milliseconds at which the window ends.
        reset_at: u64,
        /// How long the caller should wait before retrying.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u32 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Denied { limit, .. } => *limit,
        }
    }

    /// Remaining requests; always 0 when denied.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    /// Epoch milliseconds at which the window ends.
    pub fn reset_at(&self) -> u64 {
        match self {
            Decision::Allowed { reset_at, .. } | Decision::Denied { reset_at, .. } => *reset_at,
        }
    }
}

/// Core interface for rate limiting logic.
///
/// This trait decouples the middleware from the counting scheme and from the
/// store behind it.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key` and decide whether it may proceed.
    async fn acquire(&self, key: &str, policy: RatePolicy) -> Result<Decision, LimiterError>;

    /// Requests left for `key` in the current window, without counting one.
    async fn remaining(&self, key: &str, policy: RatePolicy) -> Result<u32, LimiterError>;

    /// Forget everything recorded for `key`.
    async fn clear(&self, key: &str) -> Result<(), LimiterError>;
}

pub(crate) fn log_fail_open(component: &'static str, err: &LimiterError) {
    match err {
        LimiterError::StoreUnavailable { operation, key, source } => {
            tracing::warn!(
                target: "ratewarden::limiter",
                component,
                key = %key,
                operation = %operation,
                error = %source,
                "counter store unavailable; failing open"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_accessors() {
        let allowed = Decision::Allowed { limit: 5, remaining: 3, reset_at: 60_000 };
        assert!(allowed.is_allowed());
        assert_eq!(allowed.remaining(), 3);
        assert_eq!(allowed.limit(), 5);
        assert_eq!(allowed.reset_at(), 60_000);

        let denied =
            Decision::Denied { limit: 5, reset_at: 60_000, retry_after: Duration::from_secs(9) };
        assert!(!denied.is_allowed());
        assert_eq!(denied.limit(), 5);
        assert_eq!(denied.remaining(), 0);
        assert_eq!(denied.reset_at(), 60_000);
    }
}
