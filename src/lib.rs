#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratewarden
//!
//! Fixed-window rate limiting for services that run as many independent
//! workers. Workers never coordinate with each other; they agree on quotas
//! through a shared counter store with atomic increments and per-record TTL.
//!
//! ## Features
//!
//! - **Fixed-window counters** aligned to the Unix epoch, O(1) state per key
//! - **Pluggable counter stores** (in-memory here, etcd in `ratewarden-etcd`)
//! - **Endpoint policy table** with exact, prefix, per-subject and default policies
//! - **Key strategies** by client IP, authenticated identity, or both
//! - **Tower middleware** answering `429` with `X-RateLimit-*` and `Retry-After`
//! - **Fail open**: a counter store outage never blocks traffic
//!
//! ## Quick Start
//!
//! ```rust
//! use ratewarden::{FixedWindowLimiter, InMemoryCounterStore, RatePolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RatePolicy::new(5, Duration::from_secs(60)).unwrap();
//!     let limiter = FixedWindowLimiter::new(InMemoryCounterStore::new(), policy);
//!
//!     let key = ratewarden::key::origin_key("203.0.113.4", "/auth/login");
//!     for _ in 0..5 {
//!         assert!(limiter.allow(key.as_str()).await);
//!     }
//!     assert!(!limiter.allow(key.as_str()).await);
//! }
//! ```
//!
//! ## As middleware
//!
//! ```rust
//! use ratewarden::config::RateLimitSettings;
//! use ratewarden::{FixedWindowLimiter, InMemoryCounterStore, RateLimitLayer};
//! use tower::ServiceBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = RateLimitSettings::default().policies()?;
//! let limiter = FixedWindowLimiter::new(InMemoryCounterStore::new(), catalog.default);
//! let svc = ServiceBuilder::new()
//!     .layer(RateLimitLayer::new(limiter, catalog.table()))
//!     .service_fn(|_req: http::Request<String>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("ok")))
//!     });
//! # let _ = svc;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod policy;
pub mod rate_limit;
pub mod window;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, LimiterError, PolicyError, StoreOperation};
pub use key::{ByIdentity, ByOrigin, Composite, Identity, KeyExtractor, RateLimitKey, Subject};
pub use policy::{EndpointPolicyTable, PolicyLookup, RatePolicy};
pub use rate_limit::{
    CounterStore, Decision, FixedWindowLimiter, InMemoryCounterStore, RateLimitLayer,
    RateLimitRecord, RateLimitService, RateLimiter,
};
