//! Key extraction strategies.
//!
//! A key names one bucket: a subject (network origin or authenticated caller)
//! scoped to one request path, so different endpoints never share a bucket.
//!
//! | Strategy | Key |
//! |---|---|
//! | [`ByOrigin`] | `ip:<address>:<path>` |
//! | [`ByIdentity`] | `user:<subject id>:<path>` |
//! | [`Composite`] | identity key if an [`Identity`] is present, else origin key |
//!
//! Identity is resolved upstream (authentication is not this crate's job) and
//! handed over as an [`Identity`] request extension. The peer address comes
//! from axum's `ConnectInfo<SocketAddr>` extension.

use axum::extract::ConnectInfo;
use http::{Extensions, HeaderMap, Request};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Header carrying the proxy chain; the first hop is the original client.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// What kind of caller a key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Keyed by IP address.
    Origin,
    /// Keyed by authenticated subject id.
    Identity,
    /// Produced by a caller-supplied extractor.
    Custom,
}

/// Authenticated caller id, inserted into request extensions by upstream auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// A rate limit key together with the subject it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKey {
    subject: Subject,
    key: String,
}

impl RateLimitKey {
    /// Wrap an already-formatted key.
    pub fn new(subject: Subject, key: impl Into<String>) -> Self {
        Self { subject, key: key.into() }
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn into_string(self) -> String {
        self.key
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Key for a network origin on `path`, e.g. `ip:203.0.113.4:/auth/login`.
pub fn origin_key(addr: impl fmt::Display, path: &str) -> RateLimitKey {
    RateLimitKey::new(Subject::Origin, format!("ip:{addr}:{path}"))
}

/// Key for an authenticated caller on `path`, e.g. `user:u-123:/users/profile`.
///
/// Business code uses this to clear a bucket the middleware charged, for
/// example failed login attempts after a successful login.
pub fn identity_key(subject_id: &str, path: &str) -> RateLimitKey {
    RateLimitKey::new(Subject::Identity, format!("user:{subject_id}:{path}"))
}

/// The parts of a request key extraction may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    path: &'a str,
    headers: &'a HeaderMap,
    extensions: &'a Extensions,
}

impl<'a> RequestMeta<'a> {
    pub fn new(path: &'a str, headers: &'a HeaderMap, extensions: &'a Extensions) -> Self {
        Self { path, headers, extensions }
    }

    pub fn from_request<B>(req: &'a Request<B>) -> Self {
        Self::new(req.uri().path(), req.headers(), req.extensions())
    }

    pub fn path(&self) -> &'a str {
        self.path
    }

    pub fn headers(&self) -> &'a HeaderMap {
        self.headers
    }

    pub fn extensions(&self) -> &'a Extensions {
        self.extensions
    }

    /// First hop of `X-Forwarded-For` if it parses as an IP, else the transport peer.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.forwarded_ip().or_else(|| {
            self.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip())
        })
    }

    /// Authenticated subject id, if upstream auth attached a non-empty one.
    pub fn identity(&self) -> Option<&'a str> {
        self.extensions
            .get::<Identity>()
            .map(|Identity(id)| id.as_str())
            .filter(|id| !id.is_empty())
    }

    fn forwarded_ip(&self) -> Option<IpAddr> {
        let chain = self.headers.get(X_FORWARDED_FOR)?.to_str().ok()?;
        chain.split(',').next()?.trim().parse().ok()
    }
}

/// Derives the rate limit key for a request.
///
/// `None` means the request could not be classified; the middleware lets
/// such requests through unconditionally.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, req: &RequestMeta<'_>) -> Option<RateLimitKey>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&RequestMeta<'_>) -> Option<RateLimitKey> + Send + Sync,
{
    fn extract(&self, req: &RequestMeta<'_>) -> Option<RateLimitKey> {
        self(req)
    }
}

/// Key by client IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByOrigin;

impl KeyExtractor for ByOrigin {
    fn extract(&self, req: &RequestMeta<'_>) -> Option<RateLimitKey> {
        req.client_ip().map(|ip| origin_key(ip, req.path()))
    }
}

/// Key by authenticated identity only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByIdentity;

impl KeyExtractor for ByIdentity {
    fn extract(&self, req: &RequestMeta<'_>) -> Option<RateLimitKey> {
        req.identity().map(|id| identity_key(id, req.path()))
    }
}

/// Identity when present, otherwise client IP. The production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Composite;

impl KeyExtractor for Composite {
    fn extract(&self, req: &RequestMeta<'_>) -> Option<RateLimitKey> {
        ByIdentity.extract(req).or_else(|| ByOrigin.extract(req))
    }
}
