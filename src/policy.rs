//! Rate policies and the endpoint policy table.
//!
//! A [`RatePolicy`] is a validated `(limit, window)` pair. The
//! [`EndpointPolicyTable`] maps request paths to policies: exact matches win,
//! then the longest matching prefix, then a per-subject tier (origin or
//! identity) if one is configured, then the default.

use crate::error::PolicyError;
use crate::key::Subject;
use std::collections::HashMap;
use std::time::Duration;

/// A validated `(limit, window)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RatePolicy {
    limit: u32,
    window: Duration,
}

impl RatePolicy {
    /// Create a policy allowing `limit` requests per `window`.
    ///
    /// Errors with [`PolicyError::MalformedPolicy`] if `limit` is zero or the
    /// window is shorter than one millisecond.
    ///
    /// # Examples
    /// ```
    /// use ratewarden::RatePolicy;
    /// use std::time::Duration;
    /// let login = RatePolicy::new(5, Duration::from_secs(15 * 60)).unwrap();
    /// assert_eq!(login.limit(), 5);
    /// assert!(RatePolicy::new(0, Duration::from_secs(60)).is_err());
    /// ```
    pub fn new(limit: u32, window: Duration) -> Result<Self, PolicyError> {
        if limit == 0 || window < Duration::from_millis(1) {
            return Err(PolicyError::MalformedPolicy { limit, window });
        }
        Ok(Self { limit, window })
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Window duration.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Resolves the policy for a request.
///
/// Selected once at configuration time and shared by every request; closures
/// of the form `Fn(&str, Subject) -> RatePolicy` implement it too.
pub trait PolicyLookup: Send + Sync {
    /// Policy for `path` when the caller was classified as `subject`.
    fn resolve(&self, path: &str, subject: Subject) -> RatePolicy;
}

impl<F> PolicyLookup for F
where
    F: Fn(&str, Subject) -> RatePolicy + Send + Sync,
{
    fn resolve(&self, path: &str, subject: Subject) -> RatePolicy {
        self(path, subject)
    }
}

/// Static mapping from request path to policy.
#[derive(Debug, Clone)]
pub struct EndpointPolicyTable {
    exact: HashMap<String, RatePolicy>,
    // Kept sorted longest-first so the first hit is the longest prefix.
    prefixes: Vec<(String, RatePolicy)>,
    origin: Option<RatePolicy>,
    identity: Option<RatePolicy>,
    default: RatePolicy,
}

impl EndpointPolicyTable {
    /// Empty table that resolves everything to `default`.
    pub fn new(default: RatePolicy) -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            origin: None,
            identity: None,
            default,
        }
    }

    /// Apply `policy` to requests whose path equals `path`.
    pub fn with_exact(
        mut self,
        path: impl Into<String>,
        policy: RatePolicy,
    ) -> Result<Self, PolicyError> {
        let path = validate_path(path.into())?;
        self.exact.insert(path, policy);
        Ok(self)
    }

    /// Apply `policy` to requests under `prefix`, matched on segment boundaries:
    /// `/admin` covers `/admin` and `/admin/users` but not `/administrator`.
    pub fn with_prefix(
        mut self,
        prefix: impl Into<String>,
        policy: RatePolicy,
    ) -> Result<Self, PolicyError> {
        let prefix = validate_path(prefix.into())?;
        self.prefixes.retain(|(existing, _)| existing != &prefix);
        self.prefixes.push((prefix, policy));
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(self)
    }

    /// Fallback for unmatched paths when the key is derived from network origin.
    pub fn with_origin_tier(mut self, policy: RatePolicy) -> Self {
        self.origin = Some(policy);
        self
    }

    /// Fallback for unmatched paths when the key is derived from caller identity.
    pub fn with_identity_tier(mut self, policy: RatePolicy) -> Self {
        self.identity = Some(policy);
        self
    }

    /// Final fallback policy.
    pub fn default_policy(&self) -> RatePolicy {
        self.default
    }

    /// Endpoint-specific policy for `path`, ignoring tiers and the default.
    pub fn endpoint(&self, path: &str) -> Option<RatePolicy> {
        if let Some(policy) = self.exact.get(path) {
            return Some(*policy);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, policy)| *policy)
    }
}

impl PolicyLookup for EndpointPolicyTable {
    fn resolve(&self, path: &str, subject: Subject) -> RatePolicy {
        if let Some(policy) = self.endpoint(path) {
            return policy;
        }
        let tier = match subject {
            Subject::Origin => self.origin,
            Subject::Identity => self.identity,
            Subject::Custom => None,
        };
        tier.unwrap_or(self.default)
    }
}

fn validate_path(path: String) -> Result<String, PolicyError> {
    if !path.starts_with('/') {
        return Err(PolicyError::InvalidPath { path });
    }
    Ok(path)
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
