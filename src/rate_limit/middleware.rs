use crate::key::{Composite, KeyExtractor, RequestMeta};
use crate::policy::{PolicyLookup, RatePolicy};
use crate::rate_limit::{log_fail_open, Decision, RateLimiter};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Requests allowed per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which the current window ends.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// For every request it extracts a key, resolves the policy for the request
/// path, and counts the request. Denied requests get a `429` without reaching
/// the inner service. Allowed requests are forwarded and successful responses
/// are decorated with `X-RateLimit-*` headers.
///
/// Requests that yield no key, and requests arriving while the counter store
/// is unavailable, are forwarded untouched.
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    extractor: Arc<dyn KeyExtractor>,
    policies: Arc<dyn PolicyLookup>,
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer using the [`Composite`] key strategy.
    pub fn new<P>(limiter: L, policies: P) -> Self
    where
        P: PolicyLookup + 'static,
    {
        Self::shared(Arc::new(limiter), policies)
    }

    /// Like [`new`](Self::new), for a limiter the application also holds
    /// (for example to `reset` keys from handlers).
    pub fn shared<P>(limiter: Arc<L>, policies: P) -> Self
    where
        P: PolicyLookup + 'static,
    {
        Self { limiter, extractor: Arc::new(Composite), policies: Arc::new(policies) }
    }

    /// Replace the key extraction strategy.
    pub fn with_extractor<K>(mut self, extractor: K) -> Self
    where
        K: KeyExtractor + 'static,
    {
        self.extractor = Arc::new(extractor);
        self
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            policies: self.policies.clone(),
        }
    }
}

impl<L> fmt::Debug for RateLimitLayer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").finish_non_exhaustive()
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            policies: self.policies.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    extractor: Arc<dyn KeyExtractor>,
    policies: Arc<dyn PolicyLookup>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            policies: self.policies.clone(),
        }
    }
}

impl<S: fmt::Debug, L> fmt::Debug for RateLimitService<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, L, B, ResBody> Service<Request<B>> for RateLimitService<S, L>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: RateLimiter + 'static,
    B: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Only `self.inner` was driven to readiness; hand that instance to the future.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let target = {
            let meta = RequestMeta::from_request(&req);
            self.extractor.extract(&meta).map(|key| {
                let policy = self.policies.resolve(meta.path(), key.subject());
                (key, policy)
            })
        };

        Box::pin(async move {
            let Some((key, policy)) = target else {
                tracing::debug!(
                    target: "ratewarden::middleware",
                    path = %req.uri().path(),
                    "no rate limit key for request; allowing"
                );
                return inner.call(req).await;
            };

            let decision = match limiter.acquire(key.as_str(), policy).await {
                Ok(decision) => decision,
                Err(err) => {
                    log_fail_open("middleware", &err);
                    return inner.call(req).await;
                }
            };

            if let Decision::Denied { limit, reset_at, retry_after } = decision {
                tracing::debug!(
                    target: "ratewarden::middleware",
                    key = %key,
                    path = %req.uri().path(),
                    limit,
                    "rate limit exceeded"
                );
                return Ok(quota_exceeded(limit, reset_at, retry_after.as_secs()));
            }

            let mut response = inner.call(req).await?;
            if response.status().is_success() {
                decorate(&*limiter, key.as_str(), policy, decision.reset_at(), response.headers_mut())
                    .await;
            }
            Ok(response)
        })
    }
}

async fn decorate<L>(limiter: &L, key: &str, policy: RatePolicy, reset_at: u64, headers: &mut HeaderMap)
where
    L: RateLimiter + ?Sized,
{
    match limiter.remaining(key, policy).await {
        Ok(remaining) => insert_quota_headers(headers, policy.limit(), remaining, reset_at),
        Err(err) => {
            tracing::debug!(
                target: "ratewarden::middleware",
                key = %key,
                error = %err,
                "skipping quota headers; remaining count unavailable"
            );
        }
    }
}

fn insert_quota_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_at: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at.div_ceil(1000)));
}

fn quota_exceeded<B>(limit: u32, reset_at: u64, retry_after_secs: u64) -> Response<B>
where
    B: From<String>,
{
    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": format!("Too many requests. Retry after {retry_after_secs} seconds."),
    });
    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    insert_quota_headers(headers, limit, 0, reset_at);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_response_shape() {
        let response: Response<String> = quota_exceeded(5, 60_000, 42);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let h = response.headers();
        assert_eq!(h[X_RATELIMIT_LIMIT], "5");
        assert_eq!(h[X_RATELIMIT_REMAINING], "0");
        assert_eq!(h[X_RATELIMIT_RESET], "60");
        assert_eq!(h[RETRY_AFTER], "42");
        assert_eq!(h[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert!(body["message"].as_str().unwrap().contains("42"));
    }

    #[test]
    fn reset_header_rounds_up_to_whole_seconds() {
        let mut headers = HeaderMap::new();
        insert_quota_headers(&mut headers, 10, 3, 60_001);
        assert_eq!(headers[X_RATELIMIT_RESET], "61");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "3");
    }
}
