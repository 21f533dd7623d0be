//! Tower middleware that rate limits HTTP requests.
//!
//! Every response that went through a successful check carries the
//! `X-RateLimit-*` headers. Denied requests get a `429` with a JSON body and
//! never reach the inner service. When the limiter itself fails the request
//! is let through without headers, so an unavailable store degrades to no
//! rate limiting rather than an outage.

mod extractor;

pub use extractor::{HeaderValueOrIp, IdentifierExtractor, SourceIp, UNKNOWN_IDENTIFIER};

use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use crate::ratelimit::{RateLimitConfig, RateLimitResult, RateLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Builds per-endpoint [`RateLimitLayer`]s over a shared limiter.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    extractor: Arc<dyn IdentifierExtractor>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, extractor: impl IdentifierExtractor + 'static) -> Self {
        Self {
            limiter,
            extractor: Arc::new(extractor),
        }
    }

    /// A layer limiting requests against `endpoint`.
    ///
    /// With `config` set, it is passed to every check in place of the
    /// endpoint's registered configuration.
    pub fn layer(&self, endpoint: impl Into<String>, config: Option<RateLimitConfig>) -> RateLimitLayer {
        RateLimitLayer {
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            endpoint: Arc::from(endpoint.into()),
            config: config.map(Arc::new),
        }
    }
}

impl std::fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    extractor: Arc<dyn IdentifierExtractor>,
    endpoint: Arc<str>,
    config: Option<Arc<RateLimitConfig>>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            endpoint: self.endpoint.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    extractor: Arc<dyn IdentifierExtractor>,
    endpoint: Arc<str>,
    config: Option<Arc<RateLimitConfig>>,
}

impl<S, B, ResBody> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    B: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // Drive the clone that was polled ready and leave a fresh one behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let limiter = self.limiter.clone();
        let endpoint = self.endpoint.clone();
        let config = self.config.clone();

        let (parts, body) = request.into_parts();
        let identifier = self.extractor.extract(&parts);
        let request = Request::from_parts(parts, body);

        Box::pin(async move {
            let checked = limiter
                .check_limit(&identifier, &endpoint, config.as_deref())
                .await;

            match checked {
                Ok(result) if result.allowed => {
                    let mut response = inner.call(request).await?;
                    insert_rate_limit_headers(response.headers_mut(), &result);
                    Ok(response)
                }
                Ok(result) => Ok(too_many_requests(&result)),
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        identifier = %identifier,
                        error = %e,
                        "Rate limit check failed, allowing request"
                    );
                    inner.call(request).await
                }
            }
        })
    }
}

/// Set the `X-RateLimit-*` headers, plus `Retry-After` on denial.
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_time_secs()));
    if let Some(retry_after) = result.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

/// The `429` response for a denied check.
pub fn too_many_requests<ResBody: From<String>>(result: &RateLimitResult) -> Response<ResBody> {
    let body = json!({
        "error": "Rate limit exceeded",
        "retryAfter": result.retry_after,
        "limit": result.limit(),
        "remaining": result.remaining,
        "resetTime": result.reset_time,
    });

    let mut response = Response::new(ResBody::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    insert_rate_limit_headers(headers, result);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, RateLimitStore};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn limiter_at(now: i64) -> (Arc<MemoryStore>, Arc<RateLimiter>) {
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(store.clone()).with_clock(clock);
        (store, Arc::new(limiter))
    }

    fn request_from(ip: &str) -> Request<String> {
        Request::builder()
            .uri("/login")
            .header("x-forwarded-for", ip)
            .body(String::new())
            .unwrap()
    }

    fn header<'a>(response: &'a Response<String>, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// An inner service that counts how often it is reached.
    fn counting_service(
        calls: Arc<AtomicUsize>,
    ) -> impl Service<Request<String>, Response = Response<String>, Error = Infallible, Future = impl Send>
           + Clone
           + Send
           + 'static {
        service_fn(move |_request: Request<String>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new("ok".to_string()))
            }
        })
    }

    #[tokio::test]
    async fn test_allowed_request_gets_headers() {
        let (_store, limiter) = limiter_at(10_000);
        limiter
            .register_endpoint("login", RateLimitConfig::fixed_window(60_000, 5))
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitMiddleware::new(limiter, SourceIp).layer("login", None);

        let response = layer
            .layer(counting_service(calls.clone()))
            .oneshot(request_from("203.0.113.9"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok");
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("5"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("4"));
        assert_eq!(header(&response, "x-ratelimit-reset"), Some("60"));
        assert_eq!(header(&response, "retry-after"), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_gets_429() {
        let (_store, limiter) = limiter_at(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RateLimitConfig::sliding_window(60_000, 1);
        let layer = RateLimitMiddleware::new(limiter, SourceIp).layer("login", Some(config));
        let service = layer.layer(counting_service(calls.clone()));

        service.clone().oneshot(request_from("203.0.113.9")).await.unwrap();
        let response = service.oneshot(request_from("203.0.113.9")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "content-type"), Some("application/json"));
        assert_eq!(header(&response, "retry-after"), Some("60"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(
            body,
            json!({
                "error": "Rate limit exceeded",
                "retryAfter": 60,
                "limit": 2,
                "remaining": 0,
                "resetTime": 60_000,
            })
        );
    }

    #[tokio::test]
    async fn test_identifiers_are_limited_separately() {
        let (_store, limiter) = limiter_at(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RateLimitConfig::fixed_window(60_000, 1);
        let service = RateLimitMiddleware::new(limiter, SourceIp)
            .layer("login", Some(config))
            .layer(counting_service(calls.clone()));

        for ip in ["203.0.113.9", "198.51.100.4"] {
            let response = service.clone().oneshot(request_from(ip)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let (store, limiter) = limiter_at(0);
        limiter
            .register_endpoint("login", RateLimitConfig::token_bucket(60_000, 1))
            .unwrap();
        store.close().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let service = RateLimitMiddleware::new(limiter, SourceIp)
            .layer("login", None)
            .layer(counting_service(calls.clone()));

        for _ in 0..3 {
            let response = service.clone().oneshot(request_from("203.0.113.9")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header(&response, "x-ratelimit-limit"), None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_fails_open() {
        let (_store, limiter) = limiter_at(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = RateLimitMiddleware::new(limiter, SourceIp)
            .layer("nowhere", None)
            .layer(counting_service(calls.clone()));

        let response = service.oneshot(request_from("203.0.113.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_header_rounds_up_to_seconds() {
        let result = RateLimitResult::new(true, 3, 2, 0, 1_500, 0);
        let mut headers = HeaderMap::new();
        insert_rate_limit_headers(&mut headers, &result);

        assert_eq!(headers[&X_RATELIMIT_RESET], "2");
        assert_eq!(headers[&X_RATELIMIT_LIMIT], "5");
        assert!(headers.get(RETRY_AFTER).is_none());
    }
}
