//! IP allowlist + rate-limit middleware (C10/C11 wired into axum).
//!
//! Two `middleware::from_fn_with_state` layers guarding the webhook
//! management surface, applied in order: [`allowlist_layer`] rejects with
//! `403` before [`rate_limit_layer`] even runs, matching the gateway's
//! `auth_middleware`-then-handler layering in `gateway/router.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRef, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::allowlist::Allowlist;
use super::rate_limiter::RateLimiter;

/// Shared state for both middleware layers, wired up once per router.
#[derive(Clone)]
pub struct SecurityState {
    /// CIDR/literal allowlist guarding the path prefix
    pub allowlist: Arc<Allowlist>,
    /// Sliding-window limiter keyed by client IP
    pub rate_limiter: Arc<RateLimiter>,
}

impl FromRef<SecurityState> for Arc<Allowlist> {
    fn from_ref(state: &SecurityState) -> Self {
        Arc::clone(&state.allowlist)
    }
}

impl FromRef<SecurityState> for Arc<RateLimiter> {
    fn from_ref(state: &SecurityState) -> Self {
        Arc::clone(&state.rate_limiter)
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}

/// Reject requests from addresses outside the configured allowlist with
/// `403`. An empty allowlist passes everything through.
pub async fn allowlist_layer(
    State(allowlist): State<Arc<Allowlist>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !allowlist.is_allowed(addr.ip()) {
        warn!(client_ip = %addr.ip(), "rejected by webhook management allowlist");
        return error_response(
            StatusCode::FORBIDDEN,
            "ip_not_allowed",
            "client address is not on the allowlist",
        );
    }
    next.run(request).await
}

/// Enforce the sliding-window limit for the requesting IP, attaching
/// `X-RateLimit-*` headers on pass-through and `Retry-After` on `429`.
pub async fn rate_limit_layer(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let key = addr.ip().to_string();

    if limiter.is_rate_limited(&key) {
        let retry_after = limiter
            .reset_time(&key)
            .map_or(1, |reset| reset.saturating_duration_since(std::time::Instant::now()).as_secs().max(1));
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many requests, slow down",
        );
        response.headers_mut().insert(
            HeaderName::from_static("retry-after"),
            HeaderValue::from_str(&retry_after.to_string()).unwrap_or(HeaderValue::from_static("1")),
        );
        return response;
    }

    limiter.add_request(&key);
    let mut response = next.run(request).await;
    insert_rate_limit_headers(response.headers_mut(), &limiter, &key);
    response
}

fn insert_rate_limit_headers(headers: &mut axum::http::HeaderMap, limiter: &RateLimiter, key: &str) {
    if let Ok(value) = HeaderValue::from_str(&limiter.limit().to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }
    let remaining = limiter.remaining(key);
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }
    if let Some(reset) = limiter.reset_time(key) {
        let seconds = reset.saturating_duration_since(std::time::Instant::now()).as_secs();
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn make_router(state: SecurityState) -> Router {
        Router::new()
            .route("/webhooks", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state.rate_limiter.clone(), rate_limit_layer))
            .layer(axum::middleware::from_fn_with_state(state.allowlist.clone(), allowlist_layer))
    }

    fn request_from(ip: &str) -> Request<Body> {
        let mut request = Request::builder().uri("/webhooks").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(SocketAddr::new(ip.parse().unwrap(), 0)));
        request
    }

    #[tokio::test]
    async fn disallowed_ip_gets_403() {
        let state = SecurityState {
            allowlist: Arc::new(Allowlist::from_entries(["10.0.0.1"]).unwrap()),
            rate_limiter: Arc::new(RateLimiter::new(100, Duration::from_secs(60))),
        };
        let router = make_router(state);
        let response = router.oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allowed_ip_passes_through_with_rate_limit_headers() {
        let state = SecurityState {
            allowlist: Arc::new(Allowlist::new()),
            rate_limiter: Arc::new(RateLimiter::new(5, Duration::from_secs(60))),
        };
        let router = make_router(state);
        let response = router.oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "5");
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    #[tokio::test]
    async fn exhausted_limit_returns_429_with_retry_after() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
        let state = SecurityState { allowlist: Arc::new(Allowlist::new()), rate_limiter: limiter };
        let router = make_router(state);
        let first = router.clone().oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = router.oneshot(request_from("10.0.0.2")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }
}
