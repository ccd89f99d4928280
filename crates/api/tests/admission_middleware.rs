use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::Request,
    http::{StatusCode, header},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use serde_json::Value;
use tower::ServiceExt;

use taskgate_api::{AdmissionState, PrincipalContext, with_admission};
use taskgate_infra::ratelimit::{
    InMemoryRateLimiter, RateLimitDecision, RateLimitError, RateLimitPolicy, RateLimitRule,
    RateLimiter,
};

fn policy() -> RateLimitPolicy {
    RateLimitPolicy::new(RateLimitRule::new(10, Duration::from_secs(60)))
        .with_override("/api/auth", RateLimitRule::new(5, Duration::from_secs(60)))
        .with_exempt("/health")
}

fn app_with(limiter: Arc<dyn RateLimiter>) -> Router {
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/jobs", get(|| async { "jobs" }))
        .route("/api/auth/login", post(|| async { "token" }));
    with_admission(router, AdmissionState::new(limiter, policy()))
}

fn app() -> Router {
    app_with(Arc::new(InMemoryRateLimiter::new()))
}

fn get_from(uri: &str, client_ip: &str) -> Request {
    axum::http::Request::builder()
        .uri(uri)
        .header("x-forwarded-for", client_ip)
        .body(Body::empty())
        .unwrap()
}

fn login_from(client_ip: &str) -> Request {
    axum::http::Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("x-forwarded-for", client_ip)
        .body(Body::empty())
        .unwrap()
}

fn header_u64(response: &Response, name: &str) -> u64 {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}

#[tokio::test]
async fn admitted_responses_carry_rate_limit_headers() {
    let app = app();

    let first = app.clone().oneshot(get_from("/api/jobs", "198.51.100.1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_u64(&first, "x-ratelimit-limit"), 10);
    assert_eq!(header_u64(&first, "x-ratelimit-remaining"), 9);
    assert!(header_u64(&first, "x-ratelimit-reset") > 0);
    assert!(first.headers().get(header::RETRY_AFTER).is_none());

    let second = app.oneshot(get_from("/api/jobs", "198.51.100.1")).await.unwrap();
    assert_eq!(header_u64(&second, "x-ratelimit-remaining"), 8);
}

#[tokio::test]
async fn sixth_login_attempt_is_rejected() {
    let app = app();

    for remaining in (0..5).rev() {
        let response = app.clone().oneshot(login_from("203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_u64(&response, "x-ratelimit-remaining"), remaining);
    }

    let rejected = app.oneshot(login_from("203.0.113.7")).await.unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_u64(&rejected, "x-ratelimit-limit"), 5);
    assert_eq!(header_u64(&rejected, "x-ratelimit-remaining"), 0);

    let retry_after = header_u64(&rejected, "retry-after");
    assert!((1..=60).contains(&retry_after));

    let body = to_bytes(rejected.into_body(), 64 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["retry_after"], retry_after);
}

#[tokio::test]
async fn exempt_paths_are_never_limited() {
    let app = app();

    for _ in 0..20 {
        let response = app.clone().oneshot(get_from("/health", "198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn callers_and_routes_have_separate_budgets() {
    let app = app();

    for _ in 0..5 {
        app.clone().oneshot(login_from("203.0.113.7")).await.unwrap();
    }
    let blocked = app.clone().oneshot(login_from("203.0.113.7")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

    let other_caller = app.clone().oneshot(login_from("203.0.113.8")).await.unwrap();
    assert_eq!(other_caller.status(), StatusCode::OK);

    let other_route = app.oneshot(get_from("/api/jobs", "203.0.113.7")).await.unwrap();
    assert_eq!(other_route.status(), StatusCode::OK);
    assert_eq!(header_u64(&other_route, "x-ratelimit-remaining"), 9);
}

#[tokio::test]
async fn api_key_outranks_forwarded_address() {
    let app = app();

    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"] {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("x-api-key", "svc-key")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("x-api-key", "svc-key")
        .header("x-forwarded-for", "10.0.0.6")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
}

async fn authenticate(mut req: Request, next: Next) -> Response {
    if let Some(user) = req
        .headers()
        .get("x-test-user")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    {
        req.extensions_mut().insert(PrincipalContext::new(user));
    }
    next.run(req).await
}

#[tokio::test]
async fn authenticated_principal_is_limited_across_addresses() {
    let app = app().layer(middleware::from_fn(authenticate));

    for n in 0..6 {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("x-test-user", "alice")
            .header("x-forwarded-for", format!("10.1.0.{n}"))
            .body(Body::empty())
            .unwrap();
        let status = app.clone().oneshot(req).await.unwrap().status();
        let expected = if n < 5 {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        };
        assert_eq!(status, expected, "request {n}");
    }
}

struct UnreachableLimiter;

#[async_trait]
impl RateLimiter for UnreachableLimiter {
    async fn is_allowed(
        &self,
        _key: &str,
        _rule: &RateLimitRule,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Err(RateLimitError::Backend("connection refused".into()))
    }
}

#[tokio::test]
async fn backend_outage_fails_open() {
    let app = app_with(Arc::new(UnreachableLimiter));

    for _ in 0..10 {
        let response = app.clone().oneshot(login_from("203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}
