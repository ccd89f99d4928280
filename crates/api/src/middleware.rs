use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use taskgate_infra::ratelimit::{
    ClientIdentity, ClientKey, RateLimitDecision, RateLimitPolicy, RateLimiter,
};

use crate::context::PrincipalContext;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_API_KEY: &str = "x-api-key";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Clone)]
pub struct AdmissionState {
    pub limiter: Arc<dyn RateLimiter>,
    pub policy: Arc<RateLimitPolicy>,
}

impl AdmissionState {
    pub fn new(limiter: Arc<dyn RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self {
            limiter,
            policy: Arc::new(policy),
        }
    }
}

/// Wrap every route of `router` in admission control.
pub fn with_admission<S>(router: Router<S>, state: AdmissionState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(state, admission_middleware))
}

/// Per-caller rate limiting in front of the handlers.
///
/// Exempt paths pass straight through. Admitted responses carry the
/// `X-RateLimit-*` headers; rejected requests get `429` with `Retry-After`.
/// If the limiter backend is unreachable the request is admitted.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(route) = state.policy.rule_for(req.uri().path()) else {
        return next.run(req).await;
    };

    let key = client_key(&req).scoped(route.scope);

    match state.limiter.is_allowed(&key, &route.rule).await {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(req).await;
            set_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Ok(decision) => {
            debug!(key = %key, limit = decision.limit, "request rate limited");
            too_many_requests(&decision)
        }
        Err(e) => {
            warn!(key = %key, error = %e, "rate limiter unavailable, admitting request");
            next.run(req).await
        }
    }
}

fn client_key(req: &Request) -> ClientKey {
    let headers = req.headers();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    ClientKey::derive(&ClientIdentity {
        user_id: req
            .extensions()
            .get::<PrincipalContext>()
            .map(PrincipalContext::principal_id),
        api_key: header_str(headers, X_API_KEY),
        forwarded_for: header_str(headers, X_FORWARDED_FOR),
        peer,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix()));
}

fn too_many_requests(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs().unwrap_or(1);

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limited",
            "message": "Too many requests",
            "retry_after": retry_after,
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    set_rate_limit_headers(headers, decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
