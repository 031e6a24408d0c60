//! Per-client throttling in front of every route.
//!
//! Only login, cron and admin traffic is counted. The gatekeeper never looks
//! at credentials; handlers authenticate after it lets a request through.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::error::ApiError;
use crate::rate_limit::{now_ms, RateLimiter, RatePolicy};

const WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Login,
    Cron,
    Admin,
}

impl RouteClass {
    /// `None` means the request is not throttled.
    pub fn classify(method: &Method, path: &str) -> Option<Self> {
        if path == "/admin/login" {
            return (method == Method::POST).then_some(Self::Login);
        }
        if path.starts_with("/cron/") {
            return (method == Method::POST).then_some(Self::Cron);
        }
        if path.starts_with("/admin/") {
            return Some(Self::Admin);
        }
        None
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Cron => "cron",
            Self::Admin => "admin",
        }
    }

    pub fn policy(self) -> RatePolicy {
        let limit = match self {
            Self::Login => 5,
            Self::Cron => 10,
            Self::Admin => 30,
        };
        RatePolicy {
            limit,
            window_ms: WINDOW_MS,
        }
    }

    fn denied_message(self) -> &'static str {
        match self {
            Self::Login => "Too many login attempts. Please try again later.",
            Self::Cron | Self::Admin => "Too many requests. Please try again later.",
        }
    }
}

/// Client identity from proxy headers, most trusted first.
pub fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    header("cf-connecting-ip")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .unwrap_or("unknown")
        .to_string()
}

pub async fn gatekeeper(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(class) = RouteClass::classify(req.method(), req.uri().path()) else {
        return next.run(req).await;
    };

    let ip = client_ip(req.headers());
    let key = format!("{ip}:{}", class.label());
    let now = now_ms();
    let decision = limiter.check(&key, class.policy(), now);

    if !decision.allowed {
        tracing::warn!(client = %ip, class = class.label(), "rate limit exceeded");
        metrics::counter!("forecaster_rate_limited_total", "class" => class.label()).increment(1);
        return ApiError::RateLimited {
            message: class.denied_message(),
            retry_after_secs: decision.retry_after_secs(now),
            limit: (class == RouteClass::Login).then_some(decision.limit),
        }
        .into_response();
    }

    let mut response = next.run(req).await;
    if class == RouteClass::Login {
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    }
    response
}
