pub mod admin;
pub mod cron;
pub mod public;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use common::config::{Config, Secrets};
use common::db::AsyncDb;
use common::polymarket::PolymarketClient;
use common::security::verify_cron_secret;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::gatekeeper::gatekeeper;
use crate::rate_limit::{now_ms, RateLimiter};
use crate::session;

/// Shared application state available to all handlers.
pub struct AppState {
    pub db: AsyncDb,
    pub config: Arc<Config>,
    pub secrets: Secrets,
    pub limiter: Arc<RateLimiter>,
    pub market_source: Arc<PolymarketClient>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// `None` when no Prometheus recorder is installed (tests).
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wrap a failure as a 500, exposing the chain outside production.
    pub fn internal(&self, err: impl Into<anyhow::Error>) -> ApiError {
        ApiError::internal(err, !self.config.is_production())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/leaderboard", get(public::leaderboard))
        .route("/decisions/recent", get(public::recent_decisions))
        .route("/health", get(public::health))
        .route("/metrics", get(public::metrics));

    // Admin handlers authenticate through the `AdminSession` extractor.
    let admin = Router::new()
        .route("/admin/login", post(admin::login).delete(admin::logout))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/logs", get(admin::logs));

    let cron = Router::new()
        .route("/cron/sync-markets", post(cron::sync_markets))
        .route("/cron/maintenance", post(cron::maintenance))
        .layer(middleware::from_fn_with_state(state.clone(), cron_auth));

    public
        .merge(admin)
        .merge(cron)
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            gatekeeper,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Proof that the request carries a valid admin session cookie.
pub struct AdminSession;

impl FromRequestParts<Arc<AppState>> for AdminSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = state.secrets.session_key().ok_or(ApiError::Unauthorized)?;
        let token = session::cookie_value(&parts.headers, session::SESSION_COOKIE)
            .ok_or(ApiError::Unauthorized)?;
        if session::validate(&token, key, now_ms()) {
            Ok(Self)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

/// Bearer-secret check for cron routes. Fails closed when no secret is configured.
async fn cron_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.secrets.cron_secret.as_deref() else {
        tracing::warn!("cron request rejected: CRON_SECRET is not configured");
        return ApiError::Unauthorized.into_response();
    };

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if verify_cron_secret(token, expected) => next.run(req).await,
        _ => {
            tracing::warn!(path = %req.uri().path(), "cron request rejected: bad bearer token");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Lenient integer query parameter: missing, unparseable or < 1 gives
/// `default`; anything above `max` is clamped.
pub fn parse_int_param(raw: Option<&str>, default: u32, max: u32) -> u32 {
    match raw.and_then(|s| s.trim().parse::<i64>().ok()) {
        Some(n) if n >= 1 => u32::try_from(n.min(i64::from(max))).unwrap_or(max),
        _ => default,
    }
}

/// Headers for admin responses that must never be cached.
pub fn no_cache_headers() -> [(HeaderName, HeaderValue); 2] {
    [
        (
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate"),
        ),
        (header::PRAGMA, HeaderValue::from_static("no-cache")),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use common::db::AsyncDb;
    use std::time::Duration;

    pub const ADMIN_PASSWORD: &str = "correct horse battery staple";
    pub const CRON_SECRET: &str = "cron-secret-value";

    pub fn full_secrets() -> Secrets {
        Secrets {
            admin_password: Some(ADMIN_PASSWORD.to_string()),
            cron_secret: Some(CRON_SECRET.to_string()),
            openrouter_api_key: Some("sk-or-test".to_string()),
            session_secret: None,
        }
    }

    pub async fn state_with(secrets: Secrets) -> Arc<AppState> {
        let mut config =
            Config::from_toml_str(include_str!("../../../../config/default.toml")).unwrap();
        // Nothing listens on port 1, so any real fetch fails fast.
        config.polymarket.gamma_api_url = "http://127.0.0.1:1".to_string();
        let db = AsyncDb::open(":memory:").await.unwrap();
        Arc::new(AppState {
            db,
            market_source: Arc::new(
                PolymarketClient::new(&config.polymarket.gamma_api_url, Duration::from_secs(2))
                    .unwrap(),
            ),
            config: Arc::new(config),
            secrets,
            limiter: Arc::new(RateLimiter::new()),
            started_at: chrono::Utc::now(),
            metrics: None,
        })
    }

    pub async fn test_state() -> Arc<AppState> {
        state_with(full_secrets()).await
    }

    pub fn admin_cookie() -> String {
        let token = session::issue(session::ADMIN_ROLE, ADMIN_PASSWORD.as_bytes()).unwrap();
        format!("{}={token}", session::SESSION_COOKIE)
    }

    pub fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::get;
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_parse_int_param() {
        assert_eq!(parse_int_param(None, 10, 50), 10);
        assert_eq!(parse_int_param(Some("abc"), 10, 50), 10);
        assert_eq!(parse_int_param(Some("0"), 10, 50), 10);
        assert_eq!(parse_int_param(Some("-5"), 10, 50), 10);
        assert_eq!(parse_int_param(Some("7"), 10, 50), 7);
        assert_eq!(parse_int_param(Some(" 25 "), 10, 50), 25);
        assert_eq!(parse_int_param(Some("5000"), 100, 500), 500);
        assert_eq!(parse_int_param(Some("99999999999999"), 100, 500), 500);
    }

    #[tokio::test]
    async fn test_admin_routes_require_session() {
        let app = router(test_state().await);
        for uri in ["/admin/stats", "/admin/logs"] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(body_json(response).await["error"], "Unauthorized");
        }
    }

    #[tokio::test]
    async fn test_session_signed_with_other_key_is_rejected() {
        let mut secrets = full_secrets();
        secrets.session_secret = Some("dedicated-session-key".to_string());
        let app = router(state_with(secrets).await);

        // Signed with the admin password, but the dedicated key takes precedence.
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin/stats")
                    .header("cookie", admin_cookie())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cron_requires_bearer_secret() {
        let app = router(test_state().await);
        let cases = [
            None,
            Some("Bearer wrong".to_string()),
            Some(CRON_SECRET.to_string()),
            Some(format!("Basic {CRON_SECRET}")),
        ];
        for auth in cases {
            let mut req = axum::http::Request::builder()
                .method("POST")
                .uri("/cron/maintenance");
            if let Some(auth) = &auth {
                req = req.header("authorization", auth);
            }
            let response = app
                .clone()
                .oneshot(req.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
        }
    }

    #[tokio::test]
    async fn test_cron_fails_closed_without_configured_secret() {
        let mut secrets = full_secrets();
        secrets.cron_secret = None;
        let app = router(state_with(secrets).await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/cron/maintenance")
                    .header("authorization", "Bearer ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cron_throttle_counts_rejected_secrets() {
        let app = router(test_state().await);
        let bad = || {
            axum::http::Request::builder()
                .method("POST")
                .uri("/cron/maintenance")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap()
        };
        for _ in 0..10 {
            let response = app.clone().oneshot(bad()).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        let response = app.oneshot(bad()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_json(response).await["error"],
            "Too many requests. Please try again later."
        );
    }

    #[tokio::test]
    async fn test_admin_throttle_applies_before_auth() {
        let state = test_state().await;
        let app = router(state.clone());
        for _ in 0..30 {
            let response = app.clone().oneshot(get("/admin/stats")).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        let response = app.oneshot(get("/admin/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(state.limiter.len(), 1);
    }
}
