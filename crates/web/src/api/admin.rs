use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use common::security::verify_admin_password;
use common::system_log::{self, Severity, SystemLogEntry};
use engine::tracker::{list_jobs, JobStatusRow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::{no_cache_headers, parse_int_param, AdminSession, AppState};
use crate::error::ApiError;
use crate::gatekeeper::client_ip;
use crate::models::AdminCounts;
use crate::{queries, session};

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: Option<String>,
}

/// `POST /admin/login`: exchange the admin password for a session cookie.
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let password = serde_json::from_slice::<LoginRequest>(&body)
        .ok()
        .and_then(|req| req.password)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Password required".to_string()))?;

    let ip = client_ip(&headers);
    let expected = state.secrets.admin_password.as_deref().unwrap_or_default();
    let key = state.secrets.session_key();

    let Some(key) = key.filter(|_| verify_admin_password(&password, expected)) else {
        tracing::warn!(client = %ip, "admin login failed");
        system_log::record(
            &state.db,
            "admin_login_failed",
            json!({ "ip": ip }),
            Severity::Warning,
        )
        .await;
        return Err(ApiError::InvalidPassword);
    };

    let token = session::issue(session::ADMIN_ROLE, key)
        .map_err(|e| state.internal(anyhow::anyhow!("signing session token: {e}")))?;
    let cookie = session::session_cookie(&token, state.config.is_production());

    tracing::info!(client = %ip, "admin login succeeded");
    system_log::record(
        &state.db,
        "admin_login_success",
        json!({ "ip": ip }),
        Severity::Info,
    )
    .await;

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "success": true })),
    )
        .into_response())
}

/// `DELETE /admin/login`: clear the session cookie. Requires a session.
pub async fn logout(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers);
    system_log::record(&state.db, "admin_logout", json!({ "ip": ip }), Severity::Info).await;
    (
        [(
            header::SET_COOKIE,
            session::clear_cookie(state.config.is_production()),
        )],
        Json(json!({ "success": true })),
    )
        .into_response()
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    counts: AdminCounts,
    rate_limit_keys: usize,
    uptime_secs: i64,
    jobs: Vec<JobStatusRow>,
    updated_at: String,
}

pub async fn stats(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let (counts, jobs) = state
        .db
        .call_named("admin.stats", |conn| {
            Ok((queries::admin_counts(conn)?, list_jobs(conn)?))
        })
        .await
        .map_err(|e| state.internal(e))?;

    let now = chrono::Utc::now();
    let body = StatsResponse {
        counts,
        rate_limit_keys: state.limiter.len(),
        uptime_secs: now.signed_duration_since(state.started_at).num_seconds(),
        jobs,
        updated_at: now.to_rfc3339(),
    };
    Ok((no_cache_headers(), Json(body)).into_response())
}

#[derive(Deserialize)]
pub struct LogsQuery {
    severity: Option<String>,
    limit: Option<String>,
}

#[derive(Serialize)]
struct LogsResponse {
    logs: Vec<SystemLogEntry>,
    updated_at: String,
}

pub async fn logs(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let severity = match query.severity.as_deref() {
        None | Some("" | "all") => None,
        Some(s) => Some(
            s.parse::<Severity>()
                .map_err(|_| ApiError::BadRequest("Invalid severity".to_string()))?,
        ),
    };
    let limit = parse_int_param(query.limit.as_deref(), 100, 500);

    let logs = state
        .db
        .call_named("admin.logs", move |conn| {
            Ok(system_log::recent_events(conn, severity, limit)?)
        })
        .await
        .map_err(|e| state.internal(e))?;

    let body = LogsResponse {
        logs,
        updated_at: chrono::Utc::now().to_rfc3339(),
    };
    Ok((no_cache_headers(), Json(body)).into_response())
}
