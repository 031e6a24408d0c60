use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{parse_int_param, AppState};
use crate::error::ApiError;
use crate::models::{CohortSummary, LeaderboardEntry, RecentDecision};
use crate::queries;

const LEADERBOARD_CACHE: &str = "public, max-age=300, stale-while-revalidate=60";
const DECISIONS_CACHE: &str = "public, max-age=120, stale-while-revalidate=30";

#[derive(Serialize)]
struct LeaderboardResponse {
    leaderboard: Vec<LeaderboardEntry>,
    cohorts: Vec<CohortSummary>,
    updated_at: String,
}

/// `GET /leaderboard`
pub async fn leaderboard(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let (leaderboard, cohorts) = state
        .db
        .call_named("public.leaderboard", |conn| {
            Ok((
                queries::aggregate_leaderboard(conn)?,
                queries::cohort_summaries(conn)?,
            ))
        })
        .await
        .map_err(|e| state.internal(e))?;

    let body = LeaderboardResponse {
        leaderboard,
        cohorts,
        updated_at: chrono::Utc::now().to_rfc3339(),
    };
    Ok(([(header::CACHE_CONTROL, LEADERBOARD_CACHE)], Json(body)).into_response())
}

#[derive(Deserialize)]
pub struct DecisionsQuery {
    limit: Option<String>,
}

#[derive(Serialize)]
struct DecisionsResponse {
    decisions: Vec<RecentDecision>,
    updated_at: String,
}

/// `GET /decisions/recent?limit=`
pub async fn recent_decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DecisionsQuery>,
) -> Result<Response, ApiError> {
    let limit = parse_int_param(query.limit.as_deref(), 10, 50);
    let decisions = state
        .db
        .call_named("public.recent_decisions", move |conn| {
            queries::recent_decisions(conn, limit)
        })
        .await
        .map_err(|e| state.internal(e))?;

    let body = DecisionsResponse {
        decisions,
        updated_at: chrono::Utc::now().to_rfc3339(),
    };
    Ok(([(header::CACHE_CONTROL, DECISIONS_CACHE)], Json(body)).into_response())
}

#[derive(Debug, Serialize)]
struct Check {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Check {
    fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: Some(message.into()),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    checks: BTreeMap<&'static str, Check>,
}

/// `GET /health`: 200 when every check passes, else 503.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let mut checks = BTreeMap::new();

    let database = match state
        .db
        .call_named("health.ping", |conn| {
            Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?)
        })
        .await
    {
        Ok(1) => Check::ok(),
        Ok(_) => Check::error("Database query failed"),
        Err(e) => Check::error(format!("{e:#}")),
    };
    checks.insert("database", database);

    let missing = state.secrets.missing_required();
    let environment = if missing.is_empty() {
        Check::ok()
    } else {
        Check::error(format!("Missing: {}", missing.join(", ")))
    };
    checks.insert("environment", environment);

    let integrity = match state
        .db
        .call_named("health.integrity", |conn| {
            queries::orphaned_position_count(conn)
        })
        .await
    {
        Ok(0) => Check::ok(),
        Ok(n) => Check::error(format!("{n} orphaned positions found")),
        Err(e) => Check::error(format!("{e:#}")),
    };
    checks.insert("data_integrity", integrity);

    let healthy = checks.values().all(Check::is_ok);
    if !healthy {
        tracing::warn!(?checks, "health check failing");
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if healthy { "ok" } else { "error" },
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };
    (status, Json(body)).into_response()
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let Some(handle) = state.metrics.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    // install_recorder leaves histogram upkeep to the caller.
    handle.run_upkeep();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}
