use axum::{extract::State, Json};
use engine::maintenance::{run_maintenance, MaintenanceOptions, MaintenanceReport};
use engine::market_sync::{run_sync_job, SyncOptions, SyncReport};
use std::sync::Arc;
use std::time::Duration;

use super::AppState;
use crate::error::ApiError;

/// `POST /cron/sync-markets`
pub async fn sync_markets(State(state): State<Arc<AppState>>) -> Result<Json<SyncReport>, ApiError> {
    let cfg = &state.config.polymarket;
    let options = SyncOptions {
        top_n: cfg.top_markets_count,
        fetch_timeout: Duration::from_secs(cfg.request_timeout_secs),
    };
    run_sync_job(&state.db, state.market_source.as_ref(), options)
        .await
        .map(Json)
        .map_err(|e| state.internal(e))
}

/// `POST /cron/maintenance`
pub async fn maintenance(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MaintenanceReport>, ApiError> {
    let cfg = &state.config.maintenance;
    let options = MaintenanceOptions {
        log_retention_days: cfg.log_retention_days,
        min_logs_retained: cfg.min_logs_retained,
    };
    run_maintenance(&state.db, options)
        .await
        .map(Json)
        .map_err(|e| state.internal(e))
}
