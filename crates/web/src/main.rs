mod api;
mod error;
mod gatekeeper;
mod metrics;
mod models;
mod queries;
mod rate_limit;
mod session;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use api::AppState;
use rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "forecaster-web",
        &config.general.log_level,
        config.general.log_format,
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!(environment = %config.general.environment, "forecaster web starting");

    let secrets = common::config::Secrets::from_env();
    let missing = secrets.missing_required();
    if !missing.is_empty() {
        // Still serve: /health reports this and the affected routes fail closed.
        tracing::warn!(missing = ?missing, "required secrets are not set");
    }

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = common::db::AsyncDb::open(&config.database.path).await?;

    let prometheus = metrics::init_global()?;

    let market_source = Arc::new(common::polymarket::PolymarketClient::new(
        &config.polymarket.gamma_api_url,
        Duration::from_secs(config.polymarket.request_timeout_secs),
    )?);

    let shutdown = CancellationToken::new();
    let limiter = Arc::new(RateLimiter::new());
    let sweeper = rate_limit::spawn_sweeper(
        limiter.clone(),
        Duration::from_secs(config.rate_limit.sweep_interval_secs),
        shutdown.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
    let state = Arc::new(AppState {
        db,
        config: Arc::new(config),
        secrets,
        limiter,
        market_source,
        started_at: chrono::Utc::now(),
        metrics: Some(prometheus),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "rate-limit sweeper task ended abnormally");
    }
    tracing::info!("stopped");
    Ok(())
}
