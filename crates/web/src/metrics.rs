use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn describe() {
    describe_gauge!(
        "forecaster_web_build_info",
        "Build info for the forecaster web service (value is always 1)."
    );
    describe_counter!(
        "forecaster_rate_limited_total",
        "Requests rejected by the gatekeeper, by route class."
    );
    describe_gauge!(
        "forecaster_rate_limit_keys",
        "Live rate-limit windows after the last sweep."
    );
    describe_counter!(
        "forecaster_markets_synced_total",
        "Markets written by sync runs, by outcome (inserted/updated/error)."
    );
    describe_histogram!(
        "forecaster_market_sync_duration_ms",
        "Wall time of one market sync run."
    );
    describe_counter!(
        "forecaster_wal_checkpoint_total",
        "WAL checkpoints attempted by maintenance, by status."
    );
    describe_histogram!(
        "forecaster_db_query_latency_ms",
        "SQLite call latency on the background connection thread."
    );
    describe_counter!(
        "forecaster_db_query_errors_total",
        "SQLite calls that returned an error."
    );
    describe_counter!(
        "tracing_error_events",
        "ERROR-level tracing events emitted by the process."
    );
}

/// Install the global Prometheus recorder once and return the handle `/metrics` renders from.
///
/// `install_recorder` leaves upkeep to the caller; the `/metrics` handler runs it per scrape.
pub fn init_global() -> Result<PrometheusHandle> {
    let handle = match PROM_HANDLE.get() {
        Some(handle) => handle.clone(),
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("installing Prometheus recorder: {e}"))?;
            describe();
            PROM_HANDLE.get_or_init(|| handle).clone()
        }
    };

    let git_sha = std::env::var("GIT_SHA").unwrap_or_else(|_| "unknown".to_string());
    ::metrics::gauge!(
        "forecaster_web_build_info",
        "version" => env!("CARGO_PKG_VERSION"),
        "git_sha" => git_sha,
    )
    .set(1.0);

    Ok(handle)
}
