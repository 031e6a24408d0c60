//! Market reconciliation: pull the top markets from Polymarket and upsert
//! them into `markets`, counting inserts, updates and per-record failures.

use anyhow::Result;
use common::db::AsyncDb;
use common::polymarket::{FetchError, PolymarketClient};
use common::system_log::{self, Severity};
use common::types::MarketSnapshot;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::tracker::JobTracker;

pub const JOB_NAME: &str = "sync_markets";

pub trait MarketSource {
    fn fetch_top_markets(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<MarketSnapshot>, FetchError>> + Send;
}

impl MarketSource for PolymarketClient {
    fn fetch_top_markets(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<MarketSnapshot>, FetchError>> + Send {
        PolymarketClient::fetch_top_markets(self, limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

pub trait MarketStore {
    /// Insert or update one market atomically, reporting which happened.
    fn upsert_market(
        &self,
        market: &MarketSnapshot,
    ) -> impl Future<Output = Result<UpsertOutcome>> + Send;
}

/// `MarketStore` over the shared SQLite connection.
#[derive(Clone)]
pub struct SqliteMarketStore {
    db: AsyncDb,
}

impl SqliteMarketStore {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }
}

impl MarketStore for SqliteMarketStore {
    async fn upsert_market(&self, market: &MarketSnapshot) -> Result<UpsertOutcome> {
        let market = market.clone();
        self.db
            .call_named("markets.upsert", move |conn| Ok(upsert_market(conn, &market)?))
            .await
    }
}

/// Lookup and write in one transaction so the reported outcome matches the write.
///
/// A resolved market stays resolved: a later snapshot without an outcome
/// does not clear `resolution_outcome` or downgrade `status`.
pub fn upsert_market(
    conn: &mut Connection,
    m: &MarketSnapshot,
) -> rusqlite::Result<UpsertOutcome> {
    let tx = conn.transaction()?;
    let existed: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM markets WHERE polymarket_id = ?1)",
        params![m.polymarket_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO markets (
            polymarket_id, slug, question, description, category, outcomes_json,
            close_date, status, current_price, volume, liquidity, resolution_outcome,
            first_seen_at, last_updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, datetime('now'), datetime('now'))
         ON CONFLICT(polymarket_id) DO UPDATE SET
            slug = excluded.slug,
            question = excluded.question,
            description = excluded.description,
            category = excluded.category,
            outcomes_json = excluded.outcomes_json,
            close_date = excluded.close_date,
            status = CASE
                WHEN markets.status = 'resolved' AND excluded.resolution_outcome IS NULL
                THEN markets.status ELSE excluded.status END,
            current_price = excluded.current_price,
            volume = excluded.volume,
            liquidity = excluded.liquidity,
            resolution_outcome = COALESCE(excluded.resolution_outcome, markets.resolution_outcome),
            last_updated_at = datetime('now')",
        params![
            m.polymarket_id,
            m.slug,
            m.question,
            m.description,
            m.category,
            m.outcomes_json(),
            m.close_date,
            m.status.as_str(),
            m.current_price,
            m.volume,
            m.liquidity,
            m.resolution_outcome,
        ],
    )?;
    tx.commit()?;
    Ok(if existed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub top_n: u32,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub markets_added: u32,
    pub markets_updated: u32,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// The whole run failed; per-record problems land in `SyncReport::errors` instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("market fetch failed: {0}")]
    Source(#[from] FetchError),
    #[error("market fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source(e) => e.kind(),
            Self::Timeout(_) => "timeout",
        }
    }
}

pub async fn sync_markets<S, T>(
    source: &S,
    store: &T,
    options: SyncOptions,
) -> Result<SyncReport, SyncError>
where
    S: MarketSource,
    T: MarketStore,
{
    let started = Instant::now();

    let markets = tokio::time::timeout(options.fetch_timeout, source.fetch_top_markets(options.top_n))
        .await
        .map_err(|_elapsed| SyncError::Timeout(options.fetch_timeout))??;
    info!(count = markets.len(), "fetched markets from polymarket");

    let mut added = 0u32;
    let mut updated = 0u32;
    let mut errors = Vec::new();

    for market in &markets {
        match store.upsert_market(market).await {
            Ok(UpsertOutcome::Inserted) => {
                added += 1;
                metrics::counter!("forecaster_markets_synced_total", "outcome" => "inserted")
                    .increment(1);
            }
            Ok(UpsertOutcome::Updated) => {
                updated += 1;
                metrics::counter!("forecaster_markets_synced_total", "outcome" => "updated")
                    .increment(1);
            }
            Err(e) => {
                warn!(polymarket_id = %market.polymarket_id, error = %e, "market upsert failed");
                metrics::counter!("forecaster_markets_synced_total", "outcome" => "error")
                    .increment(1);
                errors.push(format!("{}: {e}", market.polymarket_id));
            }
        }
    }

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    metrics::histogram!("forecaster_market_sync_duration_ms").record(duration_ms as f64);
    info!(
        markets_added = added,
        markets_updated = updated,
        errors = errors.len(),
        duration_ms,
        "market sync complete"
    );

    Ok(SyncReport {
        success: true,
        markets_added: added,
        markets_updated: updated,
        errors,
        duration_ms,
    })
}

/// Cron entry point: one tracked sync run against the SQLite store, with the
/// outcome written to the system log.
pub async fn run_sync_job<S: MarketSource>(
    db: &AsyncDb,
    source: &S,
    options: SyncOptions,
) -> Result<SyncReport> {
    let tracker = JobTracker::start(db, JOB_NAME).await?;
    let store = SqliteMarketStore::new(db.clone());

    match sync_markets(source, &store, options).await {
        Ok(report) => {
            system_log::record(
                db,
                "market_sync_complete",
                serde_json::json!({
                    "markets_added": report.markets_added,
                    "markets_updated": report.markets_updated,
                    "errors": report.errors.len(),
                    "duration_ms": report.duration_ms,
                }),
                Severity::Info,
            )
            .await;
            tracker.success(serde_json::to_value(&report)?).await?;
            Ok(report)
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, "market sync failed");
            system_log::record(
                db,
                "market_sync_error",
                serde_json::json!({ "error": e.to_string(), "kind": e.kind() }),
                Severity::Error,
            )
            .await;
            if let Err(track_err) = tracker.fail(&e).await {
                warn!(error = %track_err, "failed to record job failure");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::MarketStatus;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeSource {
        markets: Vec<MarketSnapshot>,
    }

    impl MarketSource for FakeSource {
        async fn fetch_top_markets(&self, limit: u32) -> Result<Vec<MarketSnapshot>, FetchError> {
            Ok(self.markets.iter().take(limit as usize).cloned().collect())
        }
    }

    struct FailingSource;

    impl MarketSource for FailingSource {
        async fn fetch_top_markets(&self, _limit: u32) -> Result<Vec<MarketSnapshot>, FetchError> {
            Err(FetchError::Status {
                status: 503,
                body: "upstream unavailable".to_string(),
            })
        }
    }

    struct HangingSource;

    impl MarketSource for HangingSource {
        async fn fetch_top_markets(&self, _limit: u32) -> Result<Vec<MarketSnapshot>, FetchError> {
            std::future::pending().await
        }
    }

    /// In-memory store that rejects one chosen id.
    struct FakeStore {
        seen: Mutex<HashSet<String>>,
        reject: Option<String>,
    }

    impl FakeStore {
        fn new(reject: Option<&str>) -> Self {
            Self {
                seen: Mutex::new(HashSet::new()),
                reject: reject.map(str::to_string),
            }
        }
    }

    impl MarketStore for FakeStore {
        async fn upsert_market(&self, market: &MarketSnapshot) -> Result<UpsertOutcome> {
            if self.reject.as_deref() == Some(market.polymarket_id.as_str()) {
                anyhow::bail!("constraint failed");
            }
            let mut seen = self.seen.lock().unwrap();
            Ok(if seen.insert(market.polymarket_id.clone()) {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::Updated
            })
        }
    }

    fn markets(n: usize) -> Vec<MarketSnapshot> {
        (0..n)
            .map(|i| MarketSnapshot::new(format!("pm-{i}"), format!("Question {i}?")))
            .collect()
    }

    fn options() -> SyncOptions {
        SyncOptions {
            top_n: 100,
            fetch_timeout: Duration::from_secs(30),
        }
    }

    async fn market_count(db: &AsyncDb) -> i64 {
        db.call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM markets", [], |r| r.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_counts_new_and_existing_markets_then_replay() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let store = SqliteMarketStore::new(db.clone());
        let all = markets(10);

        // Four of the ten are already known.
        let first_four = FakeSource {
            markets: all[..4].to_vec(),
        };
        sync_markets(&first_four, &store, options()).await.unwrap();

        let source = FakeSource { markets: all };
        let report = sync_markets(&source, &store, options()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.markets_added, 6);
        assert_eq!(report.markets_updated, 4);
        assert!(report.errors.is_empty());

        let replay = sync_markets(&source, &store, options()).await.unwrap();
        assert_eq!(replay.markets_added, 0);
        assert_eq!(replay.markets_updated, 10);
        assert_eq!(market_count(&db).await, 10);
    }

    #[tokio::test]
    async fn test_one_failing_record_is_soft_error() {
        let store = FakeStore::new(Some("pm-3"));
        let source = FakeSource {
            markets: markets(10),
        };
        let report = sync_markets(&source, &store, options()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.markets_added + report.markets_updated, 9);
        assert_eq!(report.errors, vec!["pm-3: constraint failed".to_string()]);
    }

    #[tokio::test]
    async fn test_respects_top_n() {
        let store = FakeStore::new(None);
        let source = FakeSource {
            markets: markets(10),
        };
        let opts = SyncOptions {
            top_n: 3,
            ..options()
        };
        let report = sync_markets(&source, &store, opts).await.unwrap();
        assert_eq!(report.markets_added, 3);
    }

    #[tokio::test]
    async fn test_source_failure_fails_the_run() {
        let store = FakeStore::new(None);
        let err = sync_markets(&FailingSource, &store, options())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Source(FetchError::Status { status: 503, .. })));
        assert_eq!(err.kind(), "status");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_source_times_out() {
        let store = FakeStore::new(None);
        let err = sync_markets(&HangingSource, &store, options())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_resolution_is_never_cleared() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let store = SqliteMarketStore::new(db.clone());

        let mut resolved = MarketSnapshot::new("pm-r", "Resolved?");
        resolved.status = MarketStatus::Resolved;
        resolved.resolution_outcome = Some("YES".to_string());
        store.upsert_market(&resolved).await.unwrap();

        let mut stale = MarketSnapshot::new("pm-r", "Resolved?");
        stale.status = MarketStatus::Closed;
        stale.current_price = Some(0.5);
        assert_eq!(
            store.upsert_market(&stale).await.unwrap(),
            UpsertOutcome::Updated
        );

        let (status, outcome, price): (String, Option<String>, Option<f64>) = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT status, resolution_outcome, current_price FROM markets WHERE polymarket_id = 'pm-r'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(status, "resolved");
        assert_eq!(outcome.as_deref(), Some("YES"));
        assert_eq!(price, Some(0.5));
    }

    #[tokio::test]
    async fn test_run_sync_job_records_status_and_events() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let source = FakeSource {
            markets: markets(2),
        };
        let report = run_sync_job(&db, &source, options()).await.unwrap();
        assert_eq!(report.markets_added, 2);

        let err = run_sync_job(&db, &FailingSource, options()).await.unwrap_err();
        assert!(err.to_string().contains("503"));

        let (events, status): (Vec<String>, String) = db
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT event_type FROM system_logs ORDER BY id")?;
                let events = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                let status = conn.query_row(
                    "SELECT status FROM job_status WHERE job_name = ?1",
                    [JOB_NAME],
                    |r| r.get(0),
                )?;
                Ok((events, status))
            })
            .await
            .unwrap();
        assert_eq!(events, vec!["market_sync_complete", "market_sync_error"]);
        assert_eq!(status, "failed");
    }

    #[test]
    fn test_sync_records_outcome_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let rt = tokio::runtime::Runtime::new().unwrap();
        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let source = FakeSource { markets: markets(3) };
                let store = FakeStore::new(Some("pm-1"));
                sync_markets(&source, &store, options()).await.unwrap();
                sync_markets(&source, &store, options()).await.unwrap();
            });
        });

        let rendered = handle.render();
        for expected in [
            r#"forecaster_markets_synced_total{outcome="inserted"} 2"#,
            r#"forecaster_markets_synced_total{outcome="updated"} 2"#,
            r#"forecaster_markets_synced_total{outcome="error"} 2"#,
            "forecaster_market_sync_duration_ms",
        ] {
            assert!(rendered.contains(expected), "missing {expected}, got:\n{rendered}");
        }
    }
}
