use anyhow::Result;
use rusqlite::Connection;
use std::time::{Duration, Instant};

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// All SQLite work runs on one dedicated background thread, keeping the Tokio
/// runtime cooperative. Clone is cheap (shared sender to that thread), and the
/// single thread serialises writers, so concurrent upserts never interleave
/// inside a transaction.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path` (`:memory:` works), set PRAGMAs and run migrations.
    ///
    /// Migrations need the write lock. If another process holds it we back off
    /// and retry instead of failing startup, up to `MAX_LOCK_WAIT`.
    pub async fn open(path: &str) -> Result<Self> {
        const MAX_LOCK_WAIT: Duration = Duration::from_secs(120);
        const MAX_BACKOFF: Duration = Duration::from_secs(10);

        let conn = tokio_rusqlite::Connection::open(path).await?;
        let started = Instant::now();
        let mut backoff = Duration::from_millis(250);

        loop {
            let attempt = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    run_migrations(conn)?;
                    conn.busy_timeout(Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match attempt {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) if is_locked(&err) => {
                    if started.elapsed() >= MAX_LOCK_WAIT {
                        return Err(anyhow::Error::from(err)
                            .context("AsyncDb::open: database stayed locked during migrations"));
                    }
                    tracing::warn!(wait_for = ?backoff, "database is locked; retrying migrations");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(tokio_rusqlite::Error::Error(err)) => {
                    return Err(anyhow::Error::from(err).context("AsyncDb::open: migration failed"));
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return its result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records latency and error metrics under `op`.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!(
            "forecaster_db_query_latency_ms",
            "op" => op,
            "status" => status
        )
        .record(ms);
        if res.is_err() {
            metrics::counter!("forecaster_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Apply the schema. Idempotent.
pub fn run_migrations(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}

/// Open a synchronous in-memory connection with the schema applied (tests and tools).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    run_migrations(&conn)?;
    Ok(conn)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS models (
    id TEXT PRIMARY KEY,               -- e.g. gpt-5, claude-opus
    display_name TEXT NOT NULL,
    provider TEXT NOT NULL,
    color TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS cohorts (
    id TEXT PRIMARY KEY,
    cohort_number INTEGER NOT NULL UNIQUE,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',   -- active, completed
    methodology_version TEXT NOT NULL DEFAULT 'v1'
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    cohort_id TEXT NOT NULL REFERENCES cohorts(id),
    model_id TEXT NOT NULL REFERENCES models(id),
    starting_balance REAL NOT NULL DEFAULT 10000.0,
    cash_balance REAL NOT NULL DEFAULT 10000.0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(cohort_id, model_id)
);

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    polymarket_id TEXT NOT NULL UNIQUE,   -- external identity, one local row per id
    slug TEXT,
    question TEXT NOT NULL,
    description TEXT,
    category TEXT,
    outcomes_json TEXT,                   -- JSON array of outcome labels
    close_date TEXT,
    status TEXT NOT NULL DEFAULT 'active', -- active, closed, resolved
    current_price REAL,                   -- first outcome (YES) price
    volume REAL,
    liquidity REAL,
    resolution_outcome TEXT,              -- YES, NO once resolved
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    cohort_id TEXT NOT NULL,
    decision_week INTEGER NOT NULL,
    decision_timestamp TEXT NOT NULL DEFAULT (datetime('now')),
    action TEXT NOT NULL,                 -- BET, SELL, HOLD, ERROR
    reasoning TEXT,
    api_cost_usd REAL NOT NULL DEFAULT 0.0
);

CREATE TABLE IF NOT EXISTS bets (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    market_id INTEGER NOT NULL,
    decision_id TEXT,
    side TEXT NOT NULL,                   -- YES, NO
    amount REAL NOT NULL,
    price REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending', -- pending, won, lost, cancelled
    pnl REAL,
    placed_at TEXT NOT NULL DEFAULT (datetime('now')),
    resolved_at TEXT
);

-- No FK on agent_id: the health check reports orphans instead of SQLite rejecting them.
CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    market_id INTEGER NOT NULL,
    side TEXT NOT NULL,
    shares REAL NOT NULL,
    avg_entry_price REAL NOT NULL,
    current_value REAL,
    unrealized_pnl REAL NOT NULL DEFAULT 0.0,
    status TEXT NOT NULL DEFAULT 'open',  -- open, closed, settled
    opened_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS brier_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    bet_id TEXT,
    market_id INTEGER,
    brier_score REAL NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    event_data TEXT NOT NULL DEFAULT '{}', -- JSON object
    severity TEXT NOT NULL DEFAULT 'info', -- info, warning, error
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,                 -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                        -- JSON summary of the last run
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_agents_model ON agents(model_id);
CREATE INDEX IF NOT EXISTS idx_agents_cohort ON agents(cohort_id);
CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status);
CREATE INDEX IF NOT EXISTS idx_markets_volume ON markets(volume DESC);
CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON decisions(decision_timestamp);
CREATE INDEX IF NOT EXISTS idx_bets_agent_status ON bets(agent_id, status);
CREATE INDEX IF NOT EXISTS idx_positions_agent_status ON positions(agent_id, status);
CREATE INDEX IF NOT EXISTS idx_brier_scores_agent ON brier_scores(agent_id);
CREATE INDEX IF NOT EXISTS idx_system_logs_created_at ON system_logs(created_at);
CREATE INDEX IF NOT EXISTS idx_system_logs_severity ON system_logs(severity, created_at);
"#;
