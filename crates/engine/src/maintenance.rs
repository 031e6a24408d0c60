use anyhow::Result;
use chrono::Utc;
use common::db::AsyncDb;
use common::system_log::{self, Severity};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::time::Instant;

use crate::tracker::JobTracker;

pub const JOB_NAME: &str = "maintenance";

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceOptions {
    pub log_retention_days: u32,
    pub min_logs_retained: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub success: bool,
    pub logs_deleted: usize,
    pub wal_pages_checkpointed: i64,
    pub timestamp: String,
    pub duration_ms: u64,
}

/// Delete `system_logs` rows older than `retention_days`, never touching the
/// newest `keep_newest` rows. Nothing is deleted while the table holds
/// `keep_newest` rows or fewer.
pub fn cleanup_old_logs(
    conn: &Connection,
    retention_days: u32,
    keep_newest: u32,
) -> rusqlite::Result<usize> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM system_logs", [], |r| r.get(0))?;
    if total <= i64::from(keep_newest) {
        return Ok(0);
    }
    conn.execute(
        "DELETE FROM system_logs
         WHERE created_at < datetime('now', ?1)
           AND id NOT IN (
               SELECT id FROM system_logs
               ORDER BY created_at DESC, id DESC
               LIMIT ?2
           )",
        params![format!("-{retention_days} days"), keep_newest],
    )
}

/// Fold the WAL back into the main database file.
///
/// TRUNCATE mode also resets the WAL to zero bytes. Returns `(log_pages, checkpointed)`.
pub async fn run_wal_checkpoint_once(db: &AsyncDb) -> Result<(i64, i64)> {
    let (busy, log, checkpointed) = db
        .call_named("wal_checkpoint.run", |conn| {
            Ok(conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?)
        })
        .await?;

    if busy != 0 {
        tracing::warn!(log, checkpointed, "WAL checkpoint: database busy, partial checkpoint");
        metrics::counter!("forecaster_wal_checkpoint_total", "status" => "busy").increment(1);
    } else {
        tracing::info!(log, checkpointed, "WAL checkpoint complete");
        metrics::counter!("forecaster_wal_checkpoint_total", "status" => "ok").increment(1);
    }
    Ok((log, checkpointed))
}

async fn run_steps(db: &AsyncDb, options: MaintenanceOptions) -> Result<(usize, i64)> {
    let MaintenanceOptions {
        log_retention_days,
        min_logs_retained,
    } = options;
    let deleted = db
        .call_named("system_logs.cleanup", move |conn| {
            Ok(cleanup_old_logs(conn, log_retention_days, min_logs_retained)?)
        })
        .await?;
    if deleted > 0 {
        tracing::info!(deleted, "cleaned up old system log entries");
    }
    // In-memory databases report -1 pages.
    let (_log, checkpointed) = run_wal_checkpoint_once(db).await?;
    Ok((deleted, checkpointed.max(0)))
}

/// Cron entry point: tracked maintenance run with its outcome in the system log.
pub async fn run_maintenance(db: &AsyncDb, options: MaintenanceOptions) -> Result<MaintenanceReport> {
    let started = Instant::now();
    let tracker = JobTracker::start(db, JOB_NAME).await?;

    match run_steps(db, options).await {
        Ok((logs_deleted, wal_pages_checkpointed)) => {
            let report = MaintenanceReport {
                success: true,
                logs_deleted,
                wal_pages_checkpointed,
                timestamp: Utc::now().to_rfc3339(),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            system_log::record(
                db,
                "maintenance_complete",
                serde_json::json!({
                    "logs_deleted": report.logs_deleted,
                    "wal_pages_checkpointed": report.wal_pages_checkpointed,
                    "duration_ms": report.duration_ms,
                }),
                Severity::Info,
            )
            .await;
            tracker.success(serde_json::to_value(&report)?).await?;
            Ok(report)
        }
        Err(e) => {
            tracing::error!(error = %e, "maintenance failed");
            system_log::record(
                db,
                "maintenance_error",
                serde_json::json!({ "error": format!("{e:#}") }),
                Severity::Error,
            )
            .await;
            if let Err(track_err) = tracker.fail(&e).await {
                tracing::warn!(error = %track_err, "failed to record job failure");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::open_in_memory;

    fn insert_logs(conn: &Connection, n: usize, age: &str) {
        for i in 0..n {
            conn.execute(
                "INSERT INTO system_logs (event_type, event_data, created_at)
                 VALUES ('test_event', ?1, datetime('now', ?2))",
                params![format!("{{\"i\":{i}}}"), age],
            )
            .unwrap();
        }
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM system_logs", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_nothing_deleted_at_or_below_floor() {
        let conn = open_in_memory().unwrap();
        insert_logs(&conn, 10, "-200 days");
        assert_eq!(cleanup_old_logs(&conn, 90, 10).unwrap(), 0);
        assert_eq!(count(&conn), 10);
    }

    #[test]
    fn test_deletes_only_old_rows_beyond_floor() {
        let conn = open_in_memory().unwrap();
        insert_logs(&conn, 6, "-120 days");
        insert_logs(&conn, 2, "-1 days");

        // Floor of 4: the 2 recent rows plus the 2 newest old rows survive.
        let deleted = cleanup_old_logs(&conn, 90, 4).unwrap();
        assert_eq!(deleted, 4);
        assert_eq!(count(&conn), 4);
    }

    #[test]
    fn test_recent_rows_survive_even_above_floor() {
        let conn = open_in_memory().unwrap();
        insert_logs(&conn, 8, "-10 days");
        assert_eq!(cleanup_old_logs(&conn, 90, 2).unwrap(), 0);
        assert_eq!(count(&conn), 8);
    }

    #[tokio::test]
    async fn test_run_maintenance_on_file_database() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = AsyncDb::open(tmp.path().to_str().unwrap()).await.unwrap();
        db.call(|conn| {
            insert_logs(conn, 5, "-100 days");
            Ok(())
        })
        .await
        .unwrap();

        let report = run_maintenance(
            &db,
            MaintenanceOptions {
                log_retention_days: 90,
                min_logs_retained: 3,
            },
        )
        .await
        .unwrap();
        assert!(report.success);
        assert_eq!(report.logs_deleted, 2);
        assert!(report.wal_pages_checkpointed >= 0);

        let (events, status): (Vec<String>, String) = db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_type FROM system_logs WHERE event_type != 'test_event'",
                )?;
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
        assert_eq!(events, vec!["maintenance_complete"]);
        assert_eq!(status, "idle");
    }

    #[test]
    fn test_wal_checkpoint_records_metric() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let rt = tokio::runtime::Runtime::new().unwrap();
        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let tmp = tempfile::NamedTempFile::new().unwrap();
                let db = AsyncDb::open(tmp.path().to_str().unwrap()).await.unwrap();
                run_wal_checkpoint_once(&db).await.unwrap();
            });
        });

        let rendered = handle.render();
        assert!(
            rendered.contains(r#"forecaster_wal_checkpoint_total{status="ok"} 1"#),
            "expected an ok checkpoint, got:\n{rendered}"
        );
    }
}
