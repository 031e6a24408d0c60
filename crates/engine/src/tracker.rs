use anyhow::Result;
use common::db::AsyncDb;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::time::Instant;

/// Records one run of a cron job in `job_status`.
///
/// `start` marks the job running; consume the tracker with `success` or `fail`.
pub struct JobTracker {
    db: AsyncDb,
    job_name: &'static str,
    start_time: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &'static str) -> Result<Self> {
        db.call_named("job_tracker.start", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running', datetime('now'), datetime('now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running',
                    last_run_at = datetime('now'),
                    updated_at = datetime('now'),
                    last_error = NULL,
                    duration_ms = NULL",
                params![job_name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name,
            start_time: Instant::now(),
        })
    }

    pub async fn success(self, metadata: serde_json::Value) -> Result<()> {
        self.finish("idle", None, Some(metadata.to_string())).await
    }

    pub async fn fail(self, error: &(dyn std::fmt::Display + Sync)) -> Result<()> {
        self.finish("failed", Some(error.to_string()), None).await
    }

    async fn finish(
        self,
        status: &'static str,
        error: Option<String>,
        metadata: Option<String>,
    ) -> Result<()> {
        let duration_ms = i64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(i64::MAX);
        let name = self.job_name;
        self.db
            .call_named("job_tracker.finish", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = ?2,
                        duration_ms = ?3,
                        last_error = ?4,
                        metadata = COALESCE(?5, metadata),
                        updated_at = datetime('now')
                     WHERE job_name = ?1",
                    params![name, status, duration_ms, error, metadata],
                )?;
                Ok(())
            })
            .await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusRow {
    pub job_name: String,
    pub status: String,
    pub last_run_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

pub fn list_jobs(conn: &Connection) -> rusqlite::Result<Vec<JobStatusRow>> {
    let mut stmt = conn.prepare(
        "SELECT job_name, status, last_run_at, duration_ms, last_error, metadata
         FROM job_status ORDER BY job_name",
    )?;
    let rows = stmt.query_map([], |row| {
        let metadata: Option<String> = row.get(5)?;
        Ok(JobStatusRow {
            job_name: row.get(0)?,
            status: row.get(1)?,
            last_run_at: row.get(2)?,
            duration_ms: row.get(3)?,
            last_error: row.get(4)?,
            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        })
    })?;
    rows.collect()
}
