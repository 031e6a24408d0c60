//! Durable event log backed by the `system_logs` table.
//!
//! Business events (logins, sync runs, maintenance) are written here in
//! addition to `tracing`, so the admin dashboard can show them after a restart.

use crate::db::AsyncDb;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(anyhow::anyhow!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemLogEntry {
    pub id: i64,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub severity: String,
    pub created_at: String,
}

/// Insert one event and return its row id.
pub fn insert_event(
    conn: &Connection,
    event_type: &str,
    data: &serde_json::Value,
    severity: Severity,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO system_logs (event_type, event_data, severity) VALUES (?1, ?2, ?3)",
        params![event_type, data.to_string(), severity.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record an event without failing the caller; a write failure is only traced.
pub async fn record(db: &AsyncDb, event_type: &'static str, data: serde_json::Value, severity: Severity) {
    let res = db
        .call_named("system_log.insert", move |conn| {
            insert_event(conn, event_type, &data, severity)?;
            Ok(())
        })
        .await;
    if let Err(e) = res {
        tracing::warn!(event_type, error = %e, "failed to write system log event");
    }
}

/// Newest first. `severity = None` returns every severity.
pub fn recent_events(
    conn: &Connection,
    severity: Option<Severity>,
    limit: u32,
) -> rusqlite::Result<Vec<SystemLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, event_type, event_data, severity, created_at
         FROM system_logs
         WHERE (?1 IS NULL OR severity = ?1)
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![severity.map(|s| s.as_str()), limit], |row| {
        let raw: String = row.get(2)?;
        Ok(SystemLogEntry {
            id: row.get(0)?,
            event_type: row.get(1)?,
            event_data: serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
            severity: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    rows.collect()
}
