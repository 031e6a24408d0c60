/// SQL behind the public and admin endpoints. All read-only.
use anyhow::Result;
use rusqlite::{params, Connection};

use crate::models::{AdminCounts, CohortSummary, LeaderboardEntry, RecentDecision};

/// Aggregate standing of every active model, best `total_pnl` first.
///
/// Realized P&L comes from won/lost bets, unrealized from open positions.
/// Models without agents still appear, with zeros and nulls.
pub fn aggregate_leaderboard(conn: &Connection) -> Result<Vec<LeaderboardEntry>> {
    let mut stmt = conn.prepare(
        "WITH agent_pnl AS (
            SELECT
                a.id AS agent_id,
                a.model_id,
                a.cohort_id,
                a.starting_balance,
                COALESCE((SELECT SUM(b.pnl) FROM bets b
                          WHERE b.agent_id = a.id AND b.status IN ('won', 'lost')), 0) AS realized,
                COALESCE((SELECT SUM(p.unrealized_pnl) FROM positions p
                          WHERE p.agent_id = a.id AND p.status = 'open'), 0) AS unrealized,
                (SELECT COUNT(*) FROM bets b
                 WHERE b.agent_id = a.id AND b.status IN ('won', 'lost')) AS resolved,
                (SELECT COUNT(*) FROM bets b
                 WHERE b.agent_id = a.id AND b.status = 'won') AS wins
            FROM agents a
        )
        SELECT
            m.id,
            m.display_name,
            m.provider,
            m.color,
            COALESCE(SUM(ap.realized + ap.unrealized), 0.0) AS total_pnl,
            COALESCE(SUM(ap.starting_balance), 0.0) AS capital,
            COUNT(DISTINCT ap.cohort_id) AS num_cohorts,
            COALESCE(SUM(ap.resolved), 0) AS num_resolved,
            COALESCE(SUM(ap.wins), 0) AS wins,
            (SELECT AVG(bs.brier_score)
             FROM brier_scores bs JOIN agents a2 ON bs.agent_id = a2.id
             WHERE a2.model_id = m.id) AS avg_brier
        FROM models m
        LEFT JOIN agent_pnl ap ON ap.model_id = m.id
        WHERE m.is_active = 1
        GROUP BY m.id
        ORDER BY total_pnl DESC",
    )?;

    let rows = stmt.query_map([], |row| {
        let total_pnl: f64 = row.get(4)?;
        let capital: f64 = row.get(5)?;
        let num_resolved: i64 = row.get(7)?;
        let wins: i64 = row.get(8)?;
        let avg_brier: Option<f64> = row.get(9)?;
        Ok(LeaderboardEntry {
            model_id: row.get(0)?,
            display_name: row.get(1)?,
            provider: row.get(2)?,
            color: row.get(3)?,
            total_pnl,
            total_pnl_percent: if capital > 0.0 {
                total_pnl / capital * 100.0
            } else {
                0.0
            },
            avg_calibration_score: if num_resolved > 0 { avg_brier } else { None },
            num_cohorts: row.get(6)?,
            num_resolved_bets: num_resolved,
            win_rate: (num_resolved > 0).then(|| wins as f64 / num_resolved as f64),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every cohort, newest first.
pub fn cohort_summaries(conn: &Connection) -> Result<Vec<CohortSummary>> {
    let mut stmt = conn.prepare(
        "SELECT
            c.id, c.cohort_number, c.started_at, c.completed_at, c.status, c.methodology_version,
            (SELECT COUNT(*) FROM agents a WHERE a.cohort_id = c.id) AS num_agents,
            (SELECT COUNT(DISTINCT b.market_id)
             FROM bets b JOIN agents a ON b.agent_id = a.id
             WHERE a.cohort_id = c.id) AS total_markets_traded
         FROM cohorts c
         ORDER BY c.cohort_number DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CohortSummary {
            id: row.get(0)?,
            cohort_number: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            status: row.get(4)?,
            methodology_version: row.get(5)?,
            num_agents: row.get(6)?,
            total_markets_traded: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Latest non-error decisions across all cohorts.
pub fn recent_decisions(conn: &Connection, limit: u32) -> Result<Vec<RecentDecision>> {
    let mut stmt = conn.prepare(
        "SELECT
            d.id, d.agent_id, d.cohort_id, d.decision_week, d.decision_timestamp,
            d.action, d.reasoning, m.display_name, m.color, c.cohort_number
         FROM decisions d
         JOIN agents a ON d.agent_id = a.id
         JOIN models m ON a.model_id = m.id
         JOIN cohorts c ON d.cohort_id = c.id
         WHERE d.action != 'ERROR'
         ORDER BY d.decision_timestamp DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(RecentDecision {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            cohort_id: row.get(2)?,
            decision_week: row.get(3)?,
            decision_timestamp: row.get(4)?,
            action: row.get(5)?,
            reasoning: row.get(6)?,
            model_display_name: row.get(7)?,
            model_color: row.get(8)?,
            cohort_number: row.get(9)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn admin_counts(conn: &Connection) -> Result<AdminCounts> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
    Ok(AdminCounts {
        active_cohorts: count("SELECT COUNT(*) FROM cohorts WHERE status = 'active'")?,
        total_agents: count("SELECT COUNT(*) FROM agents")?,
        markets_tracked: count("SELECT COUNT(*) FROM markets")?,
        total_api_cost: conn.query_row(
            "SELECT COALESCE(SUM(api_cost_usd), 0.0) FROM decisions",
            [],
            |r| r.get(0),
        )?,
    })
}

/// Positions whose agent no longer exists.
pub fn orphaned_position_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM positions p
         LEFT JOIN agents a ON p.agent_id = a.id
         WHERE a.id IS NULL",
        [],
        |r| r.get(0),
    )?)
}
