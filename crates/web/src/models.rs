//! Response rows for the JSON API. No DB or business logic here.

use serde::Serialize;

/// One model's standing across every cohort it has run in.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub model_id: String,
    pub display_name: String,
    pub provider: String,
    pub color: Option<String>,
    pub total_pnl: f64,
    pub total_pnl_percent: f64,
    /// Mean Brier score; `None` until the model has a resolved bet.
    pub avg_calibration_score: Option<f64>,
    pub num_cohorts: i64,
    pub num_resolved_bets: i64,
    pub win_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortSummary {
    pub id: String,
    pub cohort_number: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub methodology_version: String,
    pub num_agents: i64,
    pub total_markets_traded: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentDecision {
    pub id: String,
    pub agent_id: String,
    pub cohort_id: String,
    pub decision_week: i64,
    pub decision_timestamp: String,
    pub action: String,
    pub reasoning: Option<String>,
    pub model_display_name: String,
    pub model_color: Option<String>,
    pub cohort_number: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdminCounts {
    pub active_cohorts: i64,
    pub total_agents: i64,
    pub markets_tracked: i64,
    pub total_api_cost: f64,
}
