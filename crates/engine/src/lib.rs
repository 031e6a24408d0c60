//! Background jobs behind the cron endpoints: market reconciliation and
//! database maintenance, with their run status kept in `job_status`.

pub mod maintenance;
pub mod market_sync;
pub mod tracker;
