pub mod config;
pub mod db;
pub mod observability;
pub mod polymarket;
pub mod security;
pub mod system_log;
pub mod types;
