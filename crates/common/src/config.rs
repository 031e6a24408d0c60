use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "FORECASTER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub web: Web,
    pub polymarket: Polymarket,
    pub rate_limit: RateLimit,
    pub maintenance: Maintenance,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// `production` switches on secure cookies and generic 500 messages.
    pub environment: String,
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Web {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Polymarket {
    pub gamma_api_url: String,
    pub top_markets_count: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Maintenance {
    pub log_retention_days: u32,
    pub min_logs_retained: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.general.environment.eq_ignore_ascii_case("production")
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.web.port > 0, "web.port must be > 0");
        anyhow::ensure!(
            self.polymarket.top_markets_count > 0,
            "polymarket.top_markets_count must be > 0"
        );
        anyhow::ensure!(
            self.polymarket.request_timeout_secs > 0,
            "polymarket.request_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            self.rate_limit.sweep_interval_secs > 0,
            "rate_limit.sweep_interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.maintenance.log_retention_days > 0,
            "maintenance.log_retention_days must be > 0"
        );
        Ok(())
    }
}

/// Secrets come from the environment only, never from the config file.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub admin_password: Option<String>,
    pub cron_secret: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub session_secret: Option<String>,
}

impl Secrets {
    /// Secrets the health check requires to be present.
    pub const REQUIRED: [&'static str; 3] = ["OPENROUTER_API_KEY", "CRON_SECRET", "ADMIN_PASSWORD"];

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup; empty values count as absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            admin_password: get("ADMIN_PASSWORD"),
            cron_secret: get("CRON_SECRET"),
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            session_secret: get("SESSION_SECRET"),
        }
    }

    pub fn missing_required(&self) -> Vec<&'static str> {
        Self::REQUIRED
            .into_iter()
            .filter(|name| match *name {
                "OPENROUTER_API_KEY" => self.openrouter_api_key.is_none(),
                "CRON_SECRET" => self.cron_secret.is_none(),
                "ADMIN_PASSWORD" => self.admin_password.is_none(),
                _ => false,
            })
            .collect()
    }

    /// HMAC key for admin sessions: `SESSION_SECRET`, falling back to the admin password.
    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_secret
            .as_deref()
            .or(self.admin_password.as_deref())
            .map(str::as_bytes)
    }
}
