use crate::types::{GammaMarket, MarketSnapshot};
use anyhow::Context;
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

/// Why a Gamma fetch failed. Callers treat every variant as a failed run.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("gamma API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode gamma response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Longest error body kept in a `FetchError::Status`.
const MAX_ERROR_BODY: usize = 512;

pub struct PolymarketClient {
    gamma_api_url: String,
    client: reqwest::Client,
}

impl PolymarketClient {
    pub fn new(gamma_api_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            gamma_api_url: gamma_api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Open markets ordered by volume, highest first.
    pub fn top_markets_url(&self, limit: u32) -> Result<Url, FetchError> {
        let mut url = Url::parse(&format!("{}/markets", self.gamma_api_url))
            .map_err(|e| FetchError::Network(format!("invalid gamma url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("active", "true")
            .append_pair("closed", "false")
            .append_pair("order", "volume")
            .append_pair("ascending", "false")
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    /// Fetch up to `limit` markets; records without an id or question are skipped.
    pub async fn fetch_top_markets(&self, limit: u32) -> Result<Vec<MarketSnapshot>, FetchError> {
        let url = self.top_markets_url(limit)?;
        debug!(url = %url, "fetching top markets");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| FetchError::from_reqwest(&e))?;
        let markets = parse_markets(&bytes)?;
        debug!(count = markets.len(), "fetched top markets");
        Ok(markets)
    }
}

/// Decode a Gamma `/markets` body into snapshots.
///
/// Only a body that is not a JSON array fails; a record that does not decode
/// is logged and skipped so the rest of the batch survives.
pub fn parse_markets(body: &[u8]) -> Result<Vec<MarketSnapshot>, FetchError> {
    let raw: Vec<serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    let markets = raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| {
            let id = value.get("id").map(ToString::to_string);
            match serde_json::from_value::<GammaMarket>(value) {
                Ok(market) => market.into_snapshot(),
                Err(e) => {
                    warn!(index, id = ?id, error = %e, "skipping undecodable gamma market");
                    None
                }
            }
        })
        .collect();
    Ok(markets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PolymarketClient {
        PolymarketClient::new("https://gamma-api.polymarket.com/", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_top_markets_url() {
        let url = client().top_markets_url(100).unwrap().to_string();
        assert!(url.starts_with("https://gamma-api.polymarket.com/markets?"));
        assert!(url.contains("active=true"));
        assert!(url.contains("closed=false"));
        assert!(url.contains("order=volume"));
        assert!(url.contains("ascending=false"));
        assert!(url.contains("limit=100"));
    }

    #[test]
    fn test_parse_markets_skips_incomplete_records() {
        let body = br#"[
            {"id": "1", "question": "First?"},
            {"question": "No id"},
            {"id": "3", "question": "Third?", "volume": 12}
        ]"#;
        let markets = parse_markets(body).unwrap();
        assert_eq!(markets.len(), 2);
        assert_eq!(markets[1].volume, Some(12.0));
    }

    #[test]
    fn test_parse_markets_skips_wrong_typed_record() {
        let body = br#"[
            {"id": "1", "question": "First?"},
            {"id": "2", "question": "Second?", "category": 7},
            {"id": "3", "question": "Third?", "active": "yes"},
            {"id": "4", "question": "Fourth?"}
        ]"#;
        let markets = parse_markets(body).unwrap();
        let ids: Vec<&str> = markets.iter().map(|m| m.polymarket_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
    }

    #[test]
    fn test_parse_markets_rejects_non_array() {
        let err = parse_markets(br#"{"error": "maintenance"}"#).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let client = PolymarketClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client.fetch_top_markets(5).await.unwrap_err();
        assert!(matches!(err.kind(), "network" | "timeout"), "got {err:?}");
    }
}
