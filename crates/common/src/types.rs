use serde::{de, Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Resolved => "resolved",
        }
    }
}

/// Market as returned by the Gamma API `/markets` endpoint.
///
/// Gamma is loose about types: ids and amounts arrive as strings or numbers,
/// and `outcomes` / `outcomePrices` are JSON arrays encoded inside a string.
#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    #[serde(deserialize_with = "de_opt_string_any", default)]
    pub id: Option<String>,
    pub question: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub outcomes: Option<serde_json::Value>,
    #[serde(rename = "outcomePrices", default)]
    pub outcome_prices: Option<serde_json::Value>,
    #[serde(rename = "volumeNum", deserialize_with = "de_opt_f64_any", default)]
    pub volume_num: Option<f64>,
    #[serde(deserialize_with = "de_opt_f64_any", default)]
    pub volume: Option<f64>,
    #[serde(rename = "liquidityNum", deserialize_with = "de_opt_f64_any", default)]
    pub liquidity_num: Option<f64>,
    #[serde(deserialize_with = "de_opt_f64_any", default)]
    pub liquidity: Option<f64>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
}

/// Normalised market record, ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub polymarket_id: String,
    pub slug: Option<String>,
    pub question: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub outcomes: Vec<String>,
    pub close_date: Option<String>,
    pub status: MarketStatus,
    pub current_price: Option<f64>,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
    pub resolution_outcome: Option<String>,
}

impl MarketSnapshot {
    /// Minimal active snapshot; handy for fakes and fixtures.
    pub fn new(polymarket_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            polymarket_id: polymarket_id.into(),
            slug: None,
            question: question.into(),
            description: None,
            category: None,
            outcomes: vec!["Yes".to_string(), "No".to_string()],
            close_date: None,
            status: MarketStatus::Active,
            current_price: None,
            volume: None,
            liquidity: None,
            resolution_outcome: None,
        }
    }

    pub fn outcomes_json(&self) -> String {
        serde_json::Value::from(self.outcomes.clone()).to_string()
    }
}

/// First-outcome price at or beyond these bounds means the market has settled.
const RESOLVED_YES_PRICE: f64 = 0.99;
const RESOLVED_NO_PRICE: f64 = 0.01;

impl GammaMarket {
    /// `None` when the record lacks an id or a question.
    pub fn into_snapshot(self) -> Option<MarketSnapshot> {
        let polymarket_id = self.id.filter(|s| !s.trim().is_empty())?;
        let question = self.question.filter(|s| !s.trim().is_empty())?;

        let outcomes = string_list(self.outcomes.as_ref());
        let prices: Vec<f64> = string_list(self.outcome_prices.as_ref())
            .iter()
            .filter_map(|p| p.trim().parse().ok())
            .collect();
        let current_price = prices.first().copied();

        let (status, resolution_outcome) = match (self.closed.unwrap_or(false), current_price) {
            (true, Some(p)) if p >= RESOLVED_YES_PRICE => {
                (MarketStatus::Resolved, Some("YES".to_string()))
            }
            (true, Some(p)) if p <= RESOLVED_NO_PRICE => {
                (MarketStatus::Resolved, Some("NO".to_string()))
            }
            (true, _) => (MarketStatus::Closed, None),
            (false, _) => (MarketStatus::Active, None),
        };

        Some(MarketSnapshot {
            polymarket_id,
            slug: self.slug,
            question,
            description: self.description,
            category: self.category,
            outcomes,
            close_date: self.end_date,
            status,
            current_price,
            volume: self.volume_num.or(self.volume),
            liquidity: self.liquidity_num.or(self.liquidity),
            resolution_outcome,
        })
    }
}

/// Accepts a JSON array or a string holding one; anything else is empty.
fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    let items = match value {
        Some(serde_json::Value::Array(items)) => items.clone(),
        Some(serde_json::Value::String(s)) => serde_json::from_str(s).unwrap_or_default(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

fn de_opt_string_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrNumber;

    impl de::Visitor<'_> for StringOrNumber {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}

/// Number, numeric string, or null. Unparseable strings become `None`.
fn de_opt_f64_any<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct FloatOrString;

    impl de::Visitor<'_> for FloatOrString {
        type Value = Option<f64>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number or numeric string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.trim().parse().ok())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v as f64))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v as f64))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(FloatOrString)
}
