//! Types for the market data client

use crate::{
    constants::{COIN_DETAILS_TTL_SECS, HISTORICAL_DATA_TTL_SECS, MARKET_DATA_TTL_SECS},
    error::FetchError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// TTL class of a cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheType {
    /// Live tickers and prices
    MarketData,
    /// Candlesticks and other historical series
    HistoricalData,
    /// Symbol metadata and exchange rules
    CoinDetails,
}

impl CacheType {
    /// All cache types
    pub fn all() -> &'static [CacheType] {
        &[
            CacheType::MarketData,
            CacheType::HistoricalData,
            CacheType::CoinDetails,
        ]
    }

    /// Default TTL for this cache type
    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheType::MarketData => Duration::from_secs(MARKET_DATA_TTL_SECS),
            CacheType::HistoricalData => Duration::from_secs(HISTORICAL_DATA_TTL_SECS),
            CacheType::CoinDetails => Duration::from_secs(COIN_DETAILS_TTL_SECS),
        }
    }

    /// Name used in commands and status output
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::MarketData => "MARKET_DATA",
            CacheType::HistoricalData => "HISTORICAL_DATA",
            CacheType::CoinDetails => "COIN_DETAILS",
        }
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = FetchError;

    /// Accepts `MARKET_DATA`, `market-data` and `market_data` spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "MARKET_DATA" => Ok(CacheType::MarketData),
            "HISTORICAL_DATA" => Ok(CacheType::HistoricalData),
            "COIN_DETAILS" => Ok(CacheType::CoinDetails),
            _ => Err(FetchError::invalid_argument(format!(
                "unknown cache type '{}'",
                s
            ))),
        }
    }
}

/// A cached response body
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Response body
    pub data: Value,
    /// When the value was fetched
    pub timestamp: Instant,
    /// TTL class the value was stored under
    pub cache_type: CacheType,
}

impl CacheEntry {
    /// Age of the entry relative to `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

/// Per-request options that take part in the cache key
///
/// Maps are ordered so the serialized form, and therefore the cache key,
/// does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Query string parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    /// Extra request headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl RequestOptions {
    /// Empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(key.into(), value.to_string());
        self
    }

    /// Adds a request header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds the cache key for a request: url followed by the serialized options
    pub fn cache_key(&self, url: &str) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}", url, serialized)
    }
}

/// Cache size counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries in the live cache (fresh or not yet evicted)
    pub live_entries: usize,
    /// Entries held in the fallback store
    pub fallback_entries: usize,
}

/// Point-in-time view of the rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Requests recorded in the current window
    pub requests_in_window: usize,
    /// Configured maximum per window
    pub max_requests: usize,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Remaining backoff in milliseconds, zero if none
    pub backoff_remaining_ms: u64,
    /// Current progressive delay in milliseconds
    pub progressive_delay_ms: u64,
}

impl RateLimitSnapshot {
    /// Fraction of the window capacity in use
    pub fn utilization(&self) -> f64 {
        if self.max_requests == 0 {
            return 1.0;
        }
        self.requests_in_window as f64 / self.max_requests as f64
    }
}

/// Status dump returned by the `status` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    /// Cache sizes
    pub cache: CacheStats,
    /// Current TTL per cache type, in seconds
    pub ttl_secs: BTreeMap<String, u64>,
    /// Rate limiter state
    pub rate_limit: RateLimitSnapshot,
    /// Requests waiting in the queue
    pub queue_length: usize,
    /// Whether background refresh is enabled
    pub background_refresh: bool,
    /// Cache hits since start
    pub cache_hits: u64,
    /// Cache misses since start
    pub cache_misses: u64,
    /// Fallback values served since start
    pub fallback_hits: u64,
    /// When this status was taken
    pub timestamp: DateTime<Utc>,
}

/// Overall system health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// System is healthy and all components are operational
    Healthy,
    /// System is degraded but still functional
    Degraded,
    /// System is unhealthy and requires attention
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional status message
    pub message: Option<String>,
    /// Component-specific details
    pub details: std::collections::HashMap<String, Value>,
    /// Last checked timestamp
    pub last_checked: DateTime<Utc>,
}

/// Exchange numbers arrive as JSON strings ("43125.10000000")
fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(f64),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Str(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
        StrOrNum::Num(n) => Ok(n),
    }
}

/// 24h rolling window statistics for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hr {
    pub symbol: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub price_change: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub price_change_percent: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub last_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub open_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub high_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub low_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub volume: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub quote_volume: f64,
    pub open_time: i64,
    pub close_time: i64,
    #[serde(default)]
    pub count: u64,
}

/// One candlestick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trades: u64,
}

impl TryFrom<&Value> for Kline {
    type Error = FetchError;

    /// Parses the positional array form the exchange returns:
    /// `[open_time, open, high, low, close, volume, close_time, quote_volume, trades, ...]`
    fn try_from(row: &Value) -> Result<Self, Self::Error> {
        let fields = row
            .as_array()
            .ok_or_else(|| FetchError::invalid_response("kline row is not an array"))?;
        if fields.len() < 9 {
            return Err(FetchError::invalid_response(format!(
                "kline row has {} fields, expected at least 9",
                fields.len()
            )));
        }

        let int = |idx: usize| -> Result<i64, FetchError> {
            fields[idx]
                .as_i64()
                .ok_or_else(|| FetchError::invalid_response(format!("kline field {} is not an integer", idx)))
        };
        let num = |idx: usize| -> Result<f64, FetchError> {
            match &fields[idx] {
                Value::String(s) => s.parse::<f64>().map_err(|e| {
                    FetchError::invalid_response(format!("kline field {}: {}", idx, e))
                }),
                Value::Number(n) => n.as_f64().ok_or_else(|| {
                    FetchError::invalid_response(format!("kline field {} out of range", idx))
                }),
                _ => Err(FetchError::invalid_response(format!(
                    "kline field {} is not numeric",
                    idx
                ))),
            }
        };

        Ok(Kline {
            open_time: int(0)?,
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5)?,
            close_time: int(6)?,
            quote_volume: num(7)?,
            trades: int(8)?.max(0) as u64,
        })
    }
}

/// Trading symbol metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
}

/// Exchange trading rules and symbol list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    pub timezone: String,
    pub server_time: i64,
    pub symbols: Vec<SymbolInfo>,
}

impl ExchangeInfo {
    /// Symbols currently open for trading
    pub fn trading_symbols(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.symbols.iter().filter(|s| s.status == "TRADING")
    }
}
