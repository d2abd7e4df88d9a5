//! Client configuration
//!
//! Defaults come from [`crate::constants`]. `from_env` lets a deployment
//! override the network-facing values without recompiling.

use crate::{
    constants::{
        EXCHANGE_API_URL, MIN_DELAY_BETWEEN_REQUESTS_MS, RATE_LIMIT_MAX_REQUESTS,
        RATE_LIMIT_WINDOW_SECS, REQUEST_TIMEOUT_SECS,
    },
    rate_limiter::RateLimitConfig,
};
use std::str::FromStr;
use std::time::Duration;

/// Settings for a [`crate::MarketDataClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the exchange API
    pub base_url: String,
    /// Rate limit parameters
    pub rate_limit: RateLimitConfig,
    /// Minimum gap between queue dispatches
    pub min_delay_between_requests: Duration,
    /// HTTP request timeout
    pub request_timeout: Duration,
    /// Refresh aging cache hits in the background
    pub background_refresh: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: EXCHANGE_API_URL.to_string(),
            rate_limit: RateLimitConfig {
                max_requests: RATE_LIMIT_MAX_REQUESTS,
                window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            },
            min_delay_between_requests: Duration::from_millis(MIN_DELAY_BETWEEN_REQUESTS_MS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            background_refresh: true,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `MARKET_FETCH_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("MARKET_FETCH_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(max) = parse_var::<usize>(&lookup, "MARKET_FETCH_MAX_REQUESTS") {
            if max > 0 {
                config.rate_limit.max_requests = max;
            }
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MARKET_FETCH_WINDOW_SECS") {
            if secs > 0 {
                config.rate_limit.window = Duration::from_secs(secs);
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MARKET_FETCH_MIN_DELAY_MS") {
            config.min_delay_between_requests = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MARKET_FETCH_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(flag) = parse_var::<bool>(&lookup, "MARKET_FETCH_BACKGROUND_REFRESH") {
            config.background_refresh = flag;
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
