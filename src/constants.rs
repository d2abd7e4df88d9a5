//! Constants for the market data client
//!
//! All defaults are centralized here. `ClientConfig::from_env` can override
//! the network-facing ones at startup; TTLs and rate limits can also be
//! changed at runtime through the command registry.

/// How long market data (tickers, prices) stays fresh (in seconds)
pub const MARKET_DATA_TTL_SECS: u64 = 60;

/// How long historical data (klines) stays fresh (in seconds)
pub const HISTORICAL_DATA_TTL_SECS: u64 = 300;

/// How long coin details (exchange info) stay fresh (in seconds)
pub const COIN_DETAILS_TTL_SECS: u64 = 3600;

/// How long an expired value may still be served as fallback, measured from
/// its original cache timestamp (in seconds)
pub const FALLBACK_TTL_SECS: u64 = 2 * 60 * 60;

/// Minimum gap between two dispatches of the request queue (in milliseconds)
pub const MIN_DELAY_BETWEEN_REQUESTS_MS: u64 = 50;

/// Maximum number of requests admitted per rate-limit window
pub const RATE_LIMIT_MAX_REQUESTS: usize = 50;

/// Length of the sliding rate-limit window (in seconds)
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Window utilisation above which the progressive delay grows
pub const PROGRESSIVE_DELAY_THRESHOLD: f64 = 0.5;

/// Growth of the progressive delay per request above the threshold (in milliseconds)
pub const PROGRESSIVE_DELAY_STEP_MS: u64 = 100;

/// Decay of the progressive delay per request below the threshold (in milliseconds)
pub const PROGRESSIVE_DELAY_DECAY_MS: u64 = 50;

/// Upper bound of the progressive delay (in milliseconds)
pub const PROGRESSIVE_DELAY_MAX_MS: u64 = 2000;

/// Fraction of a TTL after which a cache hit triggers a background refresh
pub const BACKGROUND_REFRESH_FRACTION: f64 = 0.5;

/// Number of failed samples in the metrics window before health degrades
pub const DEGRADED_FAILURE_COUNT: u64 = 3;

/// HTTP request timeout (in seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Public exchange API base URL
pub const EXCHANGE_API_URL: &str = "https://api.binance.com";

/// 24h rolling ticker statistics endpoint
pub const TICKER_24HR_ENDPOINT: &str = "/api/v3/ticker/24hr";

/// Candlestick endpoint
pub const KLINES_ENDPOINT: &str = "/api/v3/klines";

/// Exchange trading rules and symbol information endpoint
pub const EXCHANGE_INFO_ENDPOINT: &str = "/api/v3/exchangeInfo";

/// User agent for HTTP requests
pub const USER_AGENT: &str = "market-fetch-sdk/0.1.0";
