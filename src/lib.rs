//! # Market Fetch SDK
//!
//! Cached, queued and rate-limited access to a public exchange market-data
//! API (24h tickers, klines, exchange info) or any other JSON endpoint.
//!
//! ## What sits between your code and the network
//!
//! ```text
//! FetchHandle / your code
//!     ↓
//! RequestQueue (FIFO, one dispatch every 50ms at most)
//!     ↓
//! ResponseCache (TTL per data class) ──miss──→ RateLimiter (sliding window)
//!     ↑                                            ↓
//! fallback store (expired values, 2h) ←─error── Transport (reqwest)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use market_fetch_sdk::MarketDataClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MarketDataClient::global().await;
//!
//! let ticker = client.ticker_24hr("BTCUSDT").await?;
//! println!("BTC: ${:.2} ({:+.2}%)", ticker.last_price, ticker.price_change_percent);
//!
//! let candles = client.klines("ETHUSDT", "1h", Some(24)).await?;
//! println!("{} hourly candles", candles.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```no_run
//! use market_fetch_sdk::{FetchError, MarketDataClient};
//!
//! # async fn example() {
//! let client = MarketDataClient::global().await;
//!
//! match client.ticker_24hr("SOLUSDT").await {
//!     Ok(ticker) => println!("SOL: ${:.2}", ticker.last_price),
//!     Err(FetchError::RateLimited { retry_after }) => {
//!         println!("Rate limited, try again in {:?}", retry_after)
//!     }
//!     Err(e) => eprintln!("Error ({}): {}", e.status(), e),
//! }
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod queue;
pub mod rate_limiter;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::MarketDataClient;
pub use commands::CommandRegistry;
pub use config::ClientConfig;
pub use error::FetchError;
pub use fetch::{FetchHandle, FetchState};
pub use metrics::FetchMetrics;
pub use rate_limiter::RateLimitConfig;
pub use types::{
    CacheType, ClientStatus, ComponentHealth, ExchangeInfo, HealthStatus, Kline, RequestOptions,
    Ticker24hr,
};
