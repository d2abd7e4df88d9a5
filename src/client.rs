//! Market data client
//!
//! Decorates a [`Transport`] with the response cache, the fallback store,
//! the rate limiter and the request queue.

use crate::{
    cache::ResponseCache,
    clock::{Clock, TokioClock},
    config::ClientConfig,
    constants::{
        BACKGROUND_REFRESH_FRACTION, DEGRADED_FAILURE_COUNT, EXCHANGE_INFO_ENDPOINT,
        KLINES_ENDPOINT, TICKER_24HR_ENDPOINT,
    },
    error::FetchError,
    metrics::{FetchMetrics, MetricsCollector},
    queue::{RequestHandler, RequestQueue},
    rate_limiter::{RateLimitConfig, RateLimiter},
    transport::{HttpTransport, Transport},
    types::{
        CacheType, ClientStatus, ComponentHealth, ExchangeInfo, HealthStatus, Kline,
        RequestOptions, Ticker24hr,
    },
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

static GLOBAL_CLIENT: OnceCell<MarketDataClient> = OnceCell::const_new();

/// A network load that several callers may be waiting on
type SharedLoad = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// The uncached network path: rate limiter, transport, cache write, metrics
///
/// Concurrent loads of the same key share one request.
#[derive(Clone)]
struct Loader {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<Mutex<HashMap<String, SharedLoad>>>,
}

impl Loader {
    /// Loads `url` from the network, joining an identical load already running
    ///
    /// The load runs on its own task, so it completes, fills the cache and
    /// leaves the in-flight map even if every caller stops waiting.
    async fn load(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        let key = options.cache_key(url);

        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    tracing::debug!(url, "Joining in-flight request");
                    existing.clone()
                }
                None => {
                    let this = self.clone();
                    let url = url.to_string();
                    let options = options.clone();
                    let task_key = key.clone();
                    // The entry is inserted before this lock is released, so the
                    // task cannot remove it early
                    let task = tokio::spawn(async move {
                        let result = this.load_uncached(&url, &options, cache_type, &task_key).await;
                        this.in_flight.lock().await.remove(&task_key);
                        result
                    });
                    let load = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) if e.is_cancelled() => Err(FetchError::Cancelled),
                            Err(e) => Err(FetchError::Network(format!("load task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, load.clone());
                    load
                }
            }
        };

        shared.await
    }

    #[cfg(test)]
    async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn load_uncached(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
        key: &str,
    ) -> Result<Value, FetchError> {
        self.limiter.check().await?;

        let delay = self.limiter.progressive_delay().await;
        if !delay.is_zero() {
            tracing::debug!(url, delay_ms = delay.as_millis() as u64, "Applying progressive delay");
            self.clock.sleep(delay).await;
        }

        let start = self.clock.now();
        match self.transport.get_json(url, options).await {
            Ok(data) => {
                let latency = self.clock.now().saturating_duration_since(start);
                tracing::debug!(
                    url,
                    cache_type = %cache_type,
                    latency_ms = latency.as_millis() as u64,
                    "Fetched from network"
                );
                self.cache.set(key, data.clone(), cache_type).await;
                self.metrics.record_request(latency, true).await;
                Ok(data)
            }
            Err(e) => {
                let latency = self.clock.now().saturating_duration_since(start);
                self.metrics.record_request(latency, false).await;
                Err(e)
            }
        }
    }
}

/// Shared state behind every [`MarketDataClient`] handle
struct ClientInner {
    base_url: String,
    loader: Loader,
    background_refresh: AtomicBool,
}

impl ClientInner {
    async fn fetch_with_cache(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        let key = options.cache_key(url);
        let cache = &self.loader.cache;

        if let Some(entry) = cache.get_entry(&key, cache_type).await {
            self.loader.metrics.record_cache_hit().await;
            tracing::debug!(url, cache_type = %cache_type, "Cache hit");

            if self.background_refresh.load(Ordering::Relaxed) {
                let ttl = cache.ttl(cache_type).await;
                let age = entry.age(self.loader.clock.now());
                if age.as_secs_f64() > ttl.as_secs_f64() * BACKGROUND_REFRESH_FRACTION {
                    self.spawn_background_refresh(url, options, cache_type);
                }
            }

            return Ok(entry.data);
        }

        self.loader.metrics.record_cache_miss().await;
        tracing::debug!(url, cache_type = %cache_type, "Cache miss");

        let result = self.loader.load(url, options, cache_type).await;
        self.with_fallback(&key, url, result).await
    }

    async fn force_refresh(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        let key = options.cache_key(url);
        let result = self.loader.load(url, options, cache_type).await;
        self.with_fallback(&key, url, result).await
    }

    /// Substitutes stale data for a failed load when any is available
    async fn with_fallback(
        &self,
        key: &str,
        url: &str,
        result: Result<Value, FetchError>,
    ) -> Result<Value, FetchError> {
        let err = match result {
            Ok(data) => return Ok(data),
            Err(e) => e,
        };

        match self.loader.cache.get_fallback(key).await {
            Some(data) => {
                tracing::warn!(url, error = %err, "Fetch failed, serving fallback data");
                self.loader.metrics.record_fallback_hit().await;
                Ok(data)
            }
            None => Err(err),
        }
    }

    fn spawn_background_refresh(&self, url: &str, options: &RequestOptions, cache_type: CacheType) {
        let loader = self.loader.clone();
        let url = url.to_string();
        let options = options.clone();

        tokio::spawn(async move {
            tracing::debug!(url = %url, "Starting background refresh");
            if let Err(e) = loader.load(&url, &options, cache_type).await {
                tracing::warn!(url = %url, error = %e, "Background refresh failed");
            }
        });
    }
}

#[async_trait]
impl RequestHandler for ClientInner {
    async fn handle(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        self.fetch_with_cache(url, options, cache_type).await
    }
}

/// Cached, queued and rate-limited market data client
///
/// Cloning is cheap; clones share the cache, limiter and queue.
///
/// # Example
/// ```no_run
/// use market_fetch_sdk::MarketDataClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = MarketDataClient::global().await;
/// let ticker = client.ticker_24hr("BTCUSDT").await?;
/// println!("BTC: ${:.2}", ticker.last_price);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MarketDataClient {
    inner: Arc<ClientInner>,
    queue: RequestQueue,
}

impl MarketDataClient {
    /// Returns the global instance
    ///
    /// On first call this builds a client from [`ClientConfig::from_env`].
    /// If the HTTP client cannot be built, the default reqwest client is used.
    ///
    /// The queue worker is spawned on the runtime that makes the first call and
    /// lives as long as that runtime. Once it shuts down, queued requests on the
    /// global client fail with `FetchError::QueueClosed`; programs that create
    /// and drop several runtimes (one per test, say) should build their own
    /// client with [`MarketDataClient::new`] instead.
    pub async fn global() -> Self {
        GLOBAL_CLIENT
            .get_or_init(|| async {
                let config = ClientConfig::from_env();
                let transport = HttpTransport::new(config.request_timeout).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Failed to build HTTP client, using defaults");
                    HttpTransport::default()
                });
                Self::with_transport(config, Arc::new(transport))
            })
            .await
            .clone()
    }

    /// Creates a client that talks HTTP
    ///
    /// Must be called from within a Tokio runtime (the queue worker is spawned here).
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Creates a client with a custom transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_parts(config, transport, Arc::new(TokioClock))
    }

    /// Creates a client with a custom transport and clock
    ///
    /// This is primarily for testing with a manually driven clock.
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let loader = Loader {
            metrics: Arc::new(MetricsCollector::new(transport.transport_name())),
            cache: Arc::new(ResponseCache::new(clock.clone())),
            limiter: Arc::new(RateLimiter::new(config.rate_limit, clock.clone())),
            transport,
            clock: clock.clone(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        };

        let inner = Arc::new(ClientInner {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            loader,
            background_refresh: AtomicBool::new(config.background_refresh),
        });

        let queue = RequestQueue::spawn(inner.clone(), clock, config.min_delay_between_requests);

        Self { inner, queue }
    }

    /// Fetches through the cache, bypassing the queue
    ///
    /// Returns a fresh cached value when there is one. Otherwise the request
    /// passes the rate limiter and goes to the network; on failure stale
    /// fallback data is returned if any exists.
    pub async fn fetch_with_cache(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        self.inner.fetch_with_cache(url, options, cache_type).await
    }

    /// Fetches through the FIFO queue and then the cache
    pub async fn queue_request(
        &self,
        url: &str,
        options: RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        self.queue.enqueue(url, options, cache_type).await
    }

    /// Fetches from the network regardless of the cache and stores the result
    pub async fn force_refresh(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        tracing::info!(url, cache_type = %cache_type, "Forcing refresh");
        self.inner.force_refresh(url, options, cache_type).await
    }

    /// Absolute URL for an API path
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    /// 24h statistics for one symbol
    pub async fn ticker_24hr(&self, symbol: &str) -> Result<Ticker24hr, FetchError> {
        let options = RequestOptions::new().query("symbol", symbol);
        let data = self
            .queue_request(&self.endpoint_url(TICKER_24HR_ENDPOINT), options, CacheType::MarketData)
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// 24h statistics for every symbol
    pub async fn all_tickers_24hr(&self) -> Result<Vec<Ticker24hr>, FetchError> {
        let data = self
            .queue_request(
                &self.endpoint_url(TICKER_24HR_ENDPOINT),
                RequestOptions::new(),
                CacheType::MarketData,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Candlesticks for a symbol
    ///
    /// # Arguments
    /// * `symbol` - Trading pair, e.g. `BTCUSDT`
    /// * `interval` - Exchange interval string, e.g. `1h`
    /// * `limit` - Maximum number of candles, exchange default if `None`
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>, FetchError> {
        let mut options = RequestOptions::new()
            .query("symbol", symbol)
            .query("interval", interval);
        if let Some(limit) = limit {
            options = options.query("limit", limit);
        }

        let data = self
            .queue_request(&self.endpoint_url(KLINES_ENDPOINT), options, CacheType::HistoricalData)
            .await?;
        let rows = data
            .as_array()
            .ok_or_else(|| FetchError::invalid_response("klines response is not an array"))?;
        rows.iter().map(Kline::try_from).collect()
    }

    /// Exchange trading rules and symbol list
    pub async fn exchange_info(&self) -> Result<ExchangeInfo, FetchError> {
        let data = self
            .queue_request(
                &self.endpoint_url(EXCHANGE_INFO_ENDPOINT),
                RequestOptions::new(),
                CacheType::CoinDetails,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Empties the cache and the fallback store
    pub async fn clear_cache(&self) {
        self.inner.loader.cache.clear().await;
        tracing::info!("Cache cleared");
    }

    /// Changes the TTL of a cache type
    pub async fn set_ttl(&self, cache_type: CacheType, ttl: Duration) {
        self.inner.loader.cache.set_ttl(cache_type, ttl).await;
    }

    /// Changes the rate limit parameters
    pub async fn set_rate_limit(&self, config: RateLimitConfig) -> Result<(), FetchError> {
        self.inner.loader.limiter.configure(config).await
    }

    /// Clears the rate limiter state
    pub async fn reset_rate_limiter(&self) {
        self.inner.loader.limiter.reset().await;
    }

    /// Enables or disables background refresh
    pub fn set_background_refresh(&self, enabled: bool) {
        self.inner.background_refresh.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "Background refresh changed");
    }

    /// Flips background refresh and returns the new setting
    pub fn toggle_background_refresh(&self) -> bool {
        let enabled = !self.inner.background_refresh.fetch_xor(true, Ordering::Relaxed);
        tracing::info!(enabled, "Background refresh toggled");
        enabled
    }

    /// Whether background refresh is enabled
    pub fn background_refresh_enabled(&self) -> bool {
        self.inner.background_refresh.load(Ordering::Relaxed)
    }

    /// Requests waiting in the queue
    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    /// The response cache
    pub fn cache(&self) -> &ResponseCache {
        &self.inner.loader.cache
    }

    /// The rate limiter
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.loader.limiter
    }

    /// The time source shared by the cache, limiter and queue
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.loader.clock.clone()
    }

    /// Returns the name of the underlying transport
    pub fn transport_name(&self) -> &str {
        self.inner.loader.transport.transport_name()
    }

    /// Gets latency percentiles, success rate and cache counters
    pub async fn get_metrics(&self) -> FetchMetrics {
        self.inner.loader.metrics.get_metrics().await
    }

    /// Snapshot of cache, limiter, queue and counters
    pub async fn status(&self) -> ClientStatus {
        let metrics = self.get_metrics().await;
        let ttl_secs: BTreeMap<String, u64> = self
            .cache()
            .ttls()
            .await
            .into_iter()
            .map(|(t, ttl)| (t.as_str().to_string(), ttl.as_secs()))
            .collect();

        ClientStatus {
            cache: self.cache().stats().await,
            ttl_secs,
            rate_limit: self.rate_limiter().snapshot().await,
            queue_length: self.queue_length(),
            background_refresh: self.background_refresh_enabled(),
            cache_hits: metrics.cache_hits,
            cache_misses: metrics.cache_misses,
            fallback_hits: metrics.fallback_hits,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Perform a health check on the client
    ///
    /// # Returns
    /// ComponentHealth indicating the status of the network path and limiter
    pub async fn health_check(&self) -> ComponentHealth {
        let metrics = self.get_metrics().await;
        let rate_limit = self.rate_limiter().snapshot().await;
        let cache = self.cache().stats().await;

        let mut details = HashMap::new();
        details.insert("transport".to_string(), serde_json::json!(self.transport_name()));
        details.insert("success_rate".to_string(), serde_json::json!(metrics.success_rate));
        details.insert("latency_p50_ms".to_string(), serde_json::json!(metrics.latency_p50_ms));
        details.insert("latency_p99_ms".to_string(), serde_json::json!(metrics.latency_p99_ms));
        details.insert("cache_entries".to_string(), serde_json::json!(cache.live_entries));
        details.insert("fallback_entries".to_string(), serde_json::json!(cache.fallback_entries));
        details.insert(
            "rate_limit_utilization".to_string(),
            serde_json::json!(rate_limit.utilization()),
        );
        details.insert(
            "backoff_remaining_ms".to_string(),
            serde_json::json!(rate_limit.backoff_remaining_ms),
        );

        let status = if metrics.success_rate < 0.5 {
            HealthStatus::Unhealthy
        } else if rate_limit.backoff_remaining_ms > 0
            || metrics.recent_failures >= DEGRADED_FAILURE_COUNT
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let message = match status {
            HealthStatus::Healthy => "Market data client is operational".to_string(),
            HealthStatus::Degraded if rate_limit.backoff_remaining_ms > 0 => format!(
                "Rate limited for another {}ms",
                rate_limit.backoff_remaining_ms
            ),
            HealthStatus::Degraded => format!(
                "{} recent network failures",
                metrics.recent_failures
            ),
            HealthStatus::Unhealthy => format!(
                "Network success rate is {:.0}%",
                metrics.success_rate * 100.0
            ),
        };

        ComponentHealth {
            name: "market_data_client".to_string(),
            status,
            message: Some(message),
            details,
            last_checked: chrono::Utc::now(),
        }
    }
}
