//! Fetch metrics collection and reporting
//!
//! Tracks network latency percentiles, success rates and cache effectiveness.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;

/// Maximum number of samples to keep for metrics calculation
const MAX_SAMPLES: usize = 100;

/// Metrics for the network path and the cache
#[derive(Debug, Clone, PartialEq)]
pub struct FetchMetrics {
    /// Name of the transport
    pub transport_name: String,
    /// 50th percentile latency in milliseconds
    pub latency_p50_ms: f64,
    /// 99th percentile latency in milliseconds
    pub latency_p99_ms: f64,
    /// Success rate over the sample window (0.0 to 1.0)
    pub success_rate: f64,
    /// Failures inside the sample window
    pub recent_failures: u64,
    /// Total number of network requests
    pub total_requests: u64,
    /// Number of failed network requests
    pub failed_requests: u64,
    /// Requests answered from the live cache
    pub cache_hits: u64,
    /// Requests that missed the live cache
    pub cache_misses: u64,
    /// Failures answered from the fallback store
    pub fallback_hits: u64,
}

impl FetchMetrics {
    /// Creates metrics with no data
    pub fn empty(transport_name: &str) -> Self {
        Self {
            transport_name: transport_name.to_string(),
            latency_p50_ms: 0.0,
            latency_p99_ms: 0.0,
            success_rate: 1.0,
            recent_failures: 0,
            total_requests: 0,
            failed_requests: 0,
            cache_hits: 0,
            cache_misses: 0,
            fallback_hits: 0,
        }
    }
}

/// Internal sample for latency tracking
#[derive(Debug, Clone)]
struct LatencySample {
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    failed_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    fallback_hits: u64,
}

/// Collects and computes metrics for the client
pub struct MetricsCollector {
    transport_name: String,
    /// Rolling window of latency samples
    samples: RwLock<VecDeque<LatencySample>>,
    counters: RwLock<Counters>,
}

impl MetricsCollector {
    /// Creates a new metrics collector
    pub fn new(transport_name: &str) -> Self {
        Self {
            transport_name: transport_name.to_string(),
            samples: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            counters: RwLock::new(Counters::default()),
        }
    }

    /// Records a network request with its duration and success status
    pub async fn record_request(&self, duration: Duration, success: bool) {
        let duration_ms = duration.as_secs_f64() * 1000.0;

        {
            let mut counters = self.counters.write().await;
            counters.total_requests += 1;
            if !success {
                counters.failed_requests += 1;
            }
        }

        let mut samples = self.samples.write().await;
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(LatencySample {
            duration_ms,
            success,
        });
    }

    pub async fn record_cache_hit(&self) {
        self.counters.write().await.cache_hits += 1;
    }

    pub async fn record_cache_miss(&self) {
        self.counters.write().await.cache_misses += 1;
    }

    pub async fn record_fallback_hit(&self) {
        self.counters.write().await.fallback_hits += 1;
    }

    /// Computes current metrics from collected samples
    pub async fn get_metrics(&self) -> FetchMetrics {
        let samples = self.samples.read().await;
        let counters = self.counters.read().await;

        let mut metrics = FetchMetrics::empty(&self.transport_name);
        metrics.total_requests = counters.total_requests;
        metrics.failed_requests = counters.failed_requests;
        metrics.cache_hits = counters.cache_hits;
        metrics.cache_misses = counters.cache_misses;
        metrics.fallback_hits = counters.fallback_hits;

        if samples.is_empty() {
            return metrics;
        }

        // Extract successful latencies for percentile calculation
        let mut latencies: Vec<f64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration_ms)
            .collect();

        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let recent_failures = samples.iter().filter(|s| !s.success).count();

        metrics.latency_p50_ms = percentile(&latencies, 50.0);
        metrics.latency_p99_ms = percentile(&latencies, 99.0);
        metrics.recent_failures = recent_failures as u64;
        metrics.success_rate = (samples.len() - recent_failures) as f64 / samples.len() as f64;
        metrics
    }
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}
