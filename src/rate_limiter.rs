//! Sliding-window rate limiter with progressive delay
//!
//! Admission is counted over the trailing window. Once the window is full the
//! limiter sets a backoff deadline at the moment the oldest request leaves the
//! window and rejects everything until then. Separately, a progressive delay
//! grows while the window is more than half full and decays otherwise; the
//! client sleeps for it before each network request to smooth bursts.

use crate::{
    clock::Clock,
    constants::{
        PROGRESSIVE_DELAY_DECAY_MS, PROGRESSIVE_DELAY_MAX_MS, PROGRESSIVE_DELAY_STEP_MS,
        PROGRESSIVE_DELAY_THRESHOLD, RATE_LIMIT_MAX_REQUESTS, RATE_LIMIT_WINDOW_SECS,
    },
    error::FetchError,
    types::RateLimitSnapshot,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limit parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: usize,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: RATE_LIMIT_MAX_REQUESTS,
            window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
        }
    }
}

impl RateLimitConfig {
    /// Rejects a zero limit or an empty window
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.max_requests == 0 {
            return Err(FetchError::invalid_argument("max_requests must be positive"));
        }
        if self.window.is_zero() {
            return Err(FetchError::invalid_argument("window must be positive"));
        }
        Ok(())
    }

    /// Raises a zero limit to one request and replaces an empty window with the default
    pub fn clamped(self) -> Self {
        Self {
            max_requests: self.max_requests.max(1),
            window: if self.window.is_zero() {
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS)
            } else {
                self.window
            },
        }
    }
}

#[derive(Debug, Default)]
struct RateLimitState {
    /// Admission times inside the current window, oldest first
    requests: VecDeque<Instant>,
    backoff_until: Option<Instant>,
    progressive_delay: Duration,
}

impl RateLimitState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.requests.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.backoff_until.is_some_and(|until| until <= now) {
            self.backoff_until = None;
        }
    }
}

/// Sliding-window rate limiter
pub struct RateLimiter {
    config: Mutex<RateLimitConfig>,
    state: Mutex<RateLimitState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter with the given parameters
    ///
    /// Invalid parameters are clamped with [`RateLimitConfig::clamped`] so the
    /// limiter never rejects every request.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let clamped = config.clamped();
        if clamped != config {
            tracing::warn!(
                max_requests = config.max_requests,
                window_secs = config.window.as_secs(),
                "Invalid rate limit clamped"
            );
        }
        Self {
            config: Mutex::new(clamped),
            state: Mutex::new(RateLimitState::default()),
            clock,
        }
    }

    /// Admits one request or rejects it
    ///
    /// # Returns
    /// `Ok(())` after recording the request, or `FetchError::RateLimited`
    /// carrying the time until the window has room again.
    pub async fn check(&self) -> Result<(), FetchError> {
        let config = *self.config.lock().await;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.prune(now, config.window);

        if let Some(until) = state.backoff_until {
            let retry_after = until.saturating_duration_since(now);
            tracing::debug!(retry_after_ms = retry_after.as_millis() as u64, "Rate limiter in backoff");
            return Err(FetchError::rate_limited(retry_after));
        }

        if state.requests.len() >= config.max_requests {
            let retry_after = match state.requests.front() {
                Some(oldest) => (*oldest + config.window).saturating_duration_since(now),
                None => config.window,
            };
            state.backoff_until = Some(now + retry_after);
            tracing::warn!(
                requests_in_window = state.requests.len(),
                max_requests = config.max_requests,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit reached"
            );
            return Err(FetchError::rate_limited(retry_after));
        }

        state.requests.push_back(now);
        Ok(())
    }

    /// Updates and returns the pre-request smoothing delay
    pub async fn progressive_delay(&self) -> Duration {
        let config = *self.config.lock().await;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.prune(now, config.window);

        let utilization = state.requests.len() as f64 / config.max_requests as f64;
        state.progressive_delay = if utilization > PROGRESSIVE_DELAY_THRESHOLD {
            (state.progressive_delay + Duration::from_millis(PROGRESSIVE_DELAY_STEP_MS))
                .min(Duration::from_millis(PROGRESSIVE_DELAY_MAX_MS))
        } else {
            state
                .progressive_delay
                .saturating_sub(Duration::from_millis(PROGRESSIVE_DELAY_DECAY_MS))
        };

        state.progressive_delay
    }

    /// Clears all counters, the backoff deadline and the progressive delay
    pub async fn reset(&self) {
        *self.state.lock().await = RateLimitState::default();
        tracing::info!("Rate limiter reset");
    }

    /// Changes the limit parameters; recorded requests are kept
    pub async fn configure(&self, config: RateLimitConfig) -> Result<(), FetchError> {
        config.validate()?;
        *self.config.lock().await = config;
        tracing::info!(
            max_requests = config.max_requests,
            window_secs = config.window.as_secs(),
            "Rate limit changed"
        );
        Ok(())
    }

    /// Current parameters
    pub async fn config(&self) -> RateLimitConfig {
        *self.config.lock().await
    }

    /// Point-in-time view of the limiter
    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let config = *self.config.lock().await;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.prune(now, config.window);

        RateLimitSnapshot {
            requests_in_window: state.requests.len(),
            max_requests: config.max_requests,
            window_ms: config.window.as_millis() as u64,
            backoff_remaining_ms: state
                .backoff_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
            progressive_delay_ms: state.progressive_delay.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max_requests: usize, window_secs: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig {
            max_requests,
            window: Duration::from_secs(window_secs),
        };
        (RateLimiter::new(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_admits_exactly_max_requests() {
        let (limiter, clock) = limiter(5, 60);

        for _ in 0..5 {
            limiter.check().await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        // Oldest was recorded 5s ago, so it leaves the window in 55s
        let err = limiter.check().await.unwrap_err();
        assert_eq!(err.status(), 429);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(55)));
    }

    #[tokio::test]
    async fn test_backoff_holds_until_oldest_leaves_window() {
        let (limiter, clock) = limiter(2, 10);
        limiter.check().await.unwrap();
        limiter.check().await.unwrap();
        assert!(limiter.check().await.is_err());

        clock.advance(Duration::from_secs(4));
        let err = limiter.check().await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(6)));
        assert_eq!(limiter.snapshot().await.backoff_remaining_ms, 6000);

        clock.advance(Duration::from_secs(6));
        limiter.check().await.unwrap();
        assert_eq!(limiter.snapshot().await.requests_in_window, 1);
    }

    #[tokio::test]
    async fn test_new_clamps_invalid_config() {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig {
            max_requests: 0,
            window: Duration::ZERO,
        };
        let limiter = RateLimiter::new(config, clock);

        assert_eq!(
            limiter.config().await,
            RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            }
        );
        limiter.check().await.unwrap();
        assert!(limiter.check().await.is_err());
    }

    #[tokio::test]
    async fn test_sliding_window_admits_again() {
        let (limiter, clock) = limiter(3, 60);
        for _ in 0..3 {
            limiter.check().await.unwrap();
        }
        clock.advance(Duration::from_secs(60));
        for _ in 0..3 {
            limiter.check().await.unwrap();
        }
        assert!(limiter.check().await.is_err());
    }

    #[tokio::test]
    async fn test_progressive_delay_grows_and_decays() {
        let (limiter, clock) = limiter(4, 60);
        assert_eq!(limiter.progressive_delay().await, Duration::ZERO);

        for _ in 0..3 {
            limiter.check().await.unwrap();
        }
        // 3/4 > 50%
        assert_eq!(limiter.progressive_delay().await, Duration::from_millis(100));
        assert_eq!(limiter.progressive_delay().await, Duration::from_millis(200));

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.progressive_delay().await, Duration::from_millis(150));
        assert_eq!(limiter.progressive_delay().await, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_progressive_delay_is_capped() {
        let (limiter, _clock) = limiter(2, 60);
        limiter.check().await.unwrap();
        limiter.check().await.unwrap();
        for _ in 0..50 {
            limiter.progressive_delay().await;
        }
        assert_eq!(
            limiter.progressive_delay().await,
            Duration::from_millis(PROGRESSIVE_DELAY_MAX_MS)
        );
    }

    #[tokio::test]
    async fn test_reset_restores_counters() {
        let (limiter, _clock) = limiter(1, 60);
        limiter.check().await.unwrap();
        assert!(limiter.check().await.is_err());
        limiter.progressive_delay().await;

        limiter.reset().await;
        let snapshot = limiter.snapshot().await;
        assert_eq!(snapshot.requests_in_window, 0);
        assert_eq!(snapshot.backoff_remaining_ms, 0);
        assert_eq!(snapshot.progressive_delay_ms, 0);
        limiter.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_validates() {
        let (limiter, _clock) = limiter(1, 60);
        let bad = RateLimitConfig {
            max_requests: 0,
            window: Duration::from_secs(1),
        };
        assert!(matches!(
            limiter.configure(bad).await,
            Err(FetchError::InvalidArgument(_))
        ));

        let good = RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(30),
        };
        limiter.configure(good).await.unwrap();
        assert_eq!(limiter.config().await, good);
    }
}
