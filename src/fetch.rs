//! Observable fetch handle
//!
//! A [`FetchHandle`] runs one request through the client's queue in a
//! background task and publishes `{data, is_loading, error}` through a watch
//! channel. A rate-limit failure schedules exactly one automatic retry after
//! the indicated wait. Dropping the handle cancels the running request and
//! any pending retry timer.

use crate::{
    client::MarketDataClient,
    error::FetchError,
    types::{CacheType, RequestOptions},
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Observable state of a fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchState {
    /// Last successfully fetched value
    pub data: Option<Value>,
    /// True while a request (or its automatic retry) is outstanding
    pub is_loading: bool,
    /// Error of the last attempt, cleared when a new attempt starts
    pub error: Option<FetchError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Through the queue and the cache
    Cached,
    /// Straight to the network
    Refresh,
}

struct FetchRequest {
    url: String,
    options: RequestOptions,
    cache_type: CacheType,
}

/// Handle to a background fetch
pub struct FetchHandle {
    client: MarketDataClient,
    request: Arc<FetchRequest>,
    state_tx: Arc<watch::Sender<FetchState>>,
    state_rx: watch::Receiver<FetchState>,
    /// Cancelled when the handle goes away
    scope: CancellationToken,
    /// Token of the attempt currently running
    current: Mutex<CancellationToken>,
}

impl FetchHandle {
    /// Starts fetching `url` through the client's queue
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        client: MarketDataClient,
        url: &str,
        options: RequestOptions,
        cache_type: CacheType,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(FetchState::default());
        let scope = CancellationToken::new();

        let handle = Self {
            client,
            request: Arc::new(FetchRequest {
                url: url.to_string(),
                options,
                cache_type,
            }),
            state_tx: Arc::new(state_tx),
            state_rx,
            current: Mutex::new(scope.child_token()),
            scope,
        };
        handle.start(FetchMode::Cached);
        handle
    }

    /// Current state
    pub fn state(&self) -> FetchState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.state_rx.clone()
    }

    /// Waits until no request is outstanding and returns the state
    pub async fn settled(&self) -> FetchState {
        let mut rx = self.state_rx.clone();
        let settled = rx.wait_for(|s| !s.is_loading).await.map(|s| s.clone());
        settled.unwrap_or_else(|_| self.state())
    }

    /// Runs the request again through the queue and the cache
    pub fn retry(&self) {
        self.start(FetchMode::Cached);
    }

    /// Runs the request again, bypassing the cache
    pub fn refetch(&self) {
        self.start(FetchMode::Refresh);
    }

    /// Cancels the running attempt and any pending retry
    pub fn cancel(&self) {
        self.lock_current().cancel();
        self.state_tx.send_modify(|s| {
            if s.is_loading {
                s.is_loading = false;
                s.error = Some(FetchError::Cancelled);
            }
        });
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, mode: FetchMode) {
        let token = self.scope.child_token();
        {
            let mut current = self.lock_current();
            current.cancel();
            *current = token.clone();
        }

        self.state_tx.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
        });

        tokio::spawn(run_attempts(
            self.client.clone(),
            self.request.clone(),
            mode,
            self.state_tx.clone(),
            token,
        ));
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn run_attempts(
    client: MarketDataClient,
    request: Arc<FetchRequest>,
    mode: FetchMode,
    state: Arc<watch::Sender<FetchState>>,
    token: CancellationToken,
) {
    let mut retried = false;

    loop {
        let attempt = async {
            match mode {
                FetchMode::Cached => {
                    client
                        .queue_request(&request.url, request.options.clone(), request.cache_type)
                        .await
                }
                FetchMode::Refresh => {
                    client
                        .force_refresh(&request.url, &request.options, request.cache_type)
                        .await
                }
            }
        };

        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = attempt => result,
        };

        match result {
            Ok(data) => {
                publish(&state, &token, |s| {
                    s.data = Some(data);
                    s.error = None;
                    s.is_loading = false;
                });
                return;
            }
            Err(e) if e.is_rate_limited() && !retried => {
                retried = true;
                let wait = e.retry_after().unwrap_or_default();
                tracing::debug!(
                    url = %request.url,
                    retry_after_ms = wait.as_millis() as u64,
                    "Rate limited, scheduling retry"
                );
                publish(&state, &token, |s| s.error = Some(e));

                let clock = client.clock();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = clock.sleep(wait) => {}
                }
                publish(&state, &token, |s| s.error = None);
            }
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Fetch failed");
                publish(&state, &token, |s| {
                    s.error = Some(e);
                    s.is_loading = false;
                });
                return;
            }
        }
    }
}

/// Applies `update` unless the attempt owning `token` has been superseded
///
/// The check runs under the channel's write lock, so an attempt cancelled by
/// [`FetchHandle::retry`] or [`FetchHandle::refetch`] cannot overwrite the
/// state of the attempt that replaced it.
fn publish<F>(state: &watch::Sender<FetchState>, token: &CancellationToken, update: F)
where
    F: FnOnce(&mut FetchState),
{
    state.send_if_modified(|s| {
        if token.is_cancelled() {
            return false;
        }
        update(s);
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    const URL: &str = "https://api.test/x";

    fn config() -> ClientConfig {
        ClientConfig {
            background_refresh: false,
            ..ClientConfig::default()
        }
    }

    fn manual_client(mock: MockTransport) -> (MarketDataClient, Arc<MockTransport>) {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(mock.with_clock(clock.clone()));
        let client = MarketDataClient::with_parts(config(), transport.clone(), clock);
        (client, transport)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock = MockTransport::new();
        mock.set_response(URL, Ok(json!({"ok": true})));
        let (client, _transport) = manual_client(mock);

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        let state = handle.settled().await;

        assert_eq!(state.data, Some(json!({"ok": true})));
        assert_eq!(state.error, None);
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_once_and_succeeds() {
        let mock = MockTransport::new();
        mock.push_response(URL, Err(FetchError::rate_limited(Duration::from_secs(2))));
        mock.push_response(URL, Ok(json!(1)));
        let (client, transport) = manual_client(mock);

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        let state = handle.settled().await;

        assert_eq!(state.data, Some(json!(1)));
        assert_eq!(state.error, None);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_only_once() {
        let mock = MockTransport::new();
        mock.set_response(URL, Err(FetchError::rate_limited(Duration::from_secs(1))));
        let (client, transport) = manual_client(mock);

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        let state = handle.settled().await;

        assert!(state.error.as_ref().is_some_and(FetchError::is_rate_limited));
        assert_eq!(state.data, None);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_terminal_until_retry() {
        let mock = MockTransport::new();
        mock.push_response(URL, Err(FetchError::http(500, "boom")));
        mock.push_response(URL, Ok(json!("recovered")));
        let (client, transport) = manual_client(mock);

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        let state = handle.settled().await;
        assert_eq!(state.error.map(|e| e.status()), Some(500));
        assert_eq!(transport.call_count(), 1);

        handle.retry();
        let state = handle.settled().await;
        assert_eq!(state.data, Some(json!("recovered")));
        assert_eq!(state.error, None);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refetch_bypasses_cache() {
        let mock = MockTransport::new();
        mock.push_response(URL, Ok(json!("v1")));
        mock.push_response(URL, Ok(json!("v2")));
        let (client, transport) = manual_client(mock);

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        assert_eq!(handle.settled().await.data, Some(json!("v1")));

        handle.retry();
        assert_eq!(handle.settled().await.data, Some(json!("v1")));
        assert_eq!(transport.call_count(), 1);

        handle.refetch();
        assert_eq!(handle.settled().await.data, Some(json!("v2")));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_refetch_does_not_block_later_fetches() {
        let mock = MockTransport::new().with_latency(Duration::from_secs(1));
        mock.push_response(URL, Ok(json!("v1")));
        mock.push_response(URL, Err(FetchError::Network("operation timed out".into())));
        mock.push_response(URL, Ok(json!("v3")));
        let transport = Arc::new(mock);
        let client = MarketDataClient::with_transport(config(), transport.clone());

        let handle =
            FetchHandle::spawn(client.clone(), URL, RequestOptions::new(), CacheType::MarketData);
        assert_eq!(handle.settled().await.data, Some(json!("v1")));

        handle.refetch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        let value = client
            .fetch_with_cache(URL, &RequestOptions::new(), CacheType::MarketData)
            .await
            .unwrap();
        assert_eq!(value, json!("v3"));
        assert_eq!(transport.call_count(), 3);
    }

    #[test]
    fn test_superseded_attempt_does_not_publish() {
        let (tx, rx) = watch::channel(FetchState {
            is_loading: true,
            ..FetchState::default()
        });
        let superseded = CancellationToken::new();
        let current = CancellationToken::new();
        superseded.cancel();

        publish(&tx, &superseded, |s| {
            s.data = Some(json!("old"));
            s.is_loading = false;
        });
        assert!(rx.borrow().is_loading);
        assert_eq!(rx.borrow().data, None);

        publish(&tx, &current, |s| {
            s.data = Some(json!("new"));
            s.is_loading = false;
        });
        assert!(!rx.borrow().is_loading);
        assert_eq!(rx.borrow().data, Some(json!("new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_retry() {
        let mock = MockTransport::new();
        mock.push_response(URL, Err(FetchError::rate_limited(Duration::from_secs(30))));
        mock.push_response(URL, Ok(json!(1)));
        let transport = Arc::new(mock);
        let client = MarketDataClient::with_transport(config(), transport.clone());

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.error.is_some()).await.unwrap();
        assert_eq!(transport.call_count(), 1);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(rx.borrow().data, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_marks_state() {
        let mock = MockTransport::new().with_latency(Duration::from_secs(5));
        mock.set_response(URL, Ok(json!(1)));
        let client = MarketDataClient::with_transport(config(), Arc::new(mock));

        let handle = FetchHandle::spawn(client, URL, RequestOptions::new(), CacheType::MarketData);
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let state = handle.settled().await;
        assert_eq!(state.error, Some(FetchError::Cancelled));
        assert_eq!(state.data, None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.state().data, None);
    }
}
