//! FIFO request queue drained by a single worker task
//!
//! Requests are dispatched strictly in arrival order, one at a time, with at
//! least `min_delay` between the start of two consecutive dispatches. Each
//! dispatch is awaited before the next entry is taken, so queued requests for
//! the same key after the first are answered from the cache.

use crate::{
    clock::Clock,
    error::FetchError,
    types::{CacheType, RequestOptions},
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

/// Something that can serve a dequeued request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Serves one request
    async fn handle(
        &self,
        url: &str,
        options: &RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError>;
}

/// A pending request and the channel its result goes back on
struct QueuedRequest {
    id: Uuid,
    url: String,
    options: RequestOptions,
    cache_type: CacheType,
    responder: oneshot::Sender<Result<Value, FetchError>>,
}

/// Handle to the request queue
///
/// Cloning shares the same queue. The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    pending: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Starts the worker task and returns the queue handle
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<H: RequestHandler>(
        handler: Arc<H>,
        clock: Arc<dyn Clock>,
        min_delay: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_worker(handler, clock, min_delay, rx, pending.clone()));

        Self { tx, pending }
    }

    /// Appends a request and waits for its result
    pub async fn enqueue(
        &self,
        url: &str,
        options: RequestOptions,
        cache_type: CacheType,
    ) -> Result<Value, FetchError> {
        let (responder, rx) = oneshot::channel();
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            url: url.to_string(),
            options,
            cache_type,
            responder,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(FetchError::QueueClosed);
        }

        rx.await.map_err(|_| FetchError::QueueClosed)?
    }

    /// Requests waiting to be dispatched
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_worker<H: RequestHandler>(
    handler: Arc<H>,
    clock: Arc<dyn Clock>,
    min_delay: Duration,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    pending: Arc<AtomicUsize>,
) {
    tracing::info!(
        min_delay_ms = min_delay.as_millis() as u64,
        "Starting request queue worker"
    );

    let mut last_dispatch: Option<Instant> = None;

    while let Some(request) = rx.recv().await {
        pending.fetch_sub(1, Ordering::SeqCst);

        if let Some(last) = last_dispatch {
            let elapsed = clock.now().saturating_duration_since(last);
            if elapsed < min_delay {
                clock.sleep(min_delay - elapsed).await;
            }
        }
        last_dispatch = Some(clock.now());

        tracing::debug!(
            request_id = %request.id,
            url = %request.url,
            cache_type = %request.cache_type,
            "Dispatching queued request"
        );

        let result = handler
            .handle(&request.url, &request.options, request.cache_type)
            .await;

        if request.responder.send(result).is_err() {
            tracing::debug!(request_id = %request.id, "Caller dropped before queued request completed");
        }
    }

    tracing::debug!("Request queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;

    struct RecordingHandler {
        clock: Arc<ManualClock>,
        calls: Mutex<Vec<(String, Instant)>>,
        work: Duration,
    }

    #[async_trait]
    impl RequestHandler for RecordingHandler {
        async fn handle(
            &self,
            url: &str,
            _options: &RequestOptions,
            _cache_type: CacheType,
        ) -> Result<Value, FetchError> {
            self.calls.lock().unwrap().push((url.to_string(), self.clock.now()));
            self.clock.advance(self.work);
            if url == "bad" {
                return Err(FetchError::http(500, "boom"));
            }
            Ok(Value::String(url.to_string()))
        }
    }

    fn handler(work: Duration) -> (Arc<RecordingHandler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let handler = Arc::new(RecordingHandler {
            clock: clock.clone(),
            calls: Mutex::new(Vec::new()),
            work,
        });
        (handler, clock)
    }

    #[tokio::test]
    async fn test_fifo_order_with_min_gap() {
        let (handler, clock) = handler(Duration::from_millis(10));
        let queue = RequestQueue::spawn(handler.clone(), clock, Duration::from_millis(50));

        let (a, b, c) = tokio::join!(
            queue.enqueue("a", RequestOptions::new(), CacheType::MarketData),
            queue.enqueue("b", RequestOptions::new(), CacheType::MarketData),
            queue.enqueue("c", RequestOptions::new(), CacheType::MarketData),
        );
        assert_eq!(a.unwrap(), Value::from("a"));
        assert_eq!(b.unwrap(), Value::from("b"));
        assert_eq!(c.unwrap(), Value::from("c"));

        let calls = handler.calls.lock().unwrap().clone();
        let urls: Vec<&str> = calls.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(50));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_slow_dispatch_needs_no_extra_gap() {
        let (handler, clock) = handler(Duration::from_millis(80));
        let queue = RequestQueue::spawn(handler.clone(), clock, Duration::from_millis(50));

        let _ = tokio::join!(
            queue.enqueue("a", RequestOptions::new(), CacheType::MarketData),
            queue.enqueue("b", RequestOptions::new(), CacheType::MarketData),
        );

        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(calls[1].1 - calls[0].1, Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_errors_are_delivered_to_caller() {
        let (handler, clock) = handler(Duration::ZERO);
        let queue = RequestQueue::spawn(handler, clock, Duration::from_millis(50));

        let err = queue
            .enqueue("bad", RequestOptions::new(), CacheType::MarketData)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);

        let ok = queue
            .enqueue("good", RequestOptions::new(), CacheType::MarketData)
            .await;
        assert!(ok.is_ok());
    }
}
