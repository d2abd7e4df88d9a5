//! Transport abstraction for issuing the actual network requests

use crate::{
    constants::{REQUEST_TIMEOUT_SECS, USER_AGENT},
    error::FetchError,
    types::RequestOptions,
};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Wait assumed when a 429 response carries no usable Retry-After header
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Trait for the layer that talks to the network
///
/// The client decorates whatever implements this with caching, queuing and
/// rate limiting. Implementations should map HTTP 429 to
/// `FetchError::RateLimited` and 401 to `FetchError::Unauthorized`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a GET and returns the JSON body
    ///
    /// # Arguments
    /// * `url` - Absolute URL
    /// * `options` - Query parameters and headers
    async fn get_json(&self, url: &str, options: &RequestOptions) -> Result<Value, FetchError>;

    /// Returns the name of this transport
    fn transport_name(&self) -> &'static str;
}

/// HTTP transport backed by `reqwest`
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a new HTTP transport
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }

    /// Creates a transport around an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .unwrap_or_else(|_| Self::with_client(Client::new()))
    }
}

/// Parses a Retry-After header given in seconds
fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_RETRY_AFTER_SECS))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, url: &str, options: &RequestOptions) -> Result<Value, FetchError> {
        tracing::debug!(url, "Sending request");

        let mut request = self.client.get(url).query(&options.query);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(FetchError::rate_limited(retry_after));
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized);
        }

        if !status.is_success() {
            return Err(FetchError::http(
                status.as_u16(),
                response.text().await.unwrap_or_default(),
            ));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            FetchError::invalid_response(format!("Failed to parse response from {}: {}", url, e))
        })
    }

    fn transport_name(&self) -> &'static str {
        "http"
    }
}
