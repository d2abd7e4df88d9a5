//! Error types for the market data client

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the cache, queue, rate limiter and transport
///
/// Every variant maps onto an HTTP-like status through [`FetchError::status`],
/// so callers can branch on `429` / `401` / `5xx` the same way regardless of
/// whether the failure came from the remote API or from the local limiter.
///
/// The type is `Clone` because a single in-flight request may be shared by
/// several waiters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// Local or remote rate limit hit; retry after the given wait
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Remote API rejected the credentials
    #[error("Unauthorized")]
    Unauthorized,

    /// Remote API returned a non-success status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network request failed
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Command name is not registered
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Command or configuration argument is malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Request was cancelled before it completed
    #[error("Request cancelled")]
    Cancelled,

    /// Request queue worker is gone
    #[error("Request queue closed")]
    QueueClosed,
}

impl FetchError {
    /// Creates a RateLimited error
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates an Http error
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    /// Creates an InvalidResponse error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Creates an InvalidArgument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// HTTP-like status code for this error
    pub fn status(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::Unauthorized => 401,
            Self::Http { status, .. } => *status,
            _ => 500,
        }
    }

    /// Returns the wait before a retry makes sense, for rate-limit errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// True if this error came from a rate limit
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}
