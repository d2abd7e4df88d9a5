//! Debug command registry
//!
//! Maps command names to async handlers operating on a [`MarketDataClient`].
//! Intended for a debug console or admin endpoint, not as a wire protocol.
//!
//! ```no_run
//! use market_fetch_sdk::{CommandRegistry, MarketDataClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MarketDataClient::global().await;
//! let commands = CommandRegistry::with_defaults();
//! commands.execute(&client, "set-ttl", &["market-data", "30"]).await?;
//! let status = commands.execute(&client, "status", &[]).await?;
//! println!("{}", status);
//! # Ok(())
//! # }
//! ```

use crate::{
    client::MarketDataClient,
    error::FetchError,
    rate_limiter::RateLimitConfig,
    types::{CacheType, RequestOptions},
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by a command handler
pub type CommandFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// A registered command
pub type CommandHandler = Arc<dyn Fn(MarketDataClient, Vec<String>) -> CommandFuture + Send + Sync>;

/// String-keyed registry of debug commands
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in commands
    ///
    /// | Command | Arguments |
    /// |---|---|
    /// | `clear-cache` | |
    /// | `force-refresh` | `<url> [cache-type]` |
    /// | `toggle-background-refresh` | |
    /// | `set-ttl` | `<cache-type> <seconds>` |
    /// | `set-rate-limit` | `<max-requests> <window-seconds>` |
    /// | `reset-rate-limiter` | |
    /// | `status` | |
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("clear-cache", |client, _args| async move {
            client.clear_cache().await;
            Ok(json!({ "cleared": true }))
        });

        registry.register("force-refresh", |client, args| async move {
            let url = required(&args, 0, "url")?;
            let cache_type = match args.get(1) {
                Some(raw) => raw.parse::<CacheType>()?,
                None => CacheType::MarketData,
            };
            client
                .force_refresh(url, &RequestOptions::new(), cache_type)
                .await
        });

        registry.register("toggle-background-refresh", |client, _args| async move {
            let enabled = client.toggle_background_refresh();
            Ok(json!({ "background_refresh": enabled }))
        });

        registry.register("set-ttl", |client, args| async move {
            let cache_type: CacheType = parse(&args, 0, "cache type")?;
            let secs: u64 = parse(&args, 1, "seconds")?;
            client.set_ttl(cache_type, Duration::from_secs(secs)).await;
            Ok(json!({ "cache_type": cache_type, "ttl_secs": secs }))
        });

        registry.register("set-rate-limit", |client, args| async move {
            let max_requests: usize = parse(&args, 0, "max requests")?;
            let window_secs: u64 = parse(&args, 1, "window seconds")?;
            client
                .set_rate_limit(RateLimitConfig {
                    max_requests,
                    window: Duration::from_secs(window_secs),
                })
                .await?;
            Ok(json!({ "max_requests": max_requests, "window_secs": window_secs }))
        });

        registry.register("reset-rate-limiter", |client, _args| async move {
            client.reset_rate_limiter().await;
            Ok(json!({ "reset": true }))
        });

        registry.register("status", |client, _args| async move {
            Ok(serde_json::to_value(client.status().await)?)
        });

        registry
    }

    /// Registers a command, replacing any command with the same name
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(MarketDataClient, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let wrapped: CommandHandler =
            Arc::new(move |client: MarketDataClient, args: Vec<String>| -> CommandFuture {
                handler(client, args).boxed()
            });
        self.commands.insert(name.to_string(), wrapped);
    }

    /// Looks up and runs a command
    ///
    /// # Returns
    /// The handler's JSON result, `FetchError::UnknownCommand` if no command
    /// has that name, or `FetchError::InvalidArgument` for malformed arguments.
    pub async fn execute(
        &self,
        client: &MarketDataClient,
        name: &str,
        args: &[&str],
    ) -> Result<Value, FetchError> {
        let handler = self
            .commands
            .get(name)
            .ok_or_else(|| FetchError::UnknownCommand(name.to_string()))?;

        tracing::info!(command = name, args = ?args, "Executing command");
        let args = args.iter().map(|a| a.to_string()).collect();
        handler(client.clone(), args).await
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }
}

fn required<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a str, FetchError> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| FetchError::invalid_argument(format!("missing {}", what)))
}

fn parse<T: FromStr>(args: &[String], idx: usize, what: &str) -> Result<T, FetchError> {
    let raw = required(args, idx, what)?;
    raw.parse::<T>()
        .map_err(|_| FetchError::invalid_argument(format!("invalid {} '{}'", what, raw)))
}
