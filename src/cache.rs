//! In-memory response cache with a fallback store for expired values

use crate::{
    clock::Clock,
    constants::FALLBACK_TTL_SECS,
    types::{CacheEntry, CacheStats, CacheType},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Type alias for the entry map (cache key -> entry)
type EntryMap = HashMap<String, CacheEntry>;

/// In-memory cache for response bodies
///
/// Values live in the live map until their TTL elapses. The first read after
/// that moves them into the fallback map, where they stay readable through
/// [`ResponseCache::get_fallback`] until two hours past their original fetch
/// time. Nothing is purged proactively.
pub struct ResponseCache {
    /// Fresh (or not yet evicted) entries
    entries: RwLock<EntryMap>,
    /// Expired entries kept for failure fallback
    fallback: RwLock<EntryMap>,
    /// TTL per cache type
    ttls: RwLock<HashMap<CacheType, Duration>>,
    /// Maximum age of a fallback value
    fallback_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    /// Creates an empty cache with the default TTLs
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let ttls = CacheType::all()
            .iter()
            .map(|t| (*t, t.default_ttl()))
            .collect();

        Self {
            entries: RwLock::new(HashMap::new()),
            fallback: RwLock::new(HashMap::new()),
            ttls: RwLock::new(ttls),
            fallback_ttl: Duration::from_secs(FALLBACK_TTL_SECS),
            clock,
        }
    }

    /// Current TTL for a cache type
    pub async fn ttl(&self, cache_type: CacheType) -> Duration {
        self.ttls
            .read()
            .await
            .get(&cache_type)
            .copied()
            .unwrap_or_else(|| cache_type.default_ttl())
    }

    /// Changes the TTL for a cache type
    ///
    /// Applies to existing entries as well, since freshness is checked on read.
    pub async fn set_ttl(&self, cache_type: CacheType, ttl: Duration) {
        self.ttls.write().await.insert(cache_type, ttl);
        tracing::info!(cache_type = %cache_type, ttl_secs = ttl.as_secs(), "Cache TTL changed");
    }

    /// Current TTL for every cache type
    pub async fn ttls(&self) -> HashMap<CacheType, Duration> {
        self.ttls.read().await.clone()
    }

    /// Gets a fresh value
    ///
    /// # Returns
    /// The stored value if its age does not exceed the TTL of `cache_type`.
    /// An expired entry is moved into the fallback store and `None` is returned.
    pub async fn get(&self, key: &str, cache_type: CacheType) -> Option<Value> {
        self.get_entry(key, cache_type).await.map(|e| e.data)
    }

    /// Like [`ResponseCache::get`] but returns the whole entry
    pub async fn get_entry(&self, key: &str, cache_type: CacheType) -> Option<CacheEntry> {
        let ttl = self.ttl(cache_type).await;
        let now = self.clock.now();

        {
            let entries = self.entries.read().await;
            let entry = entries.get(key)?;
            if entry.age(now) <= ttl {
                return Some(entry.clone());
            }
        }

        // Expired: re-check under the write lock, a concurrent set may have refreshed it
        let mut entries = self.entries.write().await;
        match entries.get(key).map(|e| e.age(now) <= ttl) {
            Some(true) => entries.get(key).cloned(),
            Some(false) => {
                if let Some(expired) = entries.remove(key) {
                    tracing::debug!(key, cache_type = %cache_type, "Cache entry expired, moved to fallback");
                    self.fallback.write().await.insert(key.to_string(), expired);
                }
                None
            }
            None => None,
        }
    }

    /// Stores a value with a fresh timestamp, replacing any previous one
    pub async fn set(&self, key: &str, data: Value, cache_type: CacheType) {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now(),
            cache_type,
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    /// Gets a stale value for failure fallback
    ///
    /// Looks at the fallback store first, then at a live entry that has not
    /// been evicted yet. Values older than the fallback window are removed.
    pub async fn get_fallback(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();

        {
            let mut fallback = self.fallback.write().await;
            match fallback.get(key).map(|e| e.age(now) <= self.fallback_ttl) {
                Some(true) => return fallback.get(key).map(|e| e.data.clone()),
                Some(false) => {
                    fallback.remove(key);
                    tracing::debug!(key, "Fallback entry expired and removed");
                    return None;
                }
                None => {}
            }
        }

        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.age(now) <= self.fallback_ttl)
            .map(|e| e.data.clone())
    }

    /// Removes a key from both the live cache and the fallback store
    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
        self.fallback.write().await.remove(key);
    }

    /// Empties both the live cache and the fallback store
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.fallback.write().await.clear();
    }

    /// Entry counts
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            live_entries: self.entries.read().await.len(),
            fallback_entries: self.fallback.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn cache() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (ResponseCache::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_fresh_value_is_returned_until_ttl() {
        for cache_type in CacheType::all() {
            let (cache, clock) = cache();
            let value = json!({"price": "42.0"});
            cache.set("k", value.clone(), *cache_type).await;

            clock.advance(cache_type.default_ttl());
            assert_eq!(cache.get("k", *cache_type).await, Some(value.clone()));

            clock.advance(Duration::from_millis(1));
            assert_eq!(cache.get("k", *cache_type).await, None);
            assert_eq!(cache.get_fallback("k").await, Some(value));

            let stats = cache.stats().await;
            assert_eq!(stats.live_entries, 0);
            assert_eq!(stats.fallback_entries, 1);
        }
    }

    #[tokio::test]
    async fn test_fallback_expires_two_hours_after_fetch() {
        let (cache, clock) = cache();
        cache.set("k", json!(1), CacheType::MarketData).await;

        clock.advance(Duration::from_secs(90 * 60));
        assert_eq!(cache.get("k", CacheType::MarketData).await, None);
        assert_eq!(cache.get_fallback("k").await, Some(json!(1)));

        // Window counts from the original timestamp, not from eviction
        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(cache.get_fallback("k").await, None);
        assert_eq!(cache.stats().await.fallback_entries, 0);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_refreshes_timestamp() {
        let (cache, clock) = cache();
        cache.set("k", json!("old"), CacheType::MarketData).await;
        clock.advance(Duration::from_secs(50));
        cache.set("k", json!("new"), CacheType::MarketData).await;
        clock.advance(Duration::from_secs(50));

        assert_eq!(cache.get("k", CacheType::MarketData).await, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_set_ttl_applies_to_existing_entries() {
        let (cache, clock) = cache();
        cache.set("k", json!(1), CacheType::CoinDetails).await;
        clock.advance(Duration::from_secs(20));

        cache.set_ttl(CacheType::CoinDetails, Duration::from_secs(10)).await;
        assert_eq!(cache.ttl(CacheType::CoinDetails).await, Duration::from_secs(10));
        assert_eq!(cache.get("k", CacheType::CoinDetails).await, None);
    }

    #[tokio::test]
    async fn test_clear_empties_both_maps() {
        let (cache, clock) = cache();
        cache.set("a", json!(1), CacheType::MarketData).await;
        cache.set("b", json!(2), CacheType::HistoricalData).await;
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get("a", CacheType::MarketData).await, None);

        cache.clear().await;
        assert_eq!(cache.stats().await, CacheStats::default());
        assert_eq!(cache.get_fallback("a").await, None);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (cache, _) = cache();
        assert_eq!(cache.get("nope", CacheType::MarketData).await, None);
        assert_eq!(cache.get_fallback("nope").await, None);
    }
}
