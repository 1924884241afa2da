use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::rate_limit::RateLimiter;
use crate::web::metrics::Metrics;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The rate limiter denied the fetch and nothing usable was cached.
    #[error("rate limited and no cached value for {0}")]
    RateLimited(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("cached value could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Fresh iff `now - fetched_at < ttl`. A stale entry is still usable as a
    /// degraded read, not an error state.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.fetched_at).to_std() {
            Ok(age) => age < self.ttl,
            // fetched_at in the future: treat as fresh rather than refetch
            Err(_) => true,
        }
    }
}

/// TTL-keyed store of previously fetched provider data. Implementations hold
/// JSON values so one cache serves every resource family; typed access goes
/// through [`get_or_fetch`].
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn put(&self, key: &str, value: serde_json::Value, ttl: Duration);
    /// Remove every entry whose key starts with one of the given scopes.
    /// Invalidation is targeted; there is deliberately no clear-all.
    fn invalidate(&self, scopes: &[&str]) -> usize;
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                fetched_at: Utc::now(),
                ttl,
            },
        );
    }

    fn invalidate(&self, scopes: &[&str]) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !scopes.iter().any(|scope| key.starts_with(scope)));
        before - entries.len()
    }
}

/// Cache key builders. Invalidation works on the same prefixes, so a scope is
/// just a truncated key.
pub mod keys {
    use crate::provider::BookingWindow;

    pub const ALL_PAYMENT_LISTS: &str = "payments:";

    pub fn booking(booking_id: &str) -> String {
        format!("booking:{booking_id}")
    }

    pub fn bookings_window(window: &BookingWindow) -> String {
        format!(
            "bookings:window:{}:{}",
            window.start.timestamp(),
            window.end.timestamp()
        )
    }

    pub fn payment(payment_id: &str) -> String {
        format!("payment:{payment_id}")
    }

    pub fn payments_for_customer(customer_id: &str) -> String {
        format!("payments:customer:{customer_id}")
    }

    pub fn invoice(invoice_id: &str) -> String {
        format!("invoice:{invoice_id}")
    }
}

/// Read-through access with stale fallback.
///
/// 1. A fresh entry is returned without fetching.
/// 2. If the rate limiter denies the bucket, a stale entry is served as a
///    degraded read; with no entry at all the denial surfaces as
///    [`CacheError::RateLimited`].
/// 3. Otherwise the fetcher runs; its result is stored on success, and a
///    stale entry papers over its failure when one exists.
pub async fn get_or_fetch<T, E, F, Fut>(
    cache: &dyn Cache,
    rate_limiter: &dyn RateLimiter,
    bucket: &str,
    key: &str,
    ttl: Duration,
    fetcher: F,
) -> Result<T, CacheError>
where
    T: Serialize + DeserializeOwned,
    E: std::fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let now = Utc::now();
    if let Some(entry) = cache.get(key) {
        if entry.is_fresh_at(now) {
            Metrics::cache_hit();
            return decode(key, &entry);
        }
    }
    Metrics::cache_miss();

    if !rate_limiter.allow(bucket) {
        if let Some(entry) = cache.get(key) {
            warn!(
                "rate limited on bucket {}, serving stale cache entry for {}",
                bucket, key
            );
            return decode(key, &entry);
        }
        return Err(CacheError::RateLimited(key.to_string()));
    }

    match fetcher().await {
        Ok(value) => {
            match serde_json::to_value(&value) {
                Ok(json) => cache.put(key, json, ttl),
                Err(e) => debug!("value for {} is not cacheable: {}", key, e),
            }
            Ok(value)
        }
        Err(err) => {
            if let Some(entry) = cache.get(key) {
                warn!(
                    "fetch for {} failed ({}), serving stale cache entry",
                    key, err
                );
                return decode(key, &entry);
            }
            Err(CacheError::Fetch(err.to_string()))
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, entry: &CacheEntry) -> Result<T, CacheError> {
    serde_json::from_value(entry.value.clone())
        .map_err(|e| CacheError::Decode(format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct AllowAll;
    impl RateLimiter for AllowAll {
        fn allow(&self, _bucket_key: &str) -> bool {
            true
        }
    }

    struct DenyAll;
    impl RateLimiter for DenyAll {
        fn allow(&self, _bucket_key: &str) -> bool {
            false
        }
    }

    fn stale_entry(value: serde_json::Value) -> CacheEntry {
        CacheEntry {
            value,
            fetched_at: Utc::now() - chrono::Duration::hours(1),
            ttl: Duration::from_secs(60),
        }
    }

    fn seed_stale(cache: &InMemoryCache, key: &str, value: serde_json::Value) {
        cache.entries.lock().insert(key.to_string(), stale_entry(value));
    }

    #[tokio::test]
    async fn fresh_entry_short_circuits_the_fetcher() {
        let cache = InMemoryCache::new();
        cache.put("k", serde_json::json!(41), Duration::from_secs(60));

        let calls = AtomicU32::new(0);
        let value: i64 = get_or_fetch(&cache, &AllowAll, "bucket", "k", Duration::from_secs(60), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(99) }
        })
        .await
        .expect("fresh hit");

        assert_eq!(value, 41);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limit_denial_serves_stale_without_fetching() {
        let cache = InMemoryCache::new();
        seed_stale(&cache, "k", serde_json::json!(7));

        let calls = AtomicU32::new(0);
        let value: i64 = get_or_fetch(&cache, &DenyAll, "bucket", "k", Duration::from_secs(60), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(99) }
        })
        .await
        .expect("stale fallback");

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limit_denial_without_cache_is_an_error() {
        let cache = InMemoryCache::new();
        let result: Result<i64, _> =
            get_or_fetch(&cache, &DenyAll, "bucket", "k", Duration::from_secs(60), || async {
                Ok::<_, String>(99)
            })
            .await;
        assert!(matches!(result, Err(CacheError::RateLimited(_))));
    }

    #[tokio::test]
    async fn successful_fetch_is_stored_for_later_reads() {
        let cache = InMemoryCache::new();
        let value: i64 = get_or_fetch(&cache, &AllowAll, "bucket", "k", Duration::from_secs(60), || async {
            Ok::<_, String>(5)
        })
        .await
        .expect("fetch");
        assert_eq!(value, 5);

        let entry = cache.get("k").expect("entry stored");
        assert!(entry.is_fresh_at(Utc::now()));
        assert_eq!(entry.value, serde_json::json!(5));
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_stale_entry() {
        let cache = InMemoryCache::new();
        seed_stale(&cache, "k", serde_json::json!(12));

        let value: i64 = get_or_fetch(&cache, &AllowAll, "bucket", "k", Duration::from_secs(60), || async {
            Err::<i64, _>("provider down".to_string())
        })
        .await
        .expect("stale fallback on error");
        assert_eq!(value, 12);
    }

    #[tokio::test]
    async fn fetch_failure_without_cache_propagates() {
        let cache = InMemoryCache::new();
        let result: Result<i64, _> =
            get_or_fetch(&cache, &AllowAll, "bucket", "k", Duration::from_secs(60), || async {
                Err::<i64, _>("provider down".to_string())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Fetch(_))));
    }

    #[test]
    fn invalidate_clears_matching_scopes_only() {
        let cache = InMemoryCache::new();
        cache.put(&keys::payment("p1"), serde_json::json!(1), Duration::from_secs(60));
        cache.put(
            &keys::payments_for_customer("c1"),
            serde_json::json!(2),
            Duration::from_secs(60),
        );
        cache.put(&keys::booking("b1"), serde_json::json!(3), Duration::from_secs(60));

        let payment_scope = keys::payment("p1");
        let removed = cache.invalidate(&[keys::ALL_PAYMENT_LISTS, payment_scope.as_str()]);
        assert_eq!(removed, 2);
        assert!(cache.get(&keys::payment("p1")).is_none());
        assert!(cache.get(&keys::payments_for_customer("c1")).is_none());
        assert!(cache.get(&keys::booking("b1")).is_some());
    }

    #[test]
    fn entry_freshness_follows_ttl() {
        let now = Utc::now();
        let entry = CacheEntry {
            value: serde_json::json!(null),
            fetched_at: now - chrono::Duration::seconds(30),
            ttl: Duration::from_secs(60),
        };
        assert!(entry.is_fresh_at(now));
        assert!(!entry.is_fresh_at(now + chrono::Duration::seconds(31)));
    }
}
