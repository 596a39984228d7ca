//! Cache backends.

use async_trait::async_trait;
use bytes::Bytes;
use moka::Expiry;
use moka::future::Cache;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tracing::debug;

#[derive(ThisError, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache is closed")]
    Closed,
}

/// Byte store keyed by string with per-entry TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Remove every key matching `pattern` and return how many were removed.
    ///
    /// Patterns are `:`-separated segments where `*` matches exactly one whole segment.
    async fn delete(&self, pattern: &str) -> Result<usize, CacheError>;

    async fn close(&self) -> Result<(), CacheError>;
}

/// Segment-wise glob match: `ns:*:1:*` matches `ns:pivot:1:abc` but not `ns:pivot:12:abc`.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let mut pattern_segments = pattern.split(':');
    let mut key_segments = key.split(':');
    loop {
        match (pattern_segments.next(), key_segments.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(k)) if p == k => continue,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedValue {
    bytes: Bytes,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &CachedValue, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store backed by moka, bounded by payload size.
pub struct MokaStore {
    cache: Cache<String, CachedValue>,
}

impl MokaStore {
    pub fn new(max_capacity_mb: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity_mb.saturating_mul(1024 * 1024))
            .weigher(|key: &String, value: &CachedValue| -> u32 {
                (key.len() + value.bytes.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    #[cfg(test)]
    pub(crate) async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheStore for MokaStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.cache.get(key).await.map(|value| value.bytes))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.cache
            .insert(key.to_string(), CachedValue { bytes: value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, pattern: &str) -> Result<usize, CacheError> {
        let matching: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| pattern_matches(pattern, key))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in &matching {
            self.cache.invalidate(key).await;
        }
        debug!(pattern, removed = matching.len(), "Invalidated cache entries");
        Ok(matching.len())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}
