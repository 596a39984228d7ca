//! Result cache for encoded query payloads.
//!
//! [`ResultCache`] sits in front of a [`CacheStore`] and never fails: a store error on read is a
//! miss, and on write or invalidation it is logged and dropped. Keys have the shape
//! `namespace:kind:report_id:digest`, so every entry of a report can be removed with the pattern
//! `namespace:*:report_id:*`.
//!
//! Two requests missing on the same key at once both execute and both write; the second write
//! overwrites the first with an identical payload.

pub mod store;

use crate::config::CacheConfig;
use bytes::Bytes;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use store::{CacheError, CacheStore, MokaStore};

/// What a cached payload holds; each kind has its own TTL class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Aggregated pivot output
    Pivot,
    /// Raw base-query output
    Query,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Pivot => "pivot",
            ArtifactKind::Query => "query",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn sha256_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// JSON text with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// 16-hex-digit SHA-256 digest of the canonical JSON form of `fields`.
pub fn config_hash(fields: &Value) -> String {
    let mut hex = sha256_hex(canonical_json(fields).as_bytes());
    hex.truncate(16);
    hex
}

/// Fail-soft facade over a [`CacheStore`].
#[derive(Clone)]
pub struct ResultCache {
    store: Option<Arc<dyn CacheStore>>,
    namespace: String,
    query_ttl: Duration,
    pivot_ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Option<Arc<dyn CacheStore>>, namespace: impl Into<String>, query_ttl: Duration, pivot_ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            query_ttl,
            pivot_ttl,
        }
    }

    /// Build the cache described by configuration: a moka store, or none when disabled.
    pub fn from_config(config: &CacheConfig) -> Self {
        let store: Option<Arc<dyn CacheStore>> = config
            .enabled
            .then(|| Arc::new(MokaStore::new(config.max_capacity_mb)) as Arc<dyn CacheStore>);
        Self::new(store, config.namespace.clone(), config.query_ttl, config.pivot_ttl)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn ttl(&self, kind: ArtifactKind) -> Duration {
        match kind {
            ArtifactKind::Pivot => self.pivot_ttl,
            ArtifactKind::Query => self.query_ttl,
        }
    }

    /// `namespace:kind:report_id:` followed by 12 hex digits of `sha256("report_id:hash")`.
    pub fn make_key(&self, kind: ArtifactKind, report_id: i64, hash: &str) -> String {
        let digest = sha256_hex(format!("{report_id}:{hash}").as_bytes());
        format!("{}:{kind}:{report_id}:{}", self.namespace, &digest[..12])
    }

    pub async fn get(&self, kind: ArtifactKind, report_id: i64, hash: &str) -> Option<Bytes> {
        let store = self.store.as_ref()?;
        let key = self.make_key(kind, report_id, hash);
        match store.get(&key).await {
            Ok(Some(bytes)) => {
                metrics::counter!("infobi_cache_hits_total", "kind" => kind.as_str()).increment(1);
                debug!(%key, "Cache hit");
                Some(bytes)
            }
            Ok(None) => {
                metrics::counter!("infobi_cache_misses_total", "kind" => kind.as_str()).increment(1);
                None
            }
            Err(e) => {
                warn!(%key, error = %e, "Cache read failed, treating as miss");
                metrics::counter!("infobi_cache_misses_total", "kind" => kind.as_str()).increment(1);
                None
            }
        }
    }

    /// Store a payload under the kind's TTL unless `ttl` overrides it.
    pub async fn set(&self, kind: ArtifactKind, report_id: i64, hash: &str, bytes: Bytes, ttl: Option<Duration>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let key = self.make_key(kind, report_id, hash);
        let ttl = ttl.unwrap_or_else(|| self.ttl(kind));
        if let Err(e) = store.set(&key, bytes, ttl).await {
            warn!(%key, error = %e, "Cache write failed");
        }
    }

    /// Drop every cached payload of a report. Returns the number of entries removed.
    pub async fn invalidate_report(&self, report_id: i64) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        let pattern = format!("{}:*:{report_id}:*", self.namespace);
        match store.delete(&pattern).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(%pattern, error = %e, "Cache invalidation failed");
                0
            }
        }
    }

    pub async fn close(&self) {
        if let Some(store) = self.store.as_ref()
            && let Err(e) = store.close().await
        {
            warn!(error = %e, "Failed to close cache store");
        }
    }
}
