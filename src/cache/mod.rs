//! Two-tier response cache.
//!
//! Generated responses are cached under a deterministic key derived from the
//! normalized message, the extracted entities, the decided tools, and a
//! phase label. The in-process tier always runs; a shared [`RemoteCache`]
//! is optional and consulted first when present, so all workers see the same
//! entries. Remote failures degrade to local-only without surfacing errors.

pub mod local;
pub mod remote;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

pub use local::LocalCache;
pub use remote::{RemoteBackend, RemoteCache};

use crate::store::{FrontTier, ReadPreference, TwoTier};

/// Default entry lifetime.
pub const RESPONSE_TTL: StdDuration = StdDuration::from_secs(1800);
/// Background sweep period.
pub const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(300);
/// Default local-tier capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

const KEY_PREFIX: &str = "shopgraph";

/// One cached response with its expiry and tag metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    #[serde(default)]
    pub hit_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: Value, ttl_ms: u64, tags: Vec<String>) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: Utc::now(),
            ttl_ms,
            hit_count: 0,
            tags,
        }
    }

    pub fn is_expired(&self) -> bool {
        let age = Utc::now() - self.created_at;
        age.num_milliseconds() >= self.ttl_ms as i64
    }
}

/// Build the deterministic cache key for a response.
///
/// The message is lowercased with whitespace collapsed; entity texts and
/// tool names are sorted so ordering differences do not split entries. The
/// key is `shopgraph:{phase}:{hex}` with the first 16 hex characters of a
/// SHA-256 over the joined parts.
pub fn response_key(phase: &str, message: &str, entities: &[String], tools: &[String]) -> String {
    let normalized = message
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut entities: Vec<&str> = entities.iter().map(String::as_str).collect();
    entities.sort_unstable();
    let mut tools: Vec<&str> = tools.iter().map(String::as_str).collect();
    tools.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(entities.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(tools.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(phase.as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{KEY_PREFIX}:{phase}:{hex}")
}

/// Counters reported by [`ResponseCache::stats`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub degraded: bool,
}

/// The cache used by the orchestrator for generated responses.
pub struct ResponseCache {
    store: TwoTier<LocalCache, RemoteBackend>,
    remote: Option<Arc<dyn RemoteCache>>,
    // tag -> keys, maintained locally even when a remote tier exists
    tag_index: Mutex<FxHashMap<String, FxHashSet<String>>>,
    ttl: StdDuration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: StdDuration, remote: Option<Arc<dyn RemoteCache>>) -> Self {
        let backend = remote.as_ref().map(|r| Arc::new(RemoteBackend::new(r.clone())));
        Self {
            store: TwoTier::new(LocalCache::new(capacity), backend, ReadPreference::BackFirst),
            remote,
            tag_index: Mutex::new(FxHashMap::default()),
            ttl,
        }
    }

    /// Local-only cache with default sizing.
    pub fn in_process() -> Self {
        Self::new(DEFAULT_CAPACITY, RESPONSE_TTL, None)
    }

    /// Look up a cached payload. Expired entries are treated as misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let entry = self.store.get(&key.to_string()).await?;
        if entry.is_expired() {
            self.store.remove(&key.to_string()).await;
            return None;
        }
        Some(entry.payload)
    }

    /// Store a payload under the given key and tags.
    pub async fn set(&self, key: &str, payload: Value, tags: Vec<String>) {
        let entry = CacheEntry::new(key, payload, self.ttl.as_millis() as u64, tags.clone());

        {
            let mut index = self.tag_index.lock();
            for tag in &tags {
                index.entry(tag.clone()).or_default().insert(key.to_string());
            }
        }
        if let Some(remote) = &self.remote {
            for tag in &tags {
                // Tag bookkeeping is best-effort; entry writes handle degrade.
                let _ = remote.tag_add(tag, key, self.ttl).await;
            }
        }

        self.store.put(key.to_string(), entry).await;
    }

    /// Remove one entry from both tiers.
    pub async fn delete(&self, key: &str) -> bool {
        self.store.remove(&key.to_string()).await.is_some()
    }

    /// Remove every entry carrying the tag; returns how many were removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let mut keys: FxHashSet<String> = self
            .tag_index
            .lock()
            .remove(tag)
            .unwrap_or_default();
        if let Some(remote) = &self.remote {
            if let Ok(members) = remote.tag_members(tag).await {
                keys.extend(members);
            }
            let _ = remote.tag_clear(tag).await;
        }

        let mut removed = 0u64;
        for key in keys {
            if self.store.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        debug!(tag, removed, "cache tag invalidation");
        removed
    }

    /// Remove every entry whose key starts with the prefix.
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0u64;
        for key in self.store.front().keys_with_prefix(prefix) {
            if self.store.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        if let Some(remote) = &self.remote {
            if let Ok(n) = remote.delete_prefix(prefix).await {
                removed = removed.max(n);
            }
        }
        removed
    }

    /// Drop expired local entries; returns how many were removed. Tag
    /// bookkeeping follows the local tier: members whose entries expired or
    /// were evicted are pruned from the index.
    pub fn sweep_expired(&self) -> u64 {
        let swept = self.store.front().sweep_expired();
        let live: FxHashSet<String> = self
            .store
            .front()
            .keys_with_prefix("")
            .into_iter()
            .collect();
        let mut index = self.tag_index.lock();
        for keys in index.values_mut() {
            keys.retain(|k| live.contains(k));
        }
        index.retain(|_, keys| !keys.is_empty());
        swept
    }

    /// True once the remote tier has failed and not yet recovered.
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    pub fn stats(&self) -> CacheStats {
        let local = self.store.front();
        CacheStats {
            entries: local.len(),
            hits: local.hits(),
            misses: local.misses(),
            hit_rate: local.hit_rate(),
            evictions: local.evictions(),
            degraded: self.is_degraded(),
        }
    }

    /// Spawn the periodic expiry sweeper. The task ends when the cache is
    /// dropped by all other holders.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let swept = cache.sweep_expired();
                if swept > 0 {
                    debug!(swept, "cache sweep removed expired entries");
                }
            }
        })
    }
}
