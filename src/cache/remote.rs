//! Shared cache tier contract.
//!
//! The process ships without a remote implementation; deployments plug one
//! in (typically Redis-shaped) through [`RemoteCache`]. The adapter wires it
//! into the generic two-tier store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::CacheEntry;
use crate::store::{Backend, BackendError};

/// Shared cache shared by all workers. Key pattern operations use a plain
/// prefix, not glob syntax.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError>;
    async fn set(&self, entry: &CacheEntry) -> Result<(), BackendError>;
    async fn delete(&self, key: &str) -> Result<(), BackendError>;
    /// Delete all keys with the given prefix; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, BackendError>;
    /// Add a key to a tag set. The tag set must survive at least `ttl` past
    /// this call, so membership outlives every entry it references.
    async fn tag_add(&self, tag: &str, key: &str, ttl: Duration) -> Result<(), BackendError>;
    /// All keys currently in a tag set.
    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, BackendError>;
    /// Drop a tag set (not the entries it referenced).
    async fn tag_clear(&self, tag: &str) -> Result<(), BackendError>;
}

/// [`Backend`] adapter over a remote cache.
pub struct RemoteBackend {
    pub(super) inner: Arc<dyn RemoteCache>,
}

impl RemoteBackend {
    pub fn new(inner: Arc<dyn RemoteCache>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    type Key = String;
    type Value = CacheEntry;

    async fn load(&self, key: &String) -> Result<Option<CacheEntry>, BackendError> {
        match self.inner.get(key).await? {
            Some(entry) if entry.is_expired() => {
                // Expired remotely held entries are deleted on read.
                self.inner.delete(key).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn store(&self, _key: &String, entry: &CacheEntry) -> Result<(), BackendError> {
        self.inner.set(entry).await
    }

    async fn delete(&self, key: &String) -> Result<(), BackendError> {
        self.inner.delete(key).await
    }
}
