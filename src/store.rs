//! Two-tier storage: a fast in-process front tier paired with an optional
//! shared async backend.
//!
//! Both the checkpoint layer and the response cache are instances of the same
//! shape and differ only in read preference: checkpoints serve the volatile
//! tier first, the cache consults the shared tier first. Writes always go to
//! both tiers; when the backend fails, the write degrades to front-tier-only,
//! the failure is logged once per transition, and the caller's operation
//! still succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::warn;

/// Failure inside a shared backend tier.
#[derive(Debug, Error, Diagnostic)]
#[error("store backend error: {message}")]
#[diagnostic(code(shopgraph::store::backend))]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Synchronous in-process tier. Implementations are internally locked and
/// cheap to hit on every request.
pub trait FrontTier<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn put(&self, key: K, value: V);
    fn remove(&self, key: &K) -> Option<V>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared asynchronous tier (database, remote cache).
#[async_trait]
pub trait Backend: Send + Sync {
    type Key: Send + Sync;
    type Value: Send + Sync;

    async fn load(&self, key: &Self::Key) -> Result<Option<Self::Value>, BackendError>;
    async fn store(&self, key: &Self::Key, value: &Self::Value) -> Result<(), BackendError>;
    async fn delete(&self, key: &Self::Key) -> Result<(), BackendError>;
}

/// Simple hash-map front tier.
pub struct MapTier<K, V> {
    entries: RwLock<FxHashMap<K, V>>,
}

impl<K, V> Default for MapTier<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<K, V> MapTier<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V> FrontTier<K, V> for MapTier<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        self.entries.write().insert(key, value);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Which tier answers a read first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadPreference {
    /// Front tier first, backend as fallback (checkpoints).
    FrontFirst,
    /// Backend first, front tier as fallback (shared cache).
    BackFirst,
}

/// A front tier paired with an optional backend.
pub struct TwoTier<F, B>
where
    B: Backend,
{
    front: F,
    backend: Option<Arc<B>>,
    preference: ReadPreference,
    degraded: AtomicBool,
}

impl<F, B> TwoTier<F, B>
where
    B: Backend,
    B::Key: Clone + std::hash::Hash + Eq,
    B::Value: Clone,
    F: FrontTier<B::Key, B::Value>,
{
    pub fn new(front: F, backend: Option<Arc<B>>, preference: ReadPreference) -> Self {
        Self {
            front,
            backend,
            preference,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn front(&self) -> &F {
        &self.front
    }

    /// True once a backend write or read has failed. Cleared when the
    /// backend answers again.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn note_backend_failure(&self, op: &str, err: &BackendError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(op, error = %err, "store backend failed; continuing on front tier only");
        }
    }

    fn note_backend_success(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    /// Read honoring the configured preference, repopulating the front tier
    /// on a backend hit.
    pub async fn get(&self, key: &B::Key) -> Option<B::Value> {
        match self.preference {
            ReadPreference::FrontFirst => {
                if let Some(value) = self.front.get(key) {
                    return Some(value);
                }
                self.get_backend(key).await
            }
            ReadPreference::BackFirst => match self.get_backend(key).await {
                Some(value) => Some(value),
                None => self.front.get(key),
            },
        }
    }

    async fn get_backend(&self, key: &B::Key) -> Option<B::Value> {
        let backend = self.backend.as_ref()?;
        match backend.load(key).await {
            Ok(Some(value)) => {
                self.note_backend_success();
                self.front.put(key.clone(), value.clone());
                Some(value)
            }
            Ok(None) => {
                self.note_backend_success();
                None
            }
            Err(err) => {
                self.note_backend_failure("load", &err);
                None
            }
        }
    }

    /// Write to both tiers. Backend failure degrades instead of erroring.
    pub async fn put(&self, key: B::Key, value: B::Value) {
        if let Some(backend) = &self.backend {
            match backend.store(&key, &value).await {
                Ok(()) => self.note_backend_success(),
                Err(err) => self.note_backend_failure("store", &err),
            }
        }
        self.front.put(key, value);
    }

    /// Remove from both tiers.
    pub async fn remove(&self, key: &B::Key) -> Option<B::Value> {
        if let Some(backend) = &self.backend {
            match backend.delete(key).await {
                Ok(()) => self.note_backend_success(),
                Err(err) => self.note_backend_failure("delete", &err),
            }
        }
        self.front.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyBackend {
        entries: RwLock<FxHashMap<String, String>>,
        fail: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                entries: RwLock::new(FxHashMap::default()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        type Key = String;
        type Value = String;

        async fn load(&self, key: &String) -> Result<Option<String>, BackendError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BackendError::new("down"));
            }
            Ok(self.entries.read().get(key).cloned())
        }

        async fn store(&self, key: &String, value: &String) -> Result<(), BackendError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BackendError::new("down"));
            }
            self.entries.write().insert(key.clone(), value.clone());
            Ok(())
        }

        async fn delete(&self, key: &String) -> Result<(), BackendError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BackendError::new("down"));
            }
            self.entries.write().remove(key);
            Ok(())
        }
    }

    fn two_tier(
        backend: Arc<FlakyBackend>,
        preference: ReadPreference,
    ) -> TwoTier<MapTier<String, String>, FlakyBackend> {
        TwoTier::new(MapTier::new(), Some(backend), preference)
    }

    #[tokio::test]
    async fn put_writes_both_tiers() {
        let backend = Arc::new(FlakyBackend::new());
        let store = two_tier(backend.clone(), ReadPreference::FrontFirst);
        store.put("k".to_string(), "v".to_string()).await;
        assert_eq!(store.front().len(), 1);
        assert_eq!(backend.entries.read().get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn backend_failure_degrades_but_write_survives() {
        let backend = Arc::new(FlakyBackend::new());
        backend.fail.store(true, Ordering::Relaxed);
        let store = two_tier(backend.clone(), ReadPreference::FrontFirst);

        store.put("k".to_string(), "v".to_string()).await;
        assert!(store.is_degraded());
        assert_eq!(store.get(&"k".to_string()).await.as_deref(), Some("v"));

        // Backend recovery clears the degraded flag on the next write.
        backend.fail.store(false, Ordering::Relaxed);
        store.put("k2".to_string(), "v2".to_string()).await;
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn back_first_read_repopulates_front() {
        let backend = Arc::new(FlakyBackend::new());
        backend
            .entries
            .write()
            .insert("shared".to_string(), "value".to_string());
        let store = two_tier(backend, ReadPreference::BackFirst);

        assert_eq!(store.front().len(), 0);
        assert_eq!(store.get(&"shared".to_string()).await.as_deref(), Some("value"));
        assert_eq!(store.front().len(), 1);
    }

    #[tokio::test]
    async fn front_first_read_skips_backend_on_hit() {
        let backend = Arc::new(FlakyBackend::new());
        let store = two_tier(backend.clone(), ReadPreference::FrontFirst);
        store.front().put("k".to_string(), "front".to_string());
        backend.fail.store(true, Ordering::Relaxed);
        // The front hit means the failing backend is never consulted.
        assert_eq!(store.get(&"k".to_string()).await.as_deref(), Some("front"));
        assert!(!store.is_degraded());
    }
}
