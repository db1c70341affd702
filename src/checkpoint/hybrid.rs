//! Hybrid checkpointer: volatile tier always, durable tier best-effort.
//!
//! Every operation lands in the in-memory tier so reads stay fast and the
//! workflow keeps running when the durable backend is down. The latest
//! checkpoint per thread goes through a [`TwoTier`] store so a restarted
//! process can resume threads from the durable tier transparently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::warn;

use super::{
    CheckpointRecord, CheckpointStats, Checkpointer, CheckpointerError, InMemoryCheckpointer,
    TaskWrite,
};
use crate::state::ConversationState;
use crate::store::{Backend, BackendError, FrontTier, MapTier, ReadPreference, TwoTier};

/// Adapter exposing a durable [`Checkpointer`] as a latest-checkpoint
/// key-value backend, keyed by thread id.
pub struct DurableBackend {
    inner: Arc<dyn Checkpointer>,
}

#[async_trait]
impl Backend for DurableBackend {
    type Key = String;
    type Value = CheckpointRecord;

    async fn load(&self, thread_id: &String) -> Result<Option<CheckpointRecord>, BackendError> {
        self.inner
            .get(thread_id, None)
            .await
            .map_err(|e| BackendError::new(e.to_string()))
    }

    async fn store(
        &self,
        _thread_id: &String,
        record: &CheckpointRecord,
    ) -> Result<(), BackendError> {
        // The volatile tier already allocated the id; both tiers must agree
        // on what `(thread_id, checkpoint_id)` names.
        self.inner
            .put_record(record)
            .await
            .map_err(|e| BackendError::new(e.to_string()))
    }

    async fn delete(&self, _thread_id: &String) -> Result<(), BackendError> {
        // Durable rows are only removed by sweep.
        Ok(())
    }
}

/// Volatile-plus-durable checkpointer used by the orchestrator.
pub struct HybridCheckpointer {
    volatile: InMemoryCheckpointer,
    latest: TwoTier<MapTier<String, CheckpointRecord>, DurableBackend>,
    durable: Option<Arc<dyn Checkpointer>>,
    durable_degraded: AtomicBool,
}

impl HybridCheckpointer {
    pub fn new(durable: Option<Arc<dyn Checkpointer>>) -> Self {
        let backend = durable
            .as_ref()
            .map(|inner| Arc::new(DurableBackend { inner: inner.clone() }));
        Self {
            volatile: InMemoryCheckpointer::new(),
            latest: TwoTier::new(MapTier::new(), backend, ReadPreference::FrontFirst),
            durable,
            durable_degraded: AtomicBool::new(false),
        }
    }

    /// Volatile-only variant, equivalent to persistence disabled.
    pub fn volatile_only() -> Self {
        Self::new(None)
    }

    /// True when any durable operation has failed since the last success.
    pub fn is_degraded(&self) -> bool {
        self.latest.is_degraded() || self.durable_degraded.load(Ordering::Relaxed)
    }

    fn note_durable<T>(&self, op: &str, result: Result<T, CheckpointerError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.durable_degraded.store(false, Ordering::Relaxed);
                Some(value)
            }
            Err(err) => {
                if !self.durable_degraded.swap(true, Ordering::Relaxed) {
                    warn!(op, error = %err, "durable checkpointer failed; serving volatile tier");
                }
                None
            }
        }
    }
}

#[async_trait]
impl Checkpointer for HybridCheckpointer {
    async fn put(
        &self,
        thread_id: &str,
        state: &ConversationState,
        metadata: Value,
    ) -> Result<u64, CheckpointerError> {
        // A restarted process has an empty volatile tier, so its counter
        // would restart at 1 while the durable tier continues from its
        // maximum. Seed the counter from the durable latest on first touch.
        if self.volatile.get(thread_id, None).await?.is_none() {
            if let Some(durable) = &self.durable {
                if let Some(latest) = self
                    .note_durable("get", durable.get(thread_id, None).await)
                    .flatten()
                {
                    self.volatile.put_record(&latest).await?;
                }
            }
        }

        let checkpoint_id = self.volatile.put(thread_id, state, metadata.clone()).await?;
        let record = CheckpointRecord {
            thread_id: thread_id.to_string(),
            checkpoint_id,
            state: state.clone(),
            metadata,
            created_at: Utc::now(),
        };
        self.latest.put(thread_id.to_string(), record).await;
        Ok(checkpoint_id)
    }

    async fn put_record(&self, record: &CheckpointRecord) -> Result<(), CheckpointerError> {
        self.volatile.put_record(record).await?;
        self.latest
            .put(record.thread_id.clone(), record.clone())
            .await;
        Ok(())
    }

    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<u64>,
    ) -> Result<Option<CheckpointRecord>, CheckpointerError> {
        match checkpoint_id {
            // Latest goes through the two-tier path so resumed threads are
            // served from the durable tier after a restart.
            None => Ok(self.latest.get(&thread_id.to_string()).await),
            Some(id) => {
                if let Some(record) = self.volatile.get(thread_id, Some(id)).await? {
                    return Ok(Some(record));
                }
                let Some(durable) = &self.durable else {
                    return Ok(None);
                };
                Ok(self
                    .note_durable("get", durable.get(thread_id, Some(id)).await)
                    .flatten())
            }
        }
    }

    async fn list(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, CheckpointerError> {
        let local = self.volatile.list(thread_id, limit).await?;
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(durable) = &self.durable else {
            return Ok(Vec::new());
        };
        Ok(self
            .note_durable("list", durable.list(thread_id, limit).await)
            .unwrap_or_default())
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
        writes: &[TaskWrite],
    ) -> Result<(), CheckpointerError> {
        self.volatile.put_writes(thread_id, checkpoint_id, writes).await?;
        if let Some(durable) = &self.durable {
            self.note_durable(
                "put_writes",
                durable.put_writes(thread_id, checkpoint_id, writes).await,
            );
        }
        Ok(())
    }

    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
    ) -> Result<Vec<TaskWrite>, CheckpointerError> {
        let local = self.volatile.get_writes(thread_id, checkpoint_id).await?;
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(durable) = &self.durable else {
            return Ok(Vec::new());
        };
        Ok(self
            .note_durable("get_writes", durable.get_writes(thread_id, checkpoint_id).await)
            .unwrap_or_default())
    }

    async fn sweep(&self, max_age: Duration) -> Result<u64, CheckpointerError> {
        let threads_before = self.volatile.list_threads().await?;
        let mut removed = self.volatile.sweep(max_age).await?;

        // Drop latest-tier entries for threads the sweep emptied.
        let threads_after = self.volatile.list_threads().await?;
        for thread in &threads_before {
            if !threads_after.contains(thread) {
                self.latest.front().remove(thread);
            }
        }

        if let Some(durable) = &self.durable {
            if let Some(durable_removed) = self.note_durable("sweep", durable.sweep(max_age).await)
            {
                removed = removed.max(durable_removed);
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<CheckpointStats, CheckpointerError> {
        if let Some(durable) = &self.durable {
            if let Some(stats) = self.note_durable("stats", durable.stats().await) {
                return Ok(stats);
            }
        }
        self.volatile.stats().await
    }

    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError> {
        if let Some(durable) = &self.durable {
            if let Some(threads) = self.note_durable("list_threads", durable.list_threads().await) {
                return Ok(threads);
            }
        }
        self.volatile.list_threads().await
    }
}
