//! Checkpoint persistence for conversation threads.
//!
//! A [`Checkpointer`] stores full [`ConversationState`] snapshots keyed by
//! `(thread_id, checkpoint_id)`, where `checkpoint_id` increments per thread,
//! plus out-of-band task writes keyed by `(thread_id, checkpoint_id,
//! task_id)`. Backends: [`InMemoryCheckpointer`] for tests and ephemeral use,
//! [`sqlite::SqliteCheckpointer`] for durability, and [`hybrid`] for the
//! volatile-plus-durable pairing the orchestrator uses.

pub mod hybrid;
pub mod persistence;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::state::ConversationState;

/// One persisted snapshot of a thread.
#[derive(Clone, Debug)]
pub struct CheckpointRecord {
    pub thread_id: String,
    /// Per-thread sequence number, starting at 1.
    pub checkpoint_id: u64,
    pub state: ConversationState,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Out-of-band write attached to a checkpoint.
#[derive(Clone, Debug)]
pub struct TaskWrite {
    pub task_id: String,
    pub data: Value,
}

/// Aggregate counts reported by [`Checkpointer::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub threads: u64,
    pub checkpoints: u64,
    pub writes: u64,
}

/// Errors from checkpoint operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(shopgraph::checkpoint::backend))]
    Backend { message: String },

    #[error("serialization error during checkpointing")]
    #[diagnostic(code(shopgraph::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

/// Abstract checkpoint store.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a new checkpoint for the thread and return its id.
    async fn put(
        &self,
        thread_id: &str,
        state: &ConversationState,
        metadata: Value,
    ) -> Result<u64, CheckpointerError>;

    /// Store a record under its already-allocated id, replacing any existing
    /// row with the same `(thread_id, checkpoint_id)`. Later `put` calls for
    /// the thread allocate ids past the stored one.
    async fn put_record(&self, record: &CheckpointRecord) -> Result<(), CheckpointerError>;

    /// Fetch a checkpoint; `None` id means the latest for the thread.
    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<u64>,
    ) -> Result<Option<CheckpointRecord>, CheckpointerError>;

    /// List checkpoints for a thread, newest first, up to `limit`.
    async fn list(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, CheckpointerError>;

    /// Attach task writes to an existing checkpoint.
    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
        writes: &[TaskWrite],
    ) -> Result<(), CheckpointerError>;

    /// Fetch task writes for a checkpoint.
    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
    ) -> Result<Vec<TaskWrite>, CheckpointerError>;

    /// Delete checkpoints older than `max_age`; returns how many were removed.
    async fn sweep(&self, max_age: Duration) -> Result<u64, CheckpointerError>;

    /// Aggregate counts across all threads.
    async fn stats(&self) -> Result<CheckpointStats, CheckpointerError>;

    /// All known thread ids.
    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError>;
}

#[derive(Default)]
struct MemoryInner {
    // thread_id -> ordered checkpoints
    checkpoints: FxHashMap<String, Vec<CheckpointRecord>>,
    // (thread_id, checkpoint_id) -> writes
    writes: FxHashMap<(String, u64), Vec<TaskWrite>>,
}

/// In-process checkpointer. State is lost on drop.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: Mutex<MemoryInner>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn put(
        &self,
        thread_id: &str,
        state: &ConversationState,
        metadata: Value,
    ) -> Result<u64, CheckpointerError> {
        let mut inner = self.inner.lock();
        let entries = inner.checkpoints.entry(thread_id.to_string()).or_default();
        let checkpoint_id = entries.last().map(|r| r.checkpoint_id).unwrap_or(0) + 1;
        entries.push(CheckpointRecord {
            thread_id: thread_id.to_string(),
            checkpoint_id,
            state: state.clone(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(checkpoint_id)
    }

    async fn put_record(&self, record: &CheckpointRecord) -> Result<(), CheckpointerError> {
        let mut inner = self.inner.lock();
        let entries = inner
            .checkpoints
            .entry(record.thread_id.clone())
            .or_default();
        // Entries stay sorted by checkpoint_id.
        match entries.binary_search_by_key(&record.checkpoint_id, |r| r.checkpoint_id) {
            Ok(pos) => entries[pos] = record.clone(),
            Err(pos) => entries.insert(pos, record.clone()),
        }
        Ok(())
    }

    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<u64>,
    ) -> Result<Option<CheckpointRecord>, CheckpointerError> {
        let inner = self.inner.lock();
        let Some(entries) = inner.checkpoints.get(thread_id) else {
            return Ok(None);
        };
        let record = match checkpoint_id {
            Some(id) => entries.iter().find(|r| r.checkpoint_id == id),
            None => entries.last(),
        };
        Ok(record.cloned())
    }

    async fn list(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, CheckpointerError> {
        let inner = self.inner.lock();
        let Some(entries) = inner.checkpoints.get(thread_id) else {
            return Ok(Vec::new());
        };
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
        writes: &[TaskWrite],
    ) -> Result<(), CheckpointerError> {
        let mut inner = self.inner.lock();
        inner
            .writes
            .entry((thread_id.to_string(), checkpoint_id))
            .or_default()
            .extend(writes.iter().cloned());
        Ok(())
    }

    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
    ) -> Result<Vec<TaskWrite>, CheckpointerError> {
        let inner = self.inner.lock();
        Ok(inner
            .writes
            .get(&(thread_id.to_string(), checkpoint_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn sweep(&self, max_age: Duration) -> Result<u64, CheckpointerError> {
        let cutoff = Utc::now() - max_age;
        let mut inner = self.inner.lock();
        let mut removed = 0u64;
        for entries in inner.checkpoints.values_mut() {
            let before = entries.len();
            entries.retain(|r| r.created_at >= cutoff);
            removed += (before - entries.len()) as u64;
        }
        inner.checkpoints.retain(|_, entries| !entries.is_empty());
        Ok(removed)
    }

    async fn stats(&self) -> Result<CheckpointStats, CheckpointerError> {
        let inner = self.inner.lock();
        Ok(CheckpointStats {
            threads: inner.checkpoints.len() as u64,
            checkpoints: inner.checkpoints.values().map(|v| v.len() as u64).sum(),
            writes: inner.writes.values().map(|v| v.len() as u64).sum(),
        })
    }

    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError> {
        let inner = self.inner.lock();
        let mut threads: Vec<String> = inner.checkpoints.keys().cloned().collect();
        threads.sort();
        Ok(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn checkpoint_ids_increment_per_thread() {
        let cp = InMemoryCheckpointer::new();
        let state = ConversationState::new("t1", "hi");
        assert_eq!(cp.put("t1", &state, json!({})).await.unwrap(), 1);
        assert_eq!(cp.put("t1", &state, json!({})).await.unwrap(), 2);
        assert_eq!(cp.put("t2", &state, json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_record_keeps_its_id_and_advances_the_counter() {
        let cp = InMemoryCheckpointer::new();
        let state = ConversationState::new("t1", "hi");
        cp.put_record(&CheckpointRecord {
            thread_id: "t1".into(),
            checkpoint_id: 7,
            state: state.clone(),
            metadata: json!({"n": 7}),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let stored = cp.get("t1", Some(7)).await.unwrap().unwrap();
        assert_eq!(stored.metadata["n"], 7);
        assert_eq!(cp.put("t1", &state, json!({})).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn get_latest_and_by_id() {
        let cp = InMemoryCheckpointer::new();
        let state = ConversationState::new("t1", "hi");
        cp.put("t1", &state, json!({"n": 1})).await.unwrap();
        cp.put("t1", &state, json!({"n": 2})).await.unwrap();

        let latest = cp.get("t1", None).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 2);
        assert_eq!(latest.metadata["n"], 2);

        let first = cp.get("t1", Some(1)).await.unwrap().unwrap();
        assert_eq!(first.metadata["n"], 1);
        assert!(cp.get("t1", Some(99)).await.unwrap().is_none());
        assert!(cp.get("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_roundtrip() {
        let cp = InMemoryCheckpointer::new();
        let state = ConversationState::new("t1", "hi");
        let id = cp.put("t1", &state, json!({})).await.unwrap();
        cp.put_writes(
            "t1",
            id,
            &[TaskWrite {
                task_id: "task-1".into(),
                data: json!({"step": "done"}),
            }],
        )
        .await
        .unwrap();
        let writes = cp.get_writes("t1", id).await.unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].task_id, "task-1");
    }

    #[tokio::test]
    async fn sweep_removes_everything_at_zero_age() {
        let cp = InMemoryCheckpointer::new();
        let state = ConversationState::new("t1", "hi");
        cp.put("t1", &state, json!({})).await.unwrap();
        cp.put("t2", &state, json!({})).await.unwrap();

        let removed = cp.sweep(Duration::zero() - Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cp.stats().await.unwrap(), CheckpointStats::default());
    }

    #[tokio::test]
    async fn stats_count_threads_checkpoints_writes() {
        let cp = InMemoryCheckpointer::new();
        let state = ConversationState::new("t1", "hi");
        cp.put("t1", &state, json!({})).await.unwrap();
        cp.put("t1", &state, json!({})).await.unwrap();
        cp.put("t2", &state, json!({})).await.unwrap();
        cp.put_writes("t1", 1, &[TaskWrite { task_id: "a".into(), data: json!(1) }])
            .await
            .unwrap();

        let stats = cp.stats().await.unwrap();
        assert_eq!(stats.threads, 2);
        assert_eq!(stats.checkpoints, 3);
        assert_eq!(stats.writes, 1);
        assert_eq!(cp.list_threads().await.unwrap(), vec!["t1", "t2"]);
    }
}
