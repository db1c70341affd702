//! Serde-facing persistence models for checkpoint rows.
//!
//! Runtime types stay free of storage concerns; these mirrors define the
//! stable on-disk JSON shape and convert to and from the runtime types.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{CheckpointRecord, TaskWrite};
use crate::state::ConversationState;
use crate::utils::json_ext::JsonSerializable;

/// Errors converting between runtime and persisted forms.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("serialization error: {0}")]
    #[diagnostic(code(shopgraph::persistence::serde))]
    Serde(#[from] serde_json::Error),
}

/// Stable on-disk form of a [`CheckpointRecord`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    pub thread_id: String,
    pub checkpoint_id: u64,
    pub state: ConversationState,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl From<&CheckpointRecord> for PersistedCheckpoint {
    fn from(record: &CheckpointRecord) -> Self {
        Self {
            thread_id: record.thread_id.clone(),
            checkpoint_id: record.checkpoint_id,
            state: record.state.clone(),
            metadata: record.metadata.clone(),
            created_at: record.created_at,
        }
    }
}

impl From<PersistedCheckpoint> for CheckpointRecord {
    fn from(persisted: PersistedCheckpoint) -> Self {
        Self {
            thread_id: persisted.thread_id,
            checkpoint_id: persisted.checkpoint_id,
            state: persisted.state,
            metadata: persisted.metadata,
            created_at: persisted.created_at,
        }
    }
}

/// Stable on-disk form of a [`TaskWrite`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedTaskWrite {
    pub task_id: String,
    pub data: Value,
}

impl From<&TaskWrite> for PersistedTaskWrite {
    fn from(write: &TaskWrite) -> Self {
        Self {
            task_id: write.task_id.clone(),
            data: write.data.clone(),
        }
    }
}

impl From<PersistedTaskWrite> for TaskWrite {
    fn from(persisted: PersistedTaskWrite) -> Self {
        Self {
            task_id: persisted.task_id,
            data: persisted.data,
        }
    }
}

impl<T> JsonSerializable<PersistenceError> for T
where
    T: Serialize + DeserializeOwned,
{
    fn to_json_string(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(self)?)
    }

    fn from_json_str(raw: &str) -> Result<Self, PersistenceError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checkpoint_roundtrips_through_json() {
        let record = CheckpointRecord {
            thread_id: "t1".into(),
            checkpoint_id: 3,
            state: ConversationState::new("t1", "hello"),
            metadata: json!({"path": "simple"}),
            created_at: Utc::now(),
        };
        let persisted = PersistedCheckpoint::from(&record);
        let raw = persisted.to_json_string().unwrap();
        let back: CheckpointRecord = PersistedCheckpoint::from_json_str(&raw).unwrap().into();
        assert_eq!(back.thread_id, "t1");
        assert_eq!(back.checkpoint_id, 3);
        assert_eq!(back.metadata["path"], "simple");
        assert_eq!(back.state.user_message, "hello");
    }

    #[test]
    fn missing_metadata_defaults_to_null() {
        let raw = format!(
            r#"{{"thread_id":"t","checkpoint_id":1,"state":{},"created_at":"2026-01-01T00:00:00Z"}}"#,
            serde_json::to_string(&ConversationState::new("t", "x")).unwrap()
        );
        let persisted = PersistedCheckpoint::from_json_str(&raw).unwrap();
        assert!(persisted.metadata.is_null());
    }
}
