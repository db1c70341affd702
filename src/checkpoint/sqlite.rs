//! SQLite-backed durable checkpointer.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::instrument;

use super::persistence::PersistedCheckpoint;
use super::{CheckpointRecord, CheckpointStats, Checkpointer, CheckpointerError, TaskWrite};
use crate::state::ConversationState;
use crate::utils::json_ext::JsonSerializable;

/// Durable checkpointer on a SQLite database.
///
/// Rows are keyed `(thread_id, checkpoint_id)`; the full state is stored as
/// one JSON document per checkpoint. With the `sqlite-migrations` feature the
/// schema is created on connect.
pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl SqliteCheckpointer {
    /// Connect to the given SQLite URL (for example `sqlite://shopgraph.db`).
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointerError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("failed to connect to sqlite: {e}"),
            })?;

        #[cfg(feature = "sqlite-migrations")]
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("failed to run migrations: {e}"),
            })?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool. The schema must already exist.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CheckpointRecord, CheckpointerError> {
        let state_json: String = row.get("state_json");
        let persisted =
            PersistedCheckpoint::from_json_str(&state_json).map_err(|e| {
                CheckpointerError::Backend {
                    message: format!("failed to decode checkpoint row: {e}"),
                }
            })?;
        Ok(persisted.into())
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    #[instrument(skip(self, state, metadata), fields(thread_id = %thread_id), err)]
    async fn put(
        &self,
        thread_id: &str,
        state: &ConversationState,
        metadata: Value,
    ) -> Result<u64, CheckpointerError> {
        let mut tx = self.pool.begin().await.map_err(|e| CheckpointerError::Backend {
            message: format!("failed to begin transaction: {e}"),
        })?;

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(checkpoint_id), 0) + 1 FROM checkpoints WHERE thread_id = ?1",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to allocate checkpoint id: {e}"),
        })?;

        let record = CheckpointRecord {
            thread_id: thread_id.to_string(),
            checkpoint_id: next as u64,
            state: state.clone(),
            metadata,
            created_at: Utc::now(),
        };
        let state_json = PersistedCheckpoint::from(&record)
            .to_json_string()
            .map_err(|e| CheckpointerError::Backend {
                message: format!("failed to encode checkpoint: {e}"),
            })?;

        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints \
             (thread_id, checkpoint_id, state_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(thread_id)
        .bind(next)
        .bind(&state_json)
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to insert checkpoint: {e}"),
        })?;

        tx.commit().await.map_err(|e| CheckpointerError::Backend {
            message: format!("failed to commit checkpoint: {e}"),
        })?;

        Ok(next as u64)
    }

    #[instrument(skip(self, record), fields(thread_id = %record.thread_id), err)]
    async fn put_record(&self, record: &CheckpointRecord) -> Result<(), CheckpointerError> {
        let state_json = PersistedCheckpoint::from(record)
            .to_json_string()
            .map_err(|e| CheckpointerError::Backend {
                message: format!("failed to encode checkpoint: {e}"),
            })?;

        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints \
             (thread_id, checkpoint_id, state_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&record.thread_id)
        .bind(record.checkpoint_id as i64)
        .bind(&state_json)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to insert checkpoint: {e}"),
        })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(
        &self,
        thread_id: &str,
        checkpoint_id: Option<u64>,
    ) -> Result<Option<CheckpointRecord>, CheckpointerError> {
        let row = match checkpoint_id {
            Some(id) => {
                sqlx::query(
                    "SELECT state_json FROM checkpoints \
                     WHERE thread_id = ?1 AND checkpoint_id = ?2",
                )
                .bind(thread_id)
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT state_json FROM checkpoints WHERE thread_id = ?1 \
                     ORDER BY checkpoint_id DESC LIMIT 1",
                )
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to fetch checkpoint: {e}"),
        })?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, CheckpointerError> {
        let rows = sqlx::query(
            "SELECT state_json FROM checkpoints WHERE thread_id = ?1 \
             ORDER BY checkpoint_id DESC LIMIT ?2",
        )
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to list checkpoints: {e}"),
        })?;

        rows.iter().map(Self::record_from_row).collect()
    }

    #[instrument(skip(self, writes), err)]
    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
        writes: &[TaskWrite],
    ) -> Result<(), CheckpointerError> {
        let mut tx = self.pool.begin().await.map_err(|e| CheckpointerError::Backend {
            message: format!("failed to begin transaction: {e}"),
        })?;

        for write in writes {
            let data = serde_json::to_string(&write.data)?;
            sqlx::query(
                "INSERT OR REPLACE INTO checkpoint_writes \
                 (thread_id, checkpoint_id, task_id, data_json) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(thread_id)
            .bind(checkpoint_id as i64)
            .bind(&write.task_id)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("failed to insert task write: {e}"),
            })?;
        }

        tx.commit().await.map_err(|e| CheckpointerError::Backend {
            message: format!("failed to commit task writes: {e}"),
        })
    }

    #[instrument(skip(self), err)]
    async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_id: u64,
    ) -> Result<Vec<TaskWrite>, CheckpointerError> {
        let rows = sqlx::query(
            "SELECT task_id, data_json FROM checkpoint_writes \
             WHERE thread_id = ?1 AND checkpoint_id = ?2 ORDER BY task_id",
        )
        .bind(thread_id)
        .bind(checkpoint_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to fetch task writes: {e}"),
        })?;

        rows.iter()
            .map(|row| {
                let data_json: String = row.get("data_json");
                Ok(TaskWrite {
                    task_id: row.get("task_id"),
                    data: serde_json::from_str(&data_json)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn sweep(&self, max_age: Duration) -> Result<u64, CheckpointerError> {
        let cutoff: DateTime<Utc> = Utc::now() - max_age;
        let cutoff = cutoff.to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(|e| CheckpointerError::Backend {
            message: format!("failed to begin transaction: {e}"),
        })?;

        sqlx::query(
            "DELETE FROM checkpoint_writes WHERE (thread_id, checkpoint_id) IN \
             (SELECT thread_id, checkpoint_id FROM checkpoints WHERE created_at < ?1)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to sweep task writes: {e}"),
        })?;

        let result = sqlx::query("DELETE FROM checkpoints WHERE created_at < ?1")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("failed to sweep checkpoints: {e}"),
            })?;

        tx.commit().await.map_err(|e| CheckpointerError::Backend {
            message: format!("failed to commit sweep: {e}"),
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<CheckpointStats, CheckpointerError> {
        let row = sqlx::query(
            "SELECT \
             (SELECT COUNT(DISTINCT thread_id) FROM checkpoints) AS threads, \
             (SELECT COUNT(*) FROM checkpoints) AS checkpoints, \
             (SELECT COUNT(*) FROM checkpoint_writes) AS writes",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to collect stats: {e}"),
        })?;

        Ok(CheckpointStats {
            threads: row.get::<i64, _>("threads") as u64,
            checkpoints: row.get::<i64, _>("checkpoints") as u64,
            writes: row.get::<i64, _>("writes") as u64,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError> {
        let rows = sqlx::query(
            "SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("failed to list threads: {e}"),
        })?;

        Ok(rows.iter().map(|row| row.get("thread_id")).collect())
    }
}
