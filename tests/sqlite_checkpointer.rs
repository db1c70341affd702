#![cfg(feature = "sqlite-migrations")]

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use shopgraph::checkpoint::hybrid::HybridCheckpointer;
use shopgraph::checkpoint::sqlite::SqliteCheckpointer;
use shopgraph::checkpoint::{Checkpointer, TaskWrite};
use shopgraph::state::ConversationState;

async fn connect(dir: &tempfile::TempDir) -> SqliteCheckpointer {
    let path = dir.path().join("checkpoints.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    SqliteCheckpointer::connect(&url).await.unwrap()
}

#[tokio::test]
async fn put_get_roundtrip_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let cp = connect(&dir).await;

    let mut state = ConversationState::new("t1", "find sony headphones");
    state.apply(
        shopgraph::stage::StageUpdate::new()
            .with_route(shopgraph::RoutePath::Parallel)
            .with_confidence(0.8),
    );

    let id = cp.put("t1", &state, json!({"path": "parallel"})).await.unwrap();
    assert_eq!(id, 1);
    assert_eq!(cp.put("t1", &state, json!({})).await.unwrap(), 2);

    let latest = cp.get("t1", None).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_id, 2);
    assert_eq!(latest.state.user_message, "find sony headphones");
    assert_eq!(latest.state.route, Some(shopgraph::RoutePath::Parallel));

    let first = cp.get("t1", Some(1)).await.unwrap().unwrap();
    assert_eq!(first.metadata["path"], "parallel");
}

#[tokio::test]
async fn listing_and_threads() {
    let dir = tempfile::tempdir().unwrap();
    let cp = connect(&dir).await;
    let state = ConversationState::new("x", "hi");

    for thread in ["a", "b"] {
        cp.put(thread, &state, json!({})).await.unwrap();
    }
    cp.put("a", &state, json!({})).await.unwrap();

    let list = cp.list("a", 10).await.unwrap();
    assert_eq!(list.len(), 2);
    assert!(list[0].checkpoint_id > list[1].checkpoint_id);
    assert_eq!(cp.list_threads().await.unwrap(), vec!["a", "b"]);

    let stats = cp.stats().await.unwrap();
    assert_eq!(stats.threads, 2);
    assert_eq!(stats.checkpoints, 3);
}

#[tokio::test]
async fn task_writes_attach_to_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let cp = connect(&dir).await;
    let state = ConversationState::new("t1", "hi");
    let id = cp.put("t1", &state, json!({})).await.unwrap();

    cp.put_writes(
        "t1",
        id,
        &[
            TaskWrite {
                task_id: "task-b".into(),
                data: json!({"n": 2}),
            },
            TaskWrite {
                task_id: "task-a".into(),
                data: json!({"n": 1}),
            },
        ],
    )
    .await
    .unwrap();

    let writes = cp.get_writes("t1", id).await.unwrap();
    assert_eq!(writes.len(), 2);
    // Ordered by task id.
    assert_eq!(writes[0].task_id, "task-a");
    assert!(cp.get_writes("t1", 99).await.unwrap().is_empty());
}

#[tokio::test]
async fn hybrid_ids_continue_from_the_database_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let durable: Arc<dyn Checkpointer> = Arc::new(connect(&dir).await);
        let cp = HybridCheckpointer::new(Some(durable));
        let state = ConversationState::new("t1", "first");
        assert_eq!(cp.put("t1", &state, json!({"n": 1})).await.unwrap(), 1);
    }

    // A fresh process over the same database file: the volatile counter is
    // empty, but allocated ids keep advancing from the stored maximum.
    let durable: Arc<dyn Checkpointer> = Arc::new(connect(&dir).await);
    let cp = HybridCheckpointer::new(Some(durable.clone()));
    let state = ConversationState::new("t1", "second");
    assert_eq!(cp.put("t1", &state, json!({"n": 2})).await.unwrap(), 2);

    let first = durable.get("t1", Some(1)).await.unwrap().unwrap();
    assert_eq!(first.metadata["n"], 1);
    assert_eq!(first.state.user_message, "first");
}

#[tokio::test]
async fn sweep_removes_old_checkpoints_and_their_writes() {
    let dir = tempfile::tempdir().unwrap();
    let cp = connect(&dir).await;
    let state = ConversationState::new("t1", "hi");
    let id = cp.put("t1", &state, json!({})).await.unwrap();
    cp.put_writes(
        "t1",
        id,
        &[TaskWrite {
            task_id: "task-1".into(),
            data: json!({}),
        }],
    )
    .await
    .unwrap();

    // Nothing is old enough yet.
    assert_eq!(cp.sweep(Duration::hours(1)).await.unwrap(), 0);
    // A negative age puts the cutoff in the future.
    assert_eq!(cp.sweep(Duration::seconds(-5)).await.unwrap(), 1);
    assert!(cp.get("t1", None).await.unwrap().is_none());
    assert!(cp.get_writes("t1", id).await.unwrap().is_empty());
}
