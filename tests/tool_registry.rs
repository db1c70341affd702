mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::fixtures::RecordingBackend;
use shopgraph::stage::{Stage, StageContext, StageUpdate};
use shopgraph::stages::ToolExecutionStage;
use shopgraph::state::ConversationState;
use shopgraph::tools::{ToolCall, ToolName, ToolRegistry};
use shopgraph::types::RoutePath;

#[tokio::test]
async fn rate_limit_rejects_before_backend() {
    let backend = RecordingBackend::new();
    let registry = ToolRegistry::new(backend.clone());
    let call = ToolCall::new("get_order_status", json!({"order_number": "A-1"}));

    // Budget for get_order_status is 30 per minute.
    for _ in 0..30 {
        let result = registry.dispatch(&call).await;
        assert!(result.success);
    }
    let rejected = registry.dispatch(&call).await;
    assert!(!rejected.success);
    assert!(
        rejected
            .error
            .as_deref()
            .is_some_and(|e| e.contains("rate limit"))
    );
    // The rejected call never reached the backend.
    assert_eq!(backend.calls_for(ToolName::GetOrderStatus), 30);
}

#[tokio::test]
async fn unknown_tool_becomes_failure_result() {
    let backend = RecordingBackend::new();
    let registry = ToolRegistry::new(backend.clone());
    let result = registry
        .dispatch(&ToolCall::new("teleport_order", json!({})))
        .await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("unknown tool"));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let backend = RecordingBackend::new();
    backend.set_delay(Duration::from_millis(200));
    let registry =
        ToolRegistry::new(backend).with_call_timeout(Duration::from_millis(20));

    let result = registry
        .dispatch(&ToolCall::new("get_faq", json!({"question": "hours"})))
        .await;
    assert!(!result.success);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out"))
    );
}

#[tokio::test]
async fn backend_error_is_isolated_per_result() {
    let backend = RecordingBackend::new();
    backend.fail_tool(ToolName::GetPolicy);
    let registry = ToolRegistry::new(backend);

    let failed = registry
        .dispatch(&ToolCall::new("get_policy", json!({"topic": "returns"})))
        .await;
    let ok = registry
        .dispatch(&ToolCall::new("get_faq", json!({"question": "returns"})))
        .await;

    assert!(!failed.success);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("outage")));
    assert!(ok.success);
    assert_eq!(ok.data.as_ref().map(|d| d["ok"].clone()), Some(json!(true)));
}

#[tokio::test]
async fn fan_out_failure_leaves_siblings_intact() {
    let backend = RecordingBackend::new();
    backend.fail_tool(ToolName::GetStoreInfo);
    let registry = Arc::new(ToolRegistry::new(backend.clone()));
    let stage = ToolExecutionStage::new(registry);

    let mut state = ConversationState::new("t-fan", "everything at once please");
    state.apply(
        StageUpdate::new()
            .with_route(RoutePath::Parallel)
            .with_tool_calls(vec![
                ToolCall::new("get_policy", json!({"topic": "returns"})),
                ToolCall::new("get_store_info", json!({})),
                ToolCall::new("get_contact_info", json!({})),
            ]),
    );

    let (tx, _rx) = flume::unbounded();
    let ctx = StageContext::new("execute", "t-fan", tx);
    let update = stage.run(state.snapshot(), ctx).await.unwrap();

    let results = update.tool_results.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r.success).count(), 2);
    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed[0].tool_name, "get_store_info");
    // The failing sibling never stopped the others from reaching the backend.
    assert_eq!(backend.calls_for(ToolName::GetPolicy), 1);
    assert_eq!(backend.calls_for(ToolName::GetContactInfo), 1);
}

#[tokio::test]
async fn remaining_budget_shrinks_with_use() {
    let backend = RecordingBackend::new();
    let registry = ToolRegistry::new(backend);
    let before = registry.limiter().remaining(ToolName::GetFaq);
    registry
        .dispatch(&ToolCall::new("get_faq", json!({"question": "x"})))
        .await;
    assert_eq!(registry.limiter().remaining(ToolName::GetFaq), before - 1);
}
