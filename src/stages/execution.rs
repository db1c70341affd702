//! Tool execution: run decided calls in groups with sibling isolation.
//!
//! On the parallel path, tools flagged independent in the catalogue form one
//! fan-out group executed concurrently; every other call runs alone, in
//! decision order. On the simple path everything runs sequentially. Failure
//! of one call never cancels its siblings, and a rate-limited or unknown tool
//! fails before the backend is touched.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::instrument;

use crate::stage::{Stage, StageContext, StageError, StageUpdate};
use crate::state::StateSnapshot;
use crate::tools::{ToolCall, ToolName, ToolRegistry, ToolResult, spec};
use crate::types::RoutePath;

/// Partition decided calls into execution groups.
///
/// Groups preserve decision order; when grouping is enabled, all independent
/// calls collapse into one group placed where the first of them appeared.
pub fn plan_groups(calls: &[ToolCall], grouped: bool) -> Vec<Vec<ToolCall>> {
    if !grouped {
        return calls.iter().cloned().map(|c| vec![c]).collect();
    }

    let mut groups: Vec<Vec<ToolCall>> = Vec::new();
    let mut independent_slot: Option<usize> = None;

    for call in calls {
        let independent = ToolName::decode(&call.tool_name)
            .map(|name| spec(name).independent)
            .unwrap_or(false);
        if independent {
            match independent_slot {
                Some(slot) => groups[slot].push(call.clone()),
                None => {
                    independent_slot = Some(groups.len());
                    groups.push(vec![call.clone()]);
                }
            }
        } else {
            groups.push(vec![call.clone()]);
        }
    }
    groups
}

/// Stage that drives the closed dispatch table.
pub struct ToolExecutionStage {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutionStage {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for ToolExecutionStage {
    #[instrument(skip(self, snapshot, ctx), fields(thread_id = %ctx.thread_id))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StageContext,
    ) -> Result<StageUpdate, StageError> {
        let grouped = snapshot.route == Some(RoutePath::Parallel);
        let groups = plan_groups(&snapshot.tool_calls, grouped);

        let mut results: Vec<ToolResult> = Vec::with_capacity(snapshot.tool_calls.len());
        for group in &groups {
            if group.len() == 1 {
                results.push(self.registry.dispatch(&group[0]).await);
            } else {
                // Fan-out/fan-in; join_all keeps results in call order.
                let group_results =
                    join_all(group.iter().map(|call| self.registry.dispatch(call))).await;
                results.extend(group_results);
            }
        }

        let failures = results.iter().filter(|r| !r.success).count();
        ctx.emit(
            "execution",
            format!(
                "{} calls in {} groups, {} failed",
                results.len(),
                groups.len(),
                failures
            ),
        )?;

        Ok(StageUpdate::new().with_tool_results(results))
    }
}
