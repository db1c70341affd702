//! Routing analysis: pick the simple or parallel path for an invocation.
//!
//! The decision is pure and deterministic: a cheap rules-only extraction pass
//! estimates the entity count, then a phrase-hit score selects the path. The
//! threshold and phrase lists are long-standing production heuristics and are
//! preserved as-is.

use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

use super::extraction::rules_extract;
use crate::stage::{Stage, StageContext, StageError, StageUpdate};
use crate::state::StateSnapshot;
use crate::types::RoutePath;
use crate::utils::collections::extra_map_from;

/// Phrases indicating a multi-faceted request.
pub const COMPLEXITY_PHRASES: [&str; 9] = [
    "between",
    "range",
    "multiple",
    "several",
    "compare",
    "recommendation",
    "suggestion",
    "advice",
    "help me choose",
];

/// Phrases indicating urgency or frustration.
pub const URGENCY_PHRASES: [&str; 9] = [
    "urgent",
    "asap",
    "immediately",
    "right now",
    "emergency",
    "frustrated",
    "angry",
    "disappointed",
    "unhappy",
];

/// Connectives suggesting more than one tool will be needed.
pub const CONNECTIVE_PHRASES: [&str; 8] = [
    "and",
    "also",
    "plus",
    "additionally",
    "as well as",
    "what about",
    "how about",
    "tell me about",
];

/// Score at or above which the parallel path is selected.
pub const PARALLEL_THRESHOLD: u32 = 2;

/// Heuristic complexity score for a message with `entity_count` estimated
/// entities: phrase hits across all three lists plus `min(entities / 2, 3)`.
pub fn complexity_score(message: &str, entity_count: usize) -> u32 {
    let lower = message.to_lowercase();
    let hits = |phrases: &[&str]| phrases.iter().filter(|p| lower.contains(*p)).count() as u32;

    let complexity = hits(&COMPLEXITY_PHRASES);
    let urgency = hits(&URGENCY_PHRASES);
    let connectives = hits(&CONNECTIVE_PHRASES);
    let entity_score = ((entity_count / 2) as u32).min(3);

    complexity + urgency + connectives + entity_score
}

/// Pure routing predicate: parallel when the score reaches the threshold.
pub fn choose_path(message: &str, entity_count: usize) -> RoutePath {
    if complexity_score(message, entity_count) >= PARALLEL_THRESHOLD {
        RoutePath::Parallel
    } else {
        RoutePath::Simple
    }
}

/// Key in `state.extra` that forces a path, bypassing analysis.
/// Set by the orchestrator for the fixed entry modes.
pub const PATH_OVERRIDE_KEY: &str = "path_override";

/// Stage wrapper around [`choose_path`].
pub struct RoutingStage;

#[async_trait]
impl Stage for RoutingStage {
    #[instrument(skip(self, snapshot, ctx), fields(thread_id = %ctx.thread_id))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StageContext,
    ) -> Result<StageUpdate, StageError> {
        if let Some(forced) = snapshot
            .extra
            .get(PATH_OVERRIDE_KEY)
            .and_then(|v| v.as_str())
            .and_then(RoutePath::parse)
        {
            ctx.emit("routing", format!("path forced to {forced}"))?;
            return Ok(StageUpdate::new().with_route(forced));
        }

        // Cheap regex-only pass; the real extraction stage runs next.
        let estimated = rules_extract(&snapshot.user_message);
        let score = complexity_score(&snapshot.user_message, estimated.len());
        let path = if score >= PARALLEL_THRESHOLD {
            RoutePath::Parallel
        } else {
            RoutePath::Simple
        };

        ctx.emit(
            "routing",
            format!("score={score} entities={} path={path}", estimated.len()),
        )?;

        Ok(StageUpdate::new().with_route(path).with_extra(extra_map_from([
            ("routing_score".to_string(), json!(score)),
            ("routing_entity_estimate".to_string(), json!(estimated.len())),
        ])))
    }
}
