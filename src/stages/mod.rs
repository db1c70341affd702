//! The five pipeline stages: routing analysis, entity extraction, tool
//! decision, tool execution, and response generation.

pub mod decision;
pub mod execution;
pub mod extraction;
pub mod response;
pub mod routing;

pub use decision::ToolDecisionStage;
pub use execution::ToolExecutionStage;
pub use extraction::ExtractionStage;
pub use response::ResponseStage;
pub use routing::RoutingStage;

use crate::entities::Entity;

/// Compact entity listing used in generation prompts.
pub(crate) fn format_entities(entities: &[Entity]) -> String {
    if entities.is_empty() {
        return "(none)".to_string();
    }
    entities
        .iter()
        .map(|e| {
            format!(
                "- {} [{}] confidence {:.2}",
                e.text, e.label, e.confidence
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
