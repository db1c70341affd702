//! Tool decision: ask the model which tools to call, with a deterministic
//! fallback when the structured output cannot be used.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use super::format_entities;
use crate::capabilities::ChatModel;
use crate::faults::StageFault;
use crate::stage::{Stage, StageContext, StageError, StageUpdate};
use crate::state::StateSnapshot;
use crate::tools::{ToolCall, catalogue};

/// Confidence reported when the decision falls back to the default tool call.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Stage that plans tool calls via structured generation.
pub struct ToolDecisionStage {
    model: Arc<dyn ChatModel>,
}

impl ToolDecisionStage {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    fn prompt(snapshot: &StateSnapshot) -> String {
        let tools = catalogue()
            .iter()
            .map(|spec| {
                format!(
                    "- {}: {} (parameters: {})",
                    spec.name, spec.description, spec.parameters_schema
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You are planning tool calls for a shop assistant.\n\n\
             Customer message: {}\n\nExtracted entities:\n{}\n\n\
             Available tools:\n{}\n\n\
             Decide which tools to call and with which parameters. Flag \
             escalation when the customer needs a human.",
            snapshot.user_message,
            format_entities(&snapshot.entities),
            tools
        )
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "tool_calls": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool_name": {"type": "string"},
                            "parameters": {"type": "object"},
                            "execution_order": {"type": "integer"},
                            "depends_on": {"type": "array", "items": {"type": "string"}}
                        },
                        "required": ["tool_name", "parameters"]
                    }
                },
                "reasoning": {"type": "string"},
                "confidence": {"type": "number"},
                "requires_clarification": {"type": "boolean"},
                "suggested_follow_up": {"type": "array", "items": {"type": "string"}},
                "escalation_needed": {"type": "boolean"},
                "escalation_reason": {"type": "string"}
            },
            "required": ["tool_calls", "reasoning"]
        })
    }

    /// Default plan used whenever the model output is unusable: one low-risk
    /// catalogue search seeded with the raw message.
    fn fallback_update(snapshot: &StateSnapshot, fault: StageFault) -> StageUpdate {
        let call = ToolCall::new(
            "search_products",
            json!({"query": snapshot.user_message, "limit": 10}),
        );
        StageUpdate {
            tool_calls: Some(vec![call]),
            reasoning: Some("Falling back to a catalogue search; the tool plan could not be generated.".into()),
            confidence: Some(FALLBACK_CONFIDENCE),
            requires_clarification: Some(true),
            llm_calls: 1,
            faults: Some(vec![fault]),
            ..StageUpdate::default()
        }
    }

    fn parse_plan(output: &Value) -> Option<StageUpdate> {
        let raw_calls = output.get("tool_calls")?.as_array()?;
        let mut calls = Vec::with_capacity(raw_calls.len());
        for (index, raw) in raw_calls.iter().enumerate() {
            let tool_name = raw.get("tool_name")?.as_str()?;
            let parameters = raw.get("parameters").cloned().unwrap_or_else(|| json!({}));
            let execution_order = raw
                .get("execution_order")
                .and_then(Value::as_u64)
                .unwrap_or(index as u64) as u32;
            let depends_on = raw
                .get("depends_on")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            calls.push(ToolCall {
                tool_name: tool_name.to_string(),
                parameters,
                execution_order,
                depends_on,
            });
        }
        calls.sort_by_key(|c| c.execution_order);

        let reasoning = output
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("(no reasoning reported)")
            .to_string();

        Some(StageUpdate {
            tool_calls: Some(calls),
            reasoning: Some(reasoning),
            confidence: output.get("confidence").and_then(Value::as_f64),
            requires_clarification: output
                .get("requires_clarification")
                .and_then(Value::as_bool),
            suggested_follow_up: output
                .get("suggested_follow_up")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                }),
            escalation_needed: output.get("escalation_needed").and_then(Value::as_bool),
            escalation_reason: output
                .get("escalation_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            llm_calls: 1,
            ..StageUpdate::default()
        })
    }
}

#[async_trait]
impl Stage for ToolDecisionStage {
    #[instrument(skip(self, snapshot, ctx), fields(thread_id = %ctx.thread_id))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StageContext,
    ) -> Result<StageUpdate, StageError> {
        let prompt = Self::prompt(&snapshot);
        let output = match self
            .model
            .generate_structured(&prompt, &Self::schema())
            .await
        {
            Ok(output) => output,
            Err(err) => {
                ctx.emit("decision", "model call failed; using fallback plan")?;
                return Ok(Self::fallback_update(
                    &snapshot,
                    StageFault::new(ctx.stage_id.clone(), format!("tool decision failed: {err}")),
                ));
            }
        };

        match Self::parse_plan(&output) {
            Some(update) => {
                let count = update.tool_calls.as_ref().map(Vec::len).unwrap_or(0);
                ctx.emit("decision", format!("{count} tool calls planned"))?;
                Ok(update)
            }
            None => {
                ctx.emit("decision", "unparseable plan; using fallback")?;
                Ok(Self::fallback_update(
                    &snapshot,
                    StageFault::new(ctx.stage_id.clone(), "structured output did not parse")
                        .with_detail(output),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_orders_calls() {
        let output = json!({
            "tool_calls": [
                {"tool_name": "get_faq", "parameters": {"question": "returns"}, "execution_order": 2},
                {"tool_name": "search_products", "parameters": {"query": "tv"}, "execution_order": 1}
            ],
            "reasoning": "search then answer",
            "confidence": 0.8
        });
        let update = ToolDecisionStage::parse_plan(&output).unwrap();
        let calls = update.tool_calls.unwrap();
        assert_eq!(calls[0].tool_name, "search_products");
        assert_eq!(calls[1].tool_name, "get_faq");
        assert_eq!(update.confidence, Some(0.8));
    }

    #[test]
    fn parse_plan_rejects_missing_tool_calls() {
        assert!(ToolDecisionStage::parse_plan(&json!({"reasoning": "x"})).is_none());
        assert!(ToolDecisionStage::parse_plan(&json!({"tool_calls": "nope", "reasoning": "x"})).is_none());
    }

    #[test]
    fn parse_plan_keeps_escalation_fields() {
        let output = json!({
            "tool_calls": [],
            "reasoning": "needs a human",
            "escalation_needed": true,
            "escalation_reason": "billing dispute"
        });
        let update = ToolDecisionStage::parse_plan(&output).unwrap();
        assert_eq!(update.escalation_needed, Some(true));
        assert_eq!(update.escalation_reason.as_deref(), Some("billing dispute"));
    }
}
