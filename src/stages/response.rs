//! Response generation: synthesize the final reply from the message, the
//! decision rationale, and per-tool outcome summaries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::capabilities::ChatModel;
use crate::faults::StageFault;
use crate::message::Message;
use crate::stage::{Stage, StageContext, StageError, StageUpdate};
use crate::state::StateSnapshot;
use crate::tools::ToolResult;

/// Fixed reply used when generation fails. Output is never empty.
pub const FALLBACK_RESPONSE: &str = "I'm sorry, I ran into a problem while putting your answer \
together. Could you try asking that again?";

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 500;

fn summarize_tool_results(results: &[ToolResult]) -> String {
    if results.is_empty() {
        return "(no tools were called)".to_string();
    }
    results
        .iter()
        .map(|r| {
            if r.success {
                format!(
                    "- {}: ok in {:.2}s -> {}",
                    r.tool_name,
                    r.execution_time,
                    r.data
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "{}".to_string())
                )
            } else {
                format!(
                    "- {}: failed ({})",
                    r.tool_name,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stage that produces the final response text.
pub struct ResponseStage {
    model: Arc<dyn ChatModel>,
}

impl ResponseStage {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    fn transcript(snapshot: &StateSnapshot) -> Vec<Message> {
        let briefing = format!(
            "You are a helpful shop assistant. Answer the customer using the \
             tool results below. Be concise and concrete.\n\n\
             Decision rationale: {}\n\nTool results:\n{}",
            snapshot.reasoning.as_deref().unwrap_or("(none)"),
            summarize_tool_results(&snapshot.tool_results),
        );
        let mut messages = vec![Message::system(&briefing)];
        messages.extend(snapshot.messages.iter().cloned());
        messages
    }
}

#[async_trait]
impl Stage for ResponseStage {
    #[instrument(skip(self, snapshot, ctx), fields(thread_id = %ctx.thread_id))]
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: StageContext,
    ) -> Result<StageUpdate, StageError> {
        let transcript = Self::transcript(&snapshot);
        match self
            .model
            .generate_text(&transcript, TEMPERATURE, MAX_TOKENS)
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                ctx.emit("response", format!("{} chars generated", text.len()))?;
                Ok(StageUpdate {
                    response: Some(text.clone()),
                    messages: Some(vec![Message::assistant(&text)]),
                    llm_calls: 1,
                    ..StageUpdate::default()
                })
            }
            Ok(_) => {
                ctx.emit("response", "empty generation; using fallback")?;
                Ok(fallback_update(
                    StageFault::new(ctx.stage_id.clone(), "generation returned empty text"),
                ))
            }
            Err(err) => {
                ctx.emit("response", "generation failed; using fallback")?;
                Ok(fallback_update(StageFault::new(
                    ctx.stage_id.clone(),
                    format!("response generation failed: {err}"),
                )))
            }
        }
    }
}

// Only the decision stage sets the clarification flag; the fallback leaves
// it untouched so an earlier `true` survives into the outcome.
fn fallback_update(fault: StageFault) -> StageUpdate {
    StageUpdate {
        response: Some(FALLBACK_RESPONSE.to_string()),
        messages: Some(vec![Message::assistant(FALLBACK_RESPONSE)]),
        llm_calls: 1,
        faults: Some(vec![fault]),
        ..StageUpdate::default()
    }
}
