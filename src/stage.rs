//! Stage execution framework.
//!
//! A [`Stage`] is one pipeline step: it receives an immutable
//! [`StateSnapshot`] plus a [`StageContext`], and returns a [`StageUpdate`]
//! describing the state aspects it changed. Stages are stateless between
//! invocations and recover from expected failures internally, recording a
//! [`StageFault`] instead of erroring; `Err(StageError)` is reserved for
//! conditions the orchestrator must absorb at its boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::capabilities::ModelError;
use crate::entities::Entity;
use crate::faults::StageFault;
use crate::message::Message;
use crate::state::StateSnapshot;
use crate::tools::{ToolCall, ToolResult};
use crate::types::RoutePath;

/// Core trait for executable workflow stages.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Execute this stage against the given snapshot.
    async fn run(&self, snapshot: StateSnapshot, ctx: StageContext)
    -> Result<StageUpdate, StageError>;
}

/// Execution context passed to stages.
#[derive(Clone, Debug)]
pub struct StageContext {
    /// Identifier of this stage within the graph.
    pub stage_id: String,
    /// Conversation thread being processed.
    pub thread_id: String,
    /// Channel for emitting progress events.
    pub events: flume::Sender<StageEvent>,
}

impl StageContext {
    pub fn new(
        stage_id: impl Into<String>,
        thread_id: impl Into<String>,
        events: flume::Sender<StageEvent>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            thread_id: thread_id.into(),
            events,
        }
    }

    /// Emit a stage-scoped progress event.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), StageContextError> {
        self.events
            .send(StageEvent {
                stage: self.stage_id.clone(),
                thread_id: self.thread_id.clone(),
                scope: scope.into(),
                message: message.into(),
                when: Utc::now(),
            })
            .map_err(|_| StageContextError::ChannelClosed)
    }
}

/// Progress event emitted by a stage during execution.
#[derive(Clone, Debug)]
pub struct StageEvent {
    pub stage: String,
    pub thread_id: String,
    pub scope: String,
    pub message: String,
    pub when: DateTime<Utc>,
}

impl std::fmt::Display for StageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}/{}: {}",
            self.stage, self.thread_id, self.scope, self.message
        )
    }
}

/// Partial state update returned by stage execution.
///
/// All fields are optional so a stage touches only the aspects it owns.
/// The runner merges updates via
/// [`ConversationState::apply`](crate::state::ConversationState::apply).
#[derive(Clone, Debug, Default)]
pub struct StageUpdate {
    pub messages: Option<Vec<Message>>,
    pub entities: Option<Vec<Entity>>,
    pub route: Option<RoutePath>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolResult>>,
    pub response: Option<String>,
    pub reasoning: Option<String>,
    pub confidence: Option<f64>,
    pub requires_clarification: Option<bool>,
    pub suggested_follow_up: Option<Vec<String>>,
    pub escalation_needed: Option<bool>,
    pub escalation_reason: Option<String>,
    /// Generation calls made by this stage.
    pub llm_calls: u32,
    pub extra: Option<FxHashMap<String, Value>>,
    pub faults: Option<Vec<StageFault>>,
}

impl StageUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = Some(entities);
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: RoutePath) -> Self {
        self.route = Some(route);
        self
    }

    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    #[must_use]
    pub fn with_tool_results(mut self, tool_results: Vec<ToolResult>) -> Self {
        self.tool_results = Some(tool_results);
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn with_llm_calls(mut self, llm_calls: u32) -> Self {
        self.llm_calls = llm_calls;
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: Vec<StageFault>) -> Self {
        self.faults = Some(faults);
        self
    }

    #[must_use]
    pub fn with_extra(mut self, extra: FxHashMap<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Errors that can occur when using [`StageContext`] methods.
#[derive(Debug, Error, Diagnostic)]
pub enum StageContextError {
    #[error("failed to emit event: channel closed")]
    #[diagnostic(
        code(shopgraph::stage::event_channel),
        help("The invocation's event channel was dropped before the stage finished.")
    )]
    ChannelClosed,
}

/// Fatal errors that halt workflow execution.
///
/// These are caught exactly once at the orchestrator boundary and turned into
/// an apology response; for recoverable problems use `StageUpdate.faults`.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// Expected input is missing from the state snapshot.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(shopgraph::stage::missing_input),
        help("Check that the previous stage produced the required data.")
    )]
    MissingInput { what: &'static str },

    /// A model capability call failed in a way the stage could not absorb.
    #[error("model error: {0}")]
    #[diagnostic(code(shopgraph::stage::model))]
    Model(#[from] ModelError),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(shopgraph::stage::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Event channel error.
    #[error("event channel error: {0}")]
    #[diagnostic(code(shopgraph::stage::event_channel))]
    EventChannel(#[from] StageContextError),

    /// Catch-all for stage-specific failures.
    #[error("stage failed: {0}")]
    #[diagnostic(code(shopgraph::stage::failed))]
    Failed(String),
}
