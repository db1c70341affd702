//! Conversation state threaded through one workflow invocation.
//!
//! A [`ConversationState`] is owned exclusively by one in-flight invocation:
//! stages receive an immutable [`StateSnapshot`] and return a
//! [`StageUpdate`](crate::stage::StageUpdate), which the runner applies back
//! onto the owned state. No stage retains a reference after returning.
//!
//! The `revision` counter increments on every applied update and orders
//! checkpoints for a thread.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::Entity;
use crate::faults::StageFault;
use crate::message::Message;
use crate::stage::StageUpdate;
use crate::tools::{ToolCall, ToolResult};
use crate::types::RoutePath;
use crate::utils::collections::new_extra_map;

/// The record threaded through one workflow invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationState {
    /// Logical conversation identifier scoping checkpoint continuity.
    pub thread_id: String,
    /// The inbound message for this invocation.
    pub user_message: String,
    /// Conversation transcript, including the current user message.
    pub messages: Vec<Message>,
    /// Merged, non-overlapping extracted entities.
    pub entities: Vec<Entity>,
    /// Path chosen by routing analysis (or forced by the entry mode).
    pub route: Option<RoutePath>,
    /// Decided tool invocations, in execution order.
    pub tool_calls: Vec<ToolCall>,
    /// Results of executed tool calls.
    pub tool_results: Vec<ToolResult>,
    /// Synthesized response text, once the response stage has run.
    pub response: Option<String>,
    /// Decision rationale reported by the tool-decision stage.
    pub reasoning: Option<String>,
    /// Aggregate confidence for this invocation.
    pub confidence: f64,
    pub requires_clarification: bool,
    pub suggested_follow_up: Vec<String>,
    pub escalation_needed: bool,
    pub escalation_reason: Option<String>,
    /// Number of external generation calls made so far.
    pub llm_calls_count: u32,
    /// Free-form context supplied by the caller plus stage annotations.
    pub extra: FxHashMap<String, Value>,
    /// Recoverable faults recorded by stages.
    pub faults: Vec<StageFault>,
    /// Fatal error description, set only at the workflow boundary.
    #[serde(default)]
    pub error: Option<String>,
    /// Stage at which the fatal error occurred.
    #[serde(default)]
    pub error_step: Option<String>,
    /// Monotonic revision, bumped on every applied stage update.
    pub revision: u32,
    pub started_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        let user_message = user_message.into();
        Self {
            thread_id: thread_id.into(),
            messages: vec![Message::user(&user_message)],
            user_message,
            entities: Vec::new(),
            route: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            response: None,
            reasoning: None,
            confidence: 0.0,
            requires_clarification: false,
            suggested_follow_up: Vec::new(),
            escalation_needed: false,
            escalation_reason: None,
            llm_calls_count: 0,
            extra: new_extra_map(),
            faults: Vec::new(),
            error: None,
            error_step: None,
            revision: 0,
            started_at: Utc::now(),
        }
    }

    pub fn builder(
        thread_id: impl Into<String>,
        user_message: impl Into<String>,
    ) -> StateBuilder {
        StateBuilder {
            state: Self::new(thread_id, user_message),
        }
    }

    /// Immutable view handed to stages.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            thread_id: self.thread_id.clone(),
            user_message: self.user_message.clone(),
            messages: self.messages.clone(),
            entities: self.entities.clone(),
            route: self.route,
            tool_calls: self.tool_calls.clone(),
            tool_results: self.tool_results.clone(),
            reasoning: self.reasoning.clone(),
            confidence: self.confidence,
            extra: self.extra.clone(),
        }
    }

    /// Merge a stage's partial update into the state and bump the revision.
    ///
    /// List-valued planning fields (entities, tool calls) replace wholesale;
    /// tool results, follow-ups, and faults append; scalars overwrite when
    /// present; `extra` merges key-by-key.
    pub fn apply(&mut self, update: StageUpdate) {
        if let Some(messages) = update.messages {
            self.messages.extend(messages);
        }
        if let Some(entities) = update.entities {
            self.entities = entities;
        }
        if let Some(route) = update.route {
            self.route = Some(route);
        }
        if let Some(tool_calls) = update.tool_calls {
            self.tool_calls = tool_calls;
        }
        if let Some(tool_results) = update.tool_results {
            self.tool_results.extend(tool_results);
        }
        if let Some(response) = update.response {
            self.response = Some(response);
        }
        if let Some(reasoning) = update.reasoning {
            self.reasoning = Some(reasoning);
        }
        if let Some(confidence) = update.confidence {
            self.confidence = confidence;
        }
        if let Some(requires_clarification) = update.requires_clarification {
            self.requires_clarification = requires_clarification;
        }
        if let Some(follow_up) = update.suggested_follow_up {
            self.suggested_follow_up.extend(follow_up);
        }
        if let Some(escalation_needed) = update.escalation_needed {
            self.escalation_needed = escalation_needed;
        }
        if let Some(reason) = update.escalation_reason {
            self.escalation_reason = Some(reason);
        }
        if let Some(extra) = update.extra {
            self.extra.extend(extra);
        }
        if let Some(faults) = update.faults {
            self.faults.extend(faults);
        }
        self.llm_calls_count += update.llm_calls;
        self.revision += 1;
    }

    /// Seconds elapsed since this invocation started.
    pub fn processing_time(&self) -> f64 {
        (Utc::now() - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Builder for states that need caller context or restored history.
pub struct StateBuilder {
    state: ConversationState,
}

impl StateBuilder {
    /// Prepend transcript restored from a checkpoint. The current user
    /// message stays last.
    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        let current = self.state.messages.split_off(0);
        self.state.messages = history;
        self.state.messages.extend(current);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: FxHashMap<String, Value>) -> Self {
        self.state.extra.extend(context);
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> ConversationState {
        self.state
    }
}

/// Immutable view of the state, cloned per stage execution.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub thread_id: String,
    pub user_message: String,
    pub messages: Vec<Message>,
    pub entities: Vec<Entity>,
    pub route: Option<RoutePath>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub reasoning: Option<String>,
    pub confidence: f64,
    pub extra: FxHashMap<String, Value>,
}
