//! Shared test doubles: a scripted chat model and a recording tool backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use shopgraph::capabilities::{ChatModel, ModelError};
use shopgraph::message::Message;
use shopgraph::tools::{ToolBackend, ToolBackendError, ToolName};

/// Chat model that replays queued outputs. When a queue is empty a sensible
/// default is produced, so most tests only script the interesting call.
#[derive(Default)]
pub struct ScriptedModel {
    structured: Mutex<VecDeque<Value>>,
    text: Mutex<VecDeque<String>>,
    pub fail_structured: AtomicBool,
    pub fail_text: AtomicBool,
    /// Transcripts seen by `generate_text`, in call order.
    pub text_transcripts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Model that fails every call.
    pub fn broken() -> Arc<Self> {
        let model = Self::default();
        model.fail_structured.store(true, Ordering::Relaxed);
        model.fail_text.store(true, Ordering::Relaxed);
        Arc::new(model)
    }

    pub fn push_structured(&self, output: Value) {
        self.structured.lock().push_back(output);
    }

    pub fn push_text(&self, output: impl Into<String>) {
        self.text.lock().push_back(output.into());
    }

    /// A one-tool plan naming `tool`.
    pub fn plan(tool: &str, parameters: Value) -> Value {
        json!({
            "tool_calls": [{"tool_name": tool, "parameters": parameters}],
            "reasoning": "scripted plan",
            "confidence": 0.9,
        })
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn generate_structured(
        &self,
        _prompt: &str,
        _schema: &Value,
    ) -> Result<Value, ModelError> {
        if self.fail_structured.load(Ordering::Relaxed) {
            return Err(ModelError::Call {
                provider: "scripted".into(),
                message: "scripted structured failure".into(),
            });
        }
        Ok(self
            .structured
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::plan("get_faq", json!({"question": "default"}))))
    }

    async fn generate_text(
        &self,
        messages: &[Message],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, ModelError> {
        self.text_transcripts.lock().push(messages.to_vec());
        if self.fail_text.load(Ordering::Relaxed) {
            return Err(ModelError::Call {
                provider: "scripted".into(),
                message: "scripted text failure".into(),
            });
        }
        Ok(self
            .text
            .lock()
            .pop_front()
            .unwrap_or_else(|| "scripted response".to_string()))
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }
}

/// Tool backend that records every call and can be told to fail or stall.
#[derive(Default)]
pub struct RecordingBackend {
    pub calls: Mutex<Vec<(ToolName, Value)>>,
    failing: Mutex<Vec<ToolName>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_tool(&self, tool: ToolName) {
        self.failing.lock().push(tool);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, tool: ToolName) -> usize {
        self.calls.lock().iter().filter(|(t, _)| *t == tool).count()
    }
}

#[async_trait]
impl ToolBackend for RecordingBackend {
    async fn execute(
        &self,
        name: ToolName,
        parameters: &Value,
    ) -> Result<Value, ToolBackendError> {
        self.calls.lock().push((name, parameters.clone()));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&name) {
            return Err(ToolBackendError::Backend("scripted outage".into()));
        }
        Ok(json!({"tool": name.as_str(), "ok": true}))
    }
}
