//! Opaque model capabilities consumed by generation-backed stages.
//!
//! The workflow core has no dependency on any concrete model provider. Stages
//! that need language generation receive a [`ChatModel`] trait object; tests
//! script one, embedders wire a real provider.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// Errors produced by model capability calls.
#[derive(Debug, Error, Diagnostic)]
pub enum ModelError {
    /// The provider call itself failed (network, auth, provider-side error).
    #[error("model call failed ({provider}): {message}")]
    #[diagnostic(
        code(shopgraph::model::call),
        help("Check provider availability and credentials.")
    )]
    Call { provider: String, message: String },

    /// The provider returned output that did not match the requested shape.
    #[error("model response could not be parsed: {0}")]
    #[diagnostic(
        code(shopgraph::model::parse),
        help("Stages treat this as recoverable and fall back to defaults.")
    )]
    Parse(String),

    /// The call exceeded its bounded timeout.
    #[error("model call timed out after {seconds}s")]
    #[diagnostic(code(shopgraph::model::timeout))]
    Timeout { seconds: u64 },
}

/// Pluggable language-model capability.
///
/// Both operations are awaited external calls with bounded timeouts enforced
/// by the implementation; failures are ordinary error outcomes, never fatal
/// to the process.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce a JSON object conforming to `schema`.
    async fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<Value, ModelError>;

    /// Produce free text from a message transcript.
    async fn generate_text(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ModelError>;

    /// Provider-reported model identifier, surfaced in response metadata.
    fn model_name(&self) -> &str;
}
