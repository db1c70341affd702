//! Recoverable fault records collected during workflow execution.
//!
//! A [`StageFault`] is a non-fatal problem a stage recovered from (a failed
//! extraction method, a parse fallback, a rejected tool call). Faults ride on
//! the state and are surfaced to callers through response metadata; they never
//! abort the invocation. Fatal problems use `StageError` instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recoverable fault, attributed to the stage that absorbed it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageFault {
    /// Stage that recorded the fault (encoded stage kind or method label).
    pub stage: String,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Optional structured detail (provider error payloads, rejected input).
    #[serde(default)]
    pub detail: Value,
    /// When the fault was recorded.
    pub when: DateTime<Utc>,
}

impl StageFault {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            detail: Value::Null,
            when: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fault_construction_and_detail() {
        let fault = StageFault::new("Decide", "structured output did not parse")
            .with_detail(json!({"raw": "not json"}));
        assert_eq!(fault.stage, "Decide");
        assert_eq!(fault.detail["raw"], "not json");
    }
}
