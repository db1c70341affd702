//! Tool catalogue, closed dispatch, and execution plumbing.
//!
//! Tools are the backend operations the workflow can invoke on behalf of a
//! user. The set is closed: [`ToolName`] enumerates every known tool, and
//! dispatch of a name outside the enum yields an immediate failure result
//! instead of an error. The actual backend (the e-commerce data source) is an
//! opaque [`ToolBackend`] capability.

pub mod rate_limit;

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;

pub use rate_limit::RateLimiter;

/// Closed set of backend operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SearchProducts,
    GetProductDetails,
    GetOrderStatus,
    GetPolicy,
    GetStoreInfo,
    GetContactInfo,
    GetFaq,
}

impl ToolName {
    /// Every tool, in catalogue order.
    pub const ALL: [ToolName; 7] = [
        ToolName::SearchProducts,
        ToolName::GetProductDetails,
        ToolName::GetOrderStatus,
        ToolName::GetPolicy,
        ToolName::GetStoreInfo,
        ToolName::GetContactInfo,
        ToolName::GetFaq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::SearchProducts => "search_products",
            ToolName::GetProductDetails => "get_product_details",
            ToolName::GetOrderStatus => "get_order_status",
            ToolName::GetPolicy => "get_policy",
            ToolName::GetStoreInfo => "get_store_info",
            ToolName::GetContactInfo => "get_contact_info",
            ToolName::GetFaq => "get_faq",
        }
    }

    /// Resolve a raw tool name. Returns `None` for anything outside the
    /// closed set; callers convert that into an unknown-tool failure result.
    pub fn decode(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalogue entry describing one tool.
#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: ToolName,
    pub description: &'static str,
    pub parameters_schema: Value,
    /// Independent tools are pure lookups with no side effects on shared
    /// state; they may run concurrently in one fan-out group.
    pub independent: bool,
    /// Sliding 60-second call budget.
    pub per_minute_budget: u32,
}

static CATALOGUE: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    vec![
        ToolSpec {
            name: ToolName::SearchProducts,
            description: "Search the product catalogue by query, category, brand, and price range",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "category": {"type": "string"},
                    "brand": {"type": "string"},
                    "min_price": {"type": "number"},
                    "max_price": {"type": "number"},
                    "limit": {"type": "integer", "default": 10}
                },
                "required": ["query"]
            }),
            independent: false,
            per_minute_budget: 120,
        },
        ToolSpec {
            name: ToolName::GetProductDetails,
            description: "Fetch full details for a single product by id",
            parameters_schema: json!({
                "type": "object",
                "properties": {"product_id": {"type": "string"}},
                "required": ["product_id"]
            }),
            independent: false,
            per_minute_budget: 60,
        },
        ToolSpec {
            name: ToolName::GetOrderStatus,
            description: "Look up the status of an order by order number",
            parameters_schema: json!({
                "type": "object",
                "properties": {"order_number": {"type": "string"}},
                "required": ["order_number"]
            }),
            independent: false,
            per_minute_budget: 30,
        },
        ToolSpec {
            name: ToolName::GetPolicy,
            description: "Retrieve a store policy (returns, shipping, warranty)",
            parameters_schema: json!({
                "type": "object",
                "properties": {"topic": {"type": "string"}},
                "required": ["topic"]
            }),
            independent: true,
            per_minute_budget: 60,
        },
        ToolSpec {
            name: ToolName::GetStoreInfo,
            description: "Retrieve store locations and opening hours",
            parameters_schema: json!({
                "type": "object",
                "properties": {"location": {"type": "string"}}
            }),
            independent: true,
            per_minute_budget: 60,
        },
        ToolSpec {
            name: ToolName::GetContactInfo,
            description: "Retrieve customer-service contact channels",
            parameters_schema: json!({"type": "object", "properties": {}}),
            independent: true,
            per_minute_budget: 30,
        },
        ToolSpec {
            name: ToolName::GetFaq,
            description: "Search frequently asked questions",
            parameters_schema: json!({
                "type": "object",
                "properties": {"question": {"type": "string"}},
                "required": ["question"]
            }),
            independent: true,
            per_minute_budget: 60,
        },
    ]
});

/// The full tool catalogue.
pub fn catalogue() -> &'static [ToolSpec] {
    &CATALOGUE
}

/// Catalogue entry for one tool.
pub fn spec(name: ToolName) -> &'static ToolSpec {
    // ALL and CATALOGUE are index-aligned.
    &CATALOGUE[ToolName::ALL
        .iter()
        .position(|t| *t == name)
        .unwrap_or_default()]
}

/// A decided invocation of a named tool.
///
/// `tool_name` stays a raw string until dispatch: decisions come from model
/// output and may name a tool outside the closed set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub parameters: Value,
    #[serde(default)]
    pub execution_order: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            execution_order: 0,
            depends_on: Vec::new(),
        }
    }
}

/// Outcome of one tool invocation. Always produced, never raised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
}

impl ToolResult {
    pub fn success(tool_name: impl Into<String>, data: Value, execution_time: f64) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            data: Some(data),
            error: None,
            execution_time,
        }
    }

    pub fn failure(
        tool_name: impl Into<String>,
        error: impl Into<String>,
        execution_time: f64,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time,
        }
    }
}

/// Errors surfaced by a tool backend.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolBackendError {
    #[error("backend call failed: {0}")]
    #[diagnostic(code(shopgraph::tools::backend))]
    Backend(String),

    #[error("invalid parameters: {0}")]
    #[diagnostic(code(shopgraph::tools::parameters))]
    InvalidParameters(String),
}

/// Opaque capability wrapping the e-commerce data source.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(&self, name: ToolName, parameters: &Value) -> Result<Value, ToolBackendError>;
}

/// Default bound on any single backend call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Closed dispatch table over the tool catalogue.
///
/// `dispatch` never fails: unknown names, rate-limit rejections, backend
/// errors, and timeouts all become failure [`ToolResult`]s, keeping sibling
/// calls in a fan-out group unaffected.
pub struct ToolRegistry {
    backend: Arc<dyn ToolBackend>,
    limiter: RateLimiter,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend,
            limiter: RateLimiter::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Execute one decided call, converting every failure mode into a result.
    ///
    /// The rate-limit check happens before dispatch, so a rejected call never
    /// consumes the backend.
    #[instrument(skip(self, call), fields(tool = %call.tool_name))]
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();

        let Some(name) = ToolName::decode(&call.tool_name) else {
            return ToolResult::failure(&call.tool_name, "unknown tool", elapsed_secs(started));
        };

        if !self.limiter.try_acquire(name) {
            return ToolResult::failure(
                &call.tool_name,
                format!("rate limit exceeded for {name}"),
                elapsed_secs(started),
            );
        }

        match tokio::time::timeout(self.call_timeout, self.backend.execute(name, &call.parameters))
            .await
        {
            Ok(Ok(data)) => ToolResult::success(&call.tool_name, data, elapsed_secs(started)),
            Ok(Err(err)) => ToolResult::failure(&call.tool_name, err.to_string(), elapsed_secs(started)),
            Err(_) => ToolResult::failure(
                &call.tool_name,
                format!("timed out after {:.0}s", self.call_timeout.as_secs_f64()),
                elapsed_secs(started),
            ),
        }
    }
}

fn elapsed_secs(started: Instant) -> f64 {
    started.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_is_closed() {
        assert_eq!(ToolName::decode("get_faq"), Some(ToolName::GetFaq));
        assert_eq!(ToolName::decode("drop_tables"), None);
    }

    #[test]
    fn catalogue_is_aligned_with_all() {
        for name in ToolName::ALL {
            assert_eq!(spec(name).name, name);
        }
    }

    #[test]
    fn independence_matches_pure_lookups() {
        assert!(spec(ToolName::GetFaq).independent);
        assert!(spec(ToolName::GetPolicy).independent);
        assert!(spec(ToolName::GetStoreInfo).independent);
        assert!(spec(ToolName::GetContactInfo).independent);
        assert!(!spec(ToolName::SearchProducts).independent);
        assert!(!spec(ToolName::GetOrderStatus).independent);
    }

    #[test]
    fn budgets_match_catalogue() {
        assert_eq!(spec(ToolName::SearchProducts).per_minute_budget, 120);
        assert_eq!(spec(ToolName::GetOrderStatus).per_minute_budget, 30);
        assert_eq!(spec(ToolName::GetContactInfo).per_minute_budget, 30);
    }
}
