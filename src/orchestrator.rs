//! Top-level assistant: wires the workflow, persistence, cache, and monitor
//! behind one `process_message` entry point with a single error boundary.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::cache::{ResponseCache, SWEEP_INTERVAL, response_key};
use crate::capabilities::ChatModel;
use crate::checkpoint::hybrid::HybridCheckpointer;
use crate::checkpoint::{Checkpointer, CheckpointerError};
use crate::config::{EntryMode, WorkflowConfig};
use crate::graph::{EdgePredicate, Workflow, WorkflowBuilder, WorkflowError};
use crate::monitor::{PerformanceMetric, PerformanceMonitor};
use crate::stage::StageEvent;
use crate::stages::{
    ExtractionStage, ResponseStage, RoutingStage, ToolDecisionStage, ToolExecutionStage,
};
use crate::stages::routing::PATH_OVERRIDE_KEY;
use crate::state::{ConversationState, StateSnapshot};
use crate::tools::{ToolBackend, ToolRegistry};
use crate::types::{RoutePath, StageKind};
use crate::utils::ids::IdGenerator;

/// Reply used when the workflow itself fails. Every other failure mode is
/// absorbed inside a stage and still yields a real response.
pub const FATAL_RESPONSE: &str =
    "I'm sorry, something went wrong on our side while handling your request. Please try again \
     in a moment.";

/// Confidence reported alongside [`FATAL_RESPONSE`].
pub const FATAL_CONFIDENCE: f64 = 0.1;

/// Result of one processed message.
#[derive(Clone, Debug)]
pub struct ProcessOutcome {
    pub success: bool,
    pub thread_id: String,
    pub response: String,
    pub metadata: Value,
}

/// Builder for [`ShopAssistant`].
pub struct ShopAssistantBuilder {
    model: Arc<dyn ChatModel>,
    backend: Arc<dyn ToolBackend>,
    config: WorkflowConfig,
    durable: Option<Arc<dyn Checkpointer>>,
    remote_cache: Option<Arc<dyn crate::cache::RemoteCache>>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl ShopAssistantBuilder {
    pub fn new(model: Arc<dyn ChatModel>, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            model,
            backend,
            config: WorkflowConfig::default(),
            durable: None,
            remote_cache: None,
            monitor: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable checkpoint store paired with the always-on volatile tier.
    /// Ignored when persistence is disabled in the config.
    #[must_use]
    pub fn with_durable_checkpointer(mut self, durable: Arc<dyn Checkpointer>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Shared cache tier consulted before the in-process one.
    #[must_use]
    pub fn with_remote_cache(mut self, remote: Arc<dyn crate::cache::RemoteCache>) -> Self {
        self.remote_cache = Some(remote);
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<ShopAssistant, WorkflowError> {
        let registry = Arc::new(
            ToolRegistry::new(self.backend).with_call_timeout(self.config.call_timeout),
        );
        let workflow = build_workflow(self.model.clone(), registry.clone())?;

        let checkpointer = if self.config.enable_persistence {
            Some(Arc::new(HybridCheckpointer::new(self.durable)))
        } else {
            None
        };
        let cache = if self.config.enable_cache {
            Some(Arc::new(ResponseCache::new(
                self.config.cache_capacity,
                self.config.response_ttl,
                self.remote_cache,
            )))
        } else {
            None
        };

        Ok(ShopAssistant {
            model: self.model,
            registry,
            workflow,
            checkpointer,
            cache,
            monitor: self.monitor.unwrap_or_default(),
            config: self.config,
            ids: IdGenerator::new(),
        })
    }
}

/// Assemble the stage graph: routing, conditional extraction, decision,
/// execution, response.
fn build_workflow(
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
) -> Result<Workflow, WorkflowError> {
    let route_choice: EdgePredicate = Arc::new(|snapshot: &StateSnapshot| {
        match snapshot.route {
            Some(RoutePath::Parallel) => StageKind::ParallelExtract,
            _ => StageKind::SimpleExtract,
        }
    });

    WorkflowBuilder::new()
        .add_stage(StageKind::Routing, Arc::new(RoutingStage))
        .add_stage(StageKind::SimpleExtract, Arc::new(ExtractionStage::simple()))
        .add_stage(
            StageKind::ParallelExtract,
            Arc::new(ExtractionStage::parallel(model.clone())),
        )
        .add_stage(
            StageKind::Decide,
            Arc::new(ToolDecisionStage::new(model.clone())),
        )
        .add_stage(StageKind::Execute, Arc::new(ToolExecutionStage::new(registry)))
        .add_stage(StageKind::Respond, Arc::new(ResponseStage::new(model)))
        .add_edge(StageKind::Start, StageKind::Routing)
        .add_conditional_edge(StageKind::Routing, route_choice)
        .add_edge(StageKind::SimpleExtract, StageKind::Decide)
        .add_edge(StageKind::ParallelExtract, StageKind::Decide)
        .add_edge(StageKind::Decide, StageKind::Execute)
        .add_edge(StageKind::Execute, StageKind::Respond)
        .add_edge(StageKind::Respond, StageKind::End)
        .compile()
}

/// The message-processing workflow engine.
pub struct ShopAssistant {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    workflow: Workflow,
    checkpointer: Option<Arc<HybridCheckpointer>>,
    cache: Option<Arc<ResponseCache>>,
    monitor: Arc<PerformanceMonitor>,
    config: WorkflowConfig,
    ids: IdGenerator,
}

impl ShopAssistant {
    pub fn builder(
        model: Arc<dyn ChatModel>,
        backend: Arc<dyn ToolBackend>,
    ) -> ShopAssistantBuilder {
        ShopAssistantBuilder::new(model, backend)
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Process one user message end to end. Never returns an error: the
    /// workflow boundary absorbs fatal failures into an apology outcome.
    #[instrument(skip(self, user_message, context), fields(thread_id))]
    pub async fn process_message(
        &self,
        user_message: &str,
        thread_id: Option<&str>,
        context: Option<FxHashMap<String, Value>>,
    ) -> ProcessOutcome {
        let thread_id = thread_id
            .map(str::to_string)
            .unwrap_or_else(|| self.ids.generate_thread_id());
        tracing::Span::current().record("thread_id", thread_id.as_str());

        let mut state = self.build_state(&thread_id, user_message, context).await;
        let (events_tx, events_rx) = flume::unbounded::<StageEvent>();
        let event_drain = tokio::spawn(async move {
            while let Ok(event) = events_rx.recv_async().await {
                debug!(%event, "stage event");
            }
        });

        let run = self.run_workflow(&mut state, events_tx).await;
        drop(event_drain);

        match run {
            Ok(cache_hit) => self.complete(state, cache_hit).await,
            Err(err) => self.fatal_outcome(state, err).await,
        }
    }

    /// Workflow boundary: absorb a fatal stage failure into an apology
    /// outcome, recording the error on the state before checkpointing it.
    async fn fatal_outcome(
        &self,
        mut state: ConversationState,
        err: crate::graph::WorkflowRunError,
    ) -> ProcessOutcome {
        let error_step = err.stage.to_string();
        warn!(stage = %error_step, error = %err, "workflow failed at boundary");

        state.error = Some(err.to_string());
        state.error_step = Some(error_step.clone());
        if let Some(checkpointer) = &self.checkpointer {
            let metadata = json!({
                "error_step": error_step,
                "revision": state.revision,
            });
            if let Err(err) = checkpointer.put(&state.thread_id, &state, metadata).await {
                warn!(error = %err, "checkpoint write failed");
            }
        }
        self.record_metric(&state, false, false, Some(error_step.clone()));

        ProcessOutcome {
            success: false,
            thread_id: state.thread_id.clone(),
            response: FATAL_RESPONSE.to_string(),
            metadata: json!({
                "model": self.model.model_name(),
                "error": state.error,
                "error_step": error_step,
                "tool_calls_used": [],
                "confidence": FATAL_CONFIDENCE,
                "processing_time": state.processing_time(),
                "llm_calls_count": state.llm_calls_count,
                "cached": false,
            }),
        }
    }

    async fn build_state(
        &self,
        thread_id: &str,
        user_message: &str,
        context: Option<FxHashMap<String, Value>>,
    ) -> ConversationState {
        let mut builder = ConversationState::builder(thread_id, user_message);

        if let Some(checkpointer) = &self.checkpointer {
            match checkpointer.get(thread_id, None).await {
                Ok(Some(record)) => {
                    debug!(
                        checkpoint_id = record.checkpoint_id,
                        "restoring thread history"
                    );
                    builder = builder.with_history(record.state.messages);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "checkpoint restore failed; starting fresh"),
            }
        }
        if let Some(context) = context {
            builder = builder.with_context(context);
        }
        match self.config.entry_mode {
            EntryMode::Simple => {
                builder = builder.with_extra(PATH_OVERRIDE_KEY, json!(RoutePath::Simple.as_str()));
            }
            EntryMode::Parallel => {
                builder =
                    builder.with_extra(PATH_OVERRIDE_KEY, json!(RoutePath::Parallel.as_str()));
            }
            EntryMode::Auto => {}
        }
        builder.build()
    }

    /// Step the workflow, consulting the cache once the tool plan is known.
    /// Returns whether a cached response short-circuited execution.
    async fn run_workflow(
        &self,
        state: &mut ConversationState,
        events: flume::Sender<StageEvent>,
    ) -> Result<bool, crate::graph::WorkflowRunError> {
        let mut current = self.workflow.entry().clone();
        while current != StageKind::End {
            let update = self
                .workflow
                .run_stage(&current, state.snapshot(), events.clone())
                .await?;
            state.apply(update);

            if current == StageKind::Decide {
                if let Some(payload) = self.cache_lookup(state).await {
                    self.apply_cached(state, payload);
                    return Ok(true);
                }
            }

            current = self
                .workflow
                .successor(&current, &state.snapshot())
                .unwrap_or(StageKind::End);
        }
        Ok(false)
    }

    fn cache_key(&self, state: &ConversationState) -> String {
        let entities: Vec<String> = state.entities.iter().map(|e| e.text.clone()).collect();
        let tools: Vec<String> = state.tool_calls.iter().map(|c| c.tool_name.clone()).collect();
        response_key(&self.config.phase, &state.user_message, &entities, &tools)
    }

    async fn cache_lookup(&self, state: &ConversationState) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        let payload = cache.get(&self.cache_key(state)).await?;
        payload.get("response")?.as_str()?;
        Some(payload)
    }

    fn apply_cached(&self, state: &mut ConversationState, payload: Value) {
        let response = payload
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        state.apply(crate::stage::StageUpdate {
            response: Some(response.clone()),
            messages: Some(vec![crate::message::Message::assistant(&response)]),
            confidence: payload.get("confidence").and_then(Value::as_f64),
            reasoning: payload
                .get("reasoning")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..crate::stage::StageUpdate::default()
        });
    }

    async fn complete(&self, state: ConversationState, cache_hit: bool) -> ProcessOutcome {
        let response = state
            .response
            .clone()
            .unwrap_or_else(|| FATAL_RESPONSE.to_string());

        if let Some(checkpointer) = &self.checkpointer {
            let metadata = json!({
                "path": state.route.map(|r| r.as_str()),
                "cached": cache_hit,
                "revision": state.revision,
            });
            if let Err(err) = checkpointer.put(&state.thread_id, &state, metadata).await {
                warn!(error = %err, "checkpoint write failed");
            }
        }

        if !cache_hit {
            if let Some(cache) = &self.cache {
                let payload = json!({
                    "response": response,
                    "confidence": state.confidence,
                    "reasoning": state.reasoning,
                });
                let tags = vec![format!("thread:{}", state.thread_id), "responses".to_string()];
                cache.set(&self.cache_key(&state), payload, tags).await;
            }
        }

        self.record_metric(&state, true, cache_hit, None);

        let metadata = json!({
            "model": self.model.model_name(),
            "tool_calls_used": state
                .tool_calls
                .iter()
                .map(|c| c.tool_name.clone())
                .collect::<Vec<_>>(),
            "tool_results": state.tool_results,
            "reasoning": state.reasoning,
            "processing_time": state.processing_time(),
            "llm_calls_count": state.llm_calls_count,
            "confidence": state.confidence,
            "requires_clarification": state.requires_clarification,
            "suggested_follow_up": state.suggested_follow_up,
            "escalation_needed": state.escalation_needed,
            "escalation_reason": state.escalation_reason,
            "entities_extracted": state.entities,
            "path_taken": state.route.map(|r| r.as_str()),
            "cached": cache_hit,
            "faults": state.faults,
        });

        ProcessOutcome {
            success: true,
            thread_id: state.thread_id,
            response,
            metadata,
        }
    }

    fn record_metric(
        &self,
        state: &ConversationState,
        success: bool,
        cache_hit: bool,
        error_kind: Option<String>,
    ) {
        self.monitor.record(PerformanceMetric {
            thread_id: state.thread_id.clone(),
            path: state.route,
            phase: self.config.phase.clone(),
            success,
            latency_secs: state.processing_time(),
            llm_calls: state.llm_calls_count,
            tools_used: state
                .tool_calls
                .iter()
                .map(|c| c.tool_name.clone())
                .collect(),
            cache_hit,
            error_kind,
            recorded_at: Utc::now(),
        });
    }

    /// Snapshot of component health for operational endpoints.
    pub async fn system_health(&self) -> Value {
        let checkpoint = match &self.checkpointer {
            Some(cp) => match cp.stats().await {
                Ok(stats) => json!({
                    "enabled": true,
                    "degraded": cp.is_degraded(),
                    "threads": stats.threads,
                    "checkpoints": stats.checkpoints,
                    "writes": stats.writes,
                }),
                Err(err) => json!({ "enabled": true, "error": err.to_string() }),
            },
            None => json!({ "enabled": false }),
        };
        let cache = match &self.cache {
            Some(cache) => {
                let stats = cache.stats();
                json!({
                    "enabled": true,
                    "degraded": stats.degraded,
                    "entries": stats.entries,
                    "hit_rate": stats.hit_rate,
                    "evictions": stats.evictions,
                })
            }
            None => json!({ "enabled": false }),
        };
        let stats = self.monitor.stats(Duration::hours(1));
        json!({
            "checkpointer": checkpoint,
            "cache": cache,
            "last_hour": {
                "requests": stats.total_requests,
                "success_rate": stats.success_rate,
                "avg_latency": stats.avg_latency,
                "p95_latency": stats.p95_latency,
                "cache_hit_rate": stats.cache_hit_rate,
            },
            "recommendations": self.monitor.recommendations(),
        })
    }

    /// Sweep expired cache entries and old checkpoints.
    pub async fn run_maintenance(&self, max_age: Duration) -> Result<Value, CheckpointerError> {
        let cache_swept = self.cache.as_ref().map(|c| c.sweep_expired()).unwrap_or(0);
        let checkpoints_removed = match &self.checkpointer {
            Some(cp) => cp.sweep(max_age).await?,
            None => 0,
        };
        Ok(json!({
            "cache_entries_swept": cache_swept,
            "checkpoints_removed": checkpoints_removed,
        }))
    }

    /// Spawn the cache sweeper and trend checker. Handles end when the
    /// assistant's shared components are dropped.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(cache) = &self.cache {
            handles.push(cache.spawn_sweeper(SWEEP_INTERVAL));
        }
        handles.push(self.monitor.spawn_trend_task(StdDuration::from_secs(300)));
        handles
    }
}
