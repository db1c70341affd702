//! Workflow graph: stages wired with static and conditional edges.
//!
//! A [`WorkflowBuilder`] collects stages and edges and compiles them into an
//! immutable [`Workflow`]. The virtual [`StageKind::Start`] and
//! [`StageKind::End`] endpoints carry no stage implementation; registering
//! one for them is ignored with a warning. Every interior stage must have
//! exactly one successor, static or conditional, so a compiled workflow can
//! be stepped deterministically from the outside.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::stage::{Stage, StageContext, StageError, StageEvent, StageUpdate};
use crate::state::{ConversationState, StateSnapshot};
use crate::types::StageKind;

/// Predicate deciding the next stage from the current snapshot.
pub type EdgePredicate = Arc<dyn Fn(&StateSnapshot) -> StageKind + Send + Sync>;

enum Edge {
    Static(StageKind),
    Conditional(EdgePredicate),
}

/// Errors raised while compiling or running a workflow.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    #[error("stage {kind} has no registered implementation")]
    #[diagnostic(
        code(shopgraph::graph::missing_stage),
        help("call add_stage for every stage referenced by an edge")
    )]
    MissingStage { kind: StageKind },

    #[error("stage {kind} has no outgoing edge")]
    #[diagnostic(
        code(shopgraph::graph::missing_edge),
        help("every stage except End needs exactly one successor")
    )]
    MissingEdge { kind: StageKind },

    #[error("stage {kind} has more than one outgoing edge")]
    #[diagnostic(code(shopgraph::graph::ambiguous_edge))]
    AmbiguousEdge { kind: StageKind },

    #[error("workflow has no edge out of Start")]
    #[diagnostic(code(shopgraph::graph::no_entry))]
    NoEntry,
}

/// Error from running one stage, tagged with the stage it came from.
#[derive(Debug, Error, Diagnostic)]
#[error("stage {stage} failed")]
pub struct WorkflowRunError {
    pub stage: StageKind,
    #[source]
    #[diagnostic_source]
    pub source: StageError,
}

/// Fluent builder for a [`Workflow`].
#[derive(Default)]
pub struct WorkflowBuilder {
    stages: FxHashMap<StageKind, Arc<dyn Stage>>,
    edges: FxHashMap<StageKind, Vec<Edge>>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage implementation. Start and End are virtual and any
    /// implementation registered for them is dropped.
    pub fn add_stage(mut self, kind: StageKind, stage: Arc<dyn Stage>) -> Self {
        if matches!(kind, StageKind::Start | StageKind::End) {
            warn!(stage = %kind, "ignoring stage registered for virtual endpoint");
            return self;
        }
        self.stages.insert(kind, stage);
        self
    }

    /// Add a static edge.
    pub fn add_edge(mut self, from: StageKind, to: StageKind) -> Self {
        self.edges.entry(from).or_default().push(Edge::Static(to));
        self
    }

    /// Add a conditional edge resolved at step time from the snapshot.
    pub fn add_conditional_edge(mut self, from: StageKind, predicate: EdgePredicate) -> Self {
        self.edges
            .entry(from)
            .or_default()
            .push(Edge::Conditional(predicate));
        self
    }

    /// Validate the graph and produce an immutable workflow.
    pub fn compile(self) -> Result<Workflow, WorkflowError> {
        let entry = match self.edges.get(&StageKind::Start) {
            Some(edges) if edges.len() == 1 => match &edges[0] {
                Edge::Static(to) => to.clone(),
                Edge::Conditional(_) => {
                    return Err(WorkflowError::AmbiguousEdge {
                        kind: StageKind::Start,
                    });
                }
            },
            Some(_) => {
                return Err(WorkflowError::AmbiguousEdge {
                    kind: StageKind::Start,
                });
            }
            None => return Err(WorkflowError::NoEntry),
        };

        for (from, edges) in &self.edges {
            if edges.len() != 1 {
                return Err(WorkflowError::AmbiguousEdge { kind: from.clone() });
            }
            if let Edge::Static(to) = &edges[0] {
                if *to != StageKind::End && !self.stages.contains_key(to) {
                    return Err(WorkflowError::MissingStage { kind: to.clone() });
                }
            }
        }

        for kind in self.stages.keys() {
            if !self.edges.contains_key(kind) {
                return Err(WorkflowError::MissingEdge { kind: kind.clone() });
            }
        }

        if !self.stages.contains_key(&entry) && entry != StageKind::End {
            return Err(WorkflowError::MissingStage { kind: entry });
        }

        Ok(Workflow {
            stages: self.stages,
            edges: self.edges,
            entry,
        })
    }
}

/// Compiled stage graph with a stepping API.
pub struct Workflow {
    stages: FxHashMap<StageKind, Arc<dyn Stage>>,
    edges: FxHashMap<StageKind, Vec<Edge>>,
    entry: StageKind,
}

impl Workflow {
    /// First real stage after Start.
    pub fn entry(&self) -> &StageKind {
        &self.entry
    }

    /// Resolve the successor of `kind` against the given snapshot.
    pub fn successor(&self, kind: &StageKind, snapshot: &StateSnapshot) -> Option<StageKind> {
        match self.edges.get(kind)?.first()? {
            Edge::Static(to) => Some(to.clone()),
            Edge::Conditional(predicate) => Some(predicate(snapshot)),
        }
    }

    /// Run a single stage against the snapshot and return its update.
    #[instrument(skip(self, snapshot, events), fields(stage = %kind))]
    pub async fn run_stage(
        &self,
        kind: &StageKind,
        snapshot: StateSnapshot,
        events: flume::Sender<StageEvent>,
    ) -> Result<StageUpdate, WorkflowRunError> {
        let stage = self
            .stages
            .get(kind)
            .ok_or_else(|| WorkflowRunError {
                stage: kind.clone(),
                source: StageError::MissingInput {
                    what: "stage implementation",
                },
            })?;
        let ctx = StageContext::new(kind.encode(), snapshot.thread_id.clone(), events);
        stage
            .run(snapshot, ctx)
            .await
            .map_err(|source| WorkflowRunError {
                stage: kind.clone(),
                source,
            })
    }

    /// Drive the workflow from Start to End, applying each update in turn.
    /// Callers that need to intervene between stages use [`Self::entry`],
    /// [`Self::successor`] and [`Self::run_stage`] directly.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        events: flume::Sender<StageEvent>,
    ) -> Result<(), WorkflowRunError> {
        let mut current = self.entry.clone();
        while current != StageKind::End {
            let update = self
                .run_stage(&current, state.snapshot(), events.clone())
                .await?;
            state.apply(update);
            current = self
                .successor(&current, &state.snapshot())
                .unwrap_or(StageKind::End);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Tag(&'static str);

    #[async_trait]
    impl Stage for Tag {
        async fn run(
            &self,
            _snapshot: StateSnapshot,
            _ctx: StageContext,
        ) -> Result<StageUpdate, StageError> {
            Ok(StageUpdate::new().with_reasoning(self.0))
        }
    }

    fn events() -> flume::Sender<StageEvent> {
        flume::unbounded().0
    }

    #[test]
    fn compile_rejects_missing_entry() {
        let err = WorkflowBuilder::new()
            .add_stage(StageKind::Routing, Arc::new(Tag("r")))
            .add_edge(StageKind::Routing, StageKind::End)
            .compile()
            .err()
            .expect("compiling without a start edge should fail");
        assert!(matches!(err, WorkflowError::NoEntry));
    }

    #[test]
    fn compile_rejects_dangling_edge_target() {
        let err = WorkflowBuilder::new()
            .add_edge(StageKind::Start, StageKind::Routing)
            .compile()
            .err()
            .expect("compiling with an unregistered edge target should fail");
        assert!(matches!(err, WorkflowError::MissingStage { .. }));
    }

    #[test]
    fn virtual_endpoints_ignore_stage_registration() {
        let workflow = WorkflowBuilder::new()
            .add_stage(StageKind::Start, Arc::new(Tag("nope")))
            .add_stage(StageKind::Routing, Arc::new(Tag("r")))
            .add_edge(StageKind::Start, StageKind::Routing)
            .add_edge(StageKind::Routing, StageKind::End)
            .compile()
            .unwrap();
        assert_eq!(workflow.entry(), &StageKind::Routing);
    }

    #[tokio::test]
    async fn run_walks_to_end() {
        let workflow = WorkflowBuilder::new()
            .add_stage(StageKind::Routing, Arc::new(Tag("routed")))
            .add_edge(StageKind::Start, StageKind::Routing)
            .add_edge(StageKind::Routing, StageKind::End)
            .compile()
            .unwrap();
        let mut state = ConversationState::new("t1", "hello");
        workflow.run(&mut state, events()).await.unwrap();
        assert_eq!(state.reasoning.as_deref(), Some("routed"));
        assert_eq!(state.revision, 1);
    }

    #[tokio::test]
    async fn conditional_edge_resolves_from_snapshot() {
        let predicate: EdgePredicate = Arc::new(|snap: &StateSnapshot| {
            if snap.user_message.contains("deep") {
                StageKind::ParallelExtract
            } else {
                StageKind::SimpleExtract
            }
        });
        let workflow = WorkflowBuilder::new()
            .add_stage(StageKind::Routing, Arc::new(Tag("r")))
            .add_stage(StageKind::SimpleExtract, Arc::new(Tag("simple")))
            .add_stage(StageKind::ParallelExtract, Arc::new(Tag("parallel")))
            .add_edge(StageKind::Start, StageKind::Routing)
            .add_conditional_edge(StageKind::Routing, predicate)
            .add_edge(StageKind::SimpleExtract, StageKind::End)
            .add_edge(StageKind::ParallelExtract, StageKind::End)
            .compile()
            .unwrap();

        let mut state = ConversationState::new("t1", "a deep question");
        workflow.run(&mut state, events()).await.unwrap();
        assert_eq!(state.reasoning.as_deref(), Some("parallel"));
    }
}
