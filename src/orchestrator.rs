//! The orchestration loop.
//!
//! One call to [`Orchestrator::process`] runs one cycle:
//!
//! 1. RECEIVED: accept the query
//! 2. CONTEXT_RETRIEVED: rank memory against the query
//! 3. DECIDED: ask the [`Reasoner`] which skills to run
//! 4. EXECUTING: invoke the chosen skills through the [`SkillRegistry`]
//! 5. MEMORY_UPDATED: write event and record nodes in one atomic batch
//! 6. RESPONDED: produce the response text
//!
//! Any step may fail into ERRORED. Cycles on one orchestrator are serialized.
//! Cancellation is checked at every suspension point, and a cycle cancelled
//! before its commit leaves the graph untouched.

mod cancel;
mod events;

pub use cancel::CancelToken;
pub use events::{CycleEvent, CycleState, EventBus};

use crate::error::{Error, ErrorKind, Result};
use crate::memory::{ContextWindow, MemoryGraph, Node, NodeId, NodeKind, Relation};
use crate::reasoning::{Decision, Reasoner, SkillInvocation};
use crate::skills::{ExecutionResult, SkillContext, SkillRegistry};
use crate::storage::{Storage, WriteOp};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, field, info, instrument, warn, Span};
use uuid::Uuid;

/// Storage prefix for per-cycle execution logs.
pub const EXECUTION_LOG_PREFIX: &str = "executions/";

/// Configuration for the orchestration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum nodes in a context window
    pub max_context_nodes: usize,
    /// Reasoner deadline in milliseconds
    pub reasoner_timeout_ms: u64,
    /// Per-skill deadline; `None` uses the registry default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_timeout_ms: Option<u64>,
    /// Upper bound on skills running at once
    pub max_concurrent_skills: usize,
    /// Store each query as a `context` node referencing its context window
    pub record_queries: bool,
    /// Save the graph after every successful cycle
    pub autosave: bool,
    /// Write every execution result under `executions/<time>-<cycle>/<n>`
    pub log_executions: bool,
    /// Logged cycles kept in storage, oldest dropped first; `None` keeps all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_logged_cycles: Option<usize>,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    /// Importance of event nodes
    pub event_importance: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_context_nodes: 10,
            reasoner_timeout_ms: 60_000,
            skill_timeout_ms: None,
            max_concurrent_skills: 4,
            record_queries: false,
            autosave: false,
            log_executions: false,
            max_logged_cycles: Some(100),
            event_capacity: 256,
            event_importance: 0.5,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_context_nodes(mut self, n: usize) -> Self {
        self.max_context_nodes = n;
        self
    }

    pub fn with_reasoner_timeout_ms(mut self, ms: u64) -> Self {
        self.reasoner_timeout_ms = ms;
        self
    }

    pub fn with_skill_timeout_ms(mut self, ms: u64) -> Self {
        self.skill_timeout_ms = Some(ms);
        self
    }

    pub fn with_max_concurrent_skills(mut self, n: usize) -> Self {
        self.max_concurrent_skills = n.max(1);
        self
    }

    pub fn with_query_recording(mut self, enabled: bool) -> Self {
        self.record_queries = enabled;
        self
    }

    pub fn with_autosave(mut self, enabled: bool) -> Self {
        self.autosave = enabled;
        self
    }

    pub fn with_execution_log(mut self, enabled: bool) -> Self {
        self.log_executions = enabled;
        self
    }

    pub fn with_max_logged_cycles(mut self, max: Option<usize>) -> Self {
        self.max_logged_cycles = max;
        self
    }
}

/// Outcome of a successful cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResponse {
    pub cycle_id: Uuid,
    pub query: String,
    /// Text for the user
    pub response: String,
    pub decision: Decision,
    /// One result per invocation, in decision order
    pub results: Vec<ExecutionResult>,
    /// Nodes that formed the context window
    pub context: Vec<NodeId>,
    /// Event node per result, in result order
    pub event_nodes: Vec<NodeId>,
    /// Nodes created from skill records
    pub record_nodes: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_node: Option<NodeId>,
    pub transitions: Vec<CycleState>,
    pub duration_ms: u64,
}

impl CycleResponse {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// A cycle that ended in ERRORED.
#[derive(Debug, thiserror::Error)]
#[error("Cycle {cycle_id} failed after {state}: {message}")]
pub struct CycleError {
    pub cycle_id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    /// Last state reached before the failure
    pub state: CycleState,
    pub transitions: Vec<CycleState>,
    #[source]
    pub source: Error,
}

impl CycleError {
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// What a cycle keeps for the next one.
#[derive(Debug, Default)]
struct CycleMemory {
    last_event: Option<NodeId>,
}

/// Records transitions and publishes them.
struct CycleTracker<'a> {
    cycle_id: Uuid,
    state: CycleState,
    transitions: Vec<CycleState>,
    events: &'a EventBus,
}

impl<'a> CycleTracker<'a> {
    fn start(cycle_id: Uuid, query: &str, events: &'a EventBus) -> Self {
        let tracker = Self {
            cycle_id,
            state: CycleState::Received,
            transitions: vec![CycleState::Received],
            events,
        };
        tracker.emit(CycleEvent::new(cycle_id, CycleState::Received, query));
        tracker
    }

    fn advance(&mut self, next: CycleState, content: impl Into<String>) {
        self.advance_with(next, CycleEvent::new(self.cycle_id, next, content));
    }

    fn advance_with(&mut self, next: CycleState, event: CycleEvent) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(cycle_id = %self.cycle_id, from = %self.state, to = %next, "Cycle transition");
        self.state = next;
        self.transitions.push(next);
        self.emit(event);
    }

    fn fail(mut self, err: Error) -> CycleError {
        let state = self.state;
        let message = err.to_string();
        let event = CycleEvent::new(self.cycle_id, CycleState::Errored, message.clone())
            .with_metadata("kind", serde_json::to_value(err.kind()).unwrap_or_default())
            .with_metadata("state", state.as_str());
        self.advance_with(CycleState::Errored, event);
        CycleError {
            cycle_id: self.cycle_id,
            kind: err.kind(),
            message,
            state,
            transitions: self.transitions,
            source: err,
        }
    }

    fn emit(&self, event: CycleEvent) {
        self.events.emit(event);
    }
}

/// Ties retrieval, reasoning, skill execution and memory updates together.
pub struct Orchestrator {
    graph: Arc<MemoryGraph>,
    registry: Arc<SkillRegistry>,
    reasoner: Arc<dyn Reasoner>,
    storage: Option<Arc<dyn Storage>>,
    config: OrchestratorConfig,
    cycle: Mutex<CycleMemory>,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<MemoryGraph>,
        registry: Arc<SkillRegistry>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            graph,
            registry,
            reasoner,
            storage: None,
            events: EventBus::new(config.event_capacity),
            config,
            cycle: Mutex::new(CycleMemory::default()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.events = EventBus::new(config.event_capacity);
        self.config = config;
        self
    }

    /// Storage used for autosave and execution logs.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<MemoryGraph> {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    /// Follow every cycle transition.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.events.subscribe()
    }

    /// Run one cycle to completion.
    pub async fn process(&self, query: &str) -> std::result::Result<CycleResponse, CycleError> {
        self.process_with_cancel(query, &CancelToken::new()).await
    }

    /// Run one cycle, giving up when `cancel` fires.
    #[instrument(skip(self, query, cancel), fields(cycle_id = field::Empty, query_len = query.len()))]
    pub async fn process_with_cancel(
        &self,
        query: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<CycleResponse, CycleError> {
        let cycle_id = Uuid::new_v4();
        Span::current().record("cycle_id", field::display(cycle_id));
        let start = Instant::now();
        let mut tracker = CycleTracker::start(cycle_id, query, &self.events);

        let mut memory = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(tracker.fail(Error::Cancelled)),
            guard = self.cycle.lock() => guard,
        };

        match self.run_cycle(query, cancel, &mut tracker, &mut memory).await {
            Ok(mut response) => {
                response.transitions = tracker.transitions;
                response.duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    results = response.results.len(),
                    duration_ms = response.duration_ms,
                    "Cycle responded"
                );
                Ok(response)
            }
            Err(err) => {
                let err = tracker.fail(err);
                warn!(state = %err.state, kind = ?err.kind, error = %err.message, "Cycle errored");
                Err(err)
            }
        }
    }

    async fn run_cycle(
        &self,
        query: &str,
        cancel: &CancelToken,
        tracker: &mut CycleTracker<'_>,
        memory: &mut CycleMemory,
    ) -> Result<CycleResponse> {
        let cycle_id = tracker.cycle_id;
        check_cancelled(cancel)?;

        let window = self
            .graph
            .retrieve_context(query, self.config.max_context_nodes)?;
        tracker.advance(
            CycleState::ContextRetrieved,
            format!("{} context nodes", window.len()),
        );

        let context: Vec<Node> = window.nodes().cloned().collect();
        let decision = self.decide(query, &context, cancel).await?;
        let mut decided = CycleEvent::new(
            cycle_id,
            CycleState::Decided,
            format!("{} skill invocations", decision.invocations.len()),
        )
        .with_metadata("sequential", decision.sequential);
        if let Some(intent) = &decision.intent {
            decided = decided.with_metadata("intent", intent.clone());
        }
        tracker.advance_with(CycleState::Decided, decided);

        tracker.advance(
            CycleState::Executing,
            decision
                .invocations
                .iter()
                .map(|i| i.skill.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
        let ctx = SkillContext::new(query)
            .with_cycle(cycle_id)
            .with_context(context)
            .with_now(self.graph.now());
        let results = self.execute(&decision, &ctx, cancel).await?;

        // Last point at which cancellation leaves memory untouched
        check_cancelled(cancel)?;
        let written = self.write_memory(cycle_id, query, &window, &results, memory)?;
        tracker.advance(
            CycleState::MemoryUpdated,
            format!(
                "{} events, {} records",
                written.event_nodes.len(),
                written.record_nodes.len()
            ),
        );

        self.persist(cycle_id, &results).await?;

        let response = compose_response(&decision, &results);
        tracker.advance(CycleState::Responded, response.clone());

        Ok(CycleResponse {
            cycle_id,
            query: query.to_string(),
            response,
            decision,
            results,
            context: window.node_ids(),
            event_nodes: written.event_nodes,
            record_nodes: written.record_nodes,
            query_node: written.query_node,
            transitions: Vec::new(),
            duration_ms: 0,
        })
    }

    async fn decide(&self, query: &str, context: &[Node], cancel: &CancelToken) -> Result<Decision> {
        let skills = self.registry.descriptors(true);
        let deadline = Duration::from_millis(self.config.reasoner_timeout_ms);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = tokio::time::timeout(deadline, self.reasoner.reason(query, context, &skills)) => outcome,
        };
        match outcome {
            Ok(Ok(decision)) => {
                debug!(
                    invocations = decision.invocations.len(),
                    sequential = decision.sequential,
                    "Reasoner decided"
                );
                Ok(decision)
            }
            Ok(Err(err)) => Err(match err {
                Error::ReasoningFailure(_) | Error::Cancelled => err,
                other => Error::ReasoningFailure(other.to_string()),
            }),
            Err(_) => Err(Error::ReasoningFailure(format!(
                "reasoner timed out after {}ms",
                self.config.reasoner_timeout_ms
            ))),
        }
    }

    /// Run every invocation; results keep decision order.
    async fn execute(
        &self,
        decision: &Decision,
        ctx: &SkillContext,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionResult>> {
        if decision.invocations.is_empty() {
            return Ok(Vec::new());
        }

        let run = async {
            if decision.sequential {
                let mut results = Vec::with_capacity(decision.invocations.len());
                for invocation in &decision.invocations {
                    results.push(self.invoke(invocation, ctx).await);
                }
                results
            } else {
                let semaphore = Semaphore::new(self.config.max_concurrent_skills.max(1));
                let semaphore = &semaphore;
                join_all(decision.invocations.iter().map(|invocation| async move {
                    // The semaphore is never closed
                    let _permit = semaphore.acquire().await.ok();
                    self.invoke(invocation, ctx).await
                }))
                .await
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            results = run => Ok(results),
        }
    }

    async fn invoke(&self, invocation: &SkillInvocation, ctx: &SkillContext) -> ExecutionResult {
        let timeout = invocation
            .timeout_ms
            .or(self.config.skill_timeout_ms)
            .map(Duration::from_millis);
        match self
            .registry
            .invoke_with_timeout(&invocation.skill, ctx, &invocation.params, timeout)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(skill = %invocation.skill, error = %err, "Skill not invoked");
                ExecutionResult::failed(&invocation.skill, &err, 0)
            }
        }
    }

    /// Stage events, records and touches and commit them as one batch.
    fn write_memory(
        &self,
        cycle_id: Uuid,
        query: &str,
        window: &ContextWindow,
        results: &[ExecutionResult],
        memory: &mut CycleMemory,
    ) -> Result<WrittenNodes> {
        let now = self.graph.now();
        let default_importance = self.graph.config().default_importance;
        let context_ids = window.node_ids();
        let mut batch = self.graph.batch();
        let mut written = WrittenNodes::default();

        if self.config.record_queries {
            let query_node = batch.push_node(
                Node::new(NodeKind::Context, query, default_importance, now)
                    .with_metadata("cycle_id", cycle_id.to_string()),
            );
            for id in &context_ids {
                batch.add_edge(query_node, *id, Relation::References, 1.0);
            }
            written.query_node = Some(query_node);
        }

        let mut previous = memory.last_event.filter(|id| self.graph.contains(id));
        for result in results {
            let mut event = Node::new(
                NodeKind::Event,
                result.summary(),
                self.config.event_importance,
                now,
            )
            .with_metadata("skill", result.skill.clone())
            .with_metadata("success", result.success)
            .with_metadata("cycle_id", cycle_id.to_string())
            .with_metadata("duration_ms", result.duration_ms);
            if let Some(error) = &result.error {
                event = event.with_metadata("error", error.clone());
            }
            let event_id = batch.push_node(event);

            for id in &context_ids {
                batch.add_edge(event_id, *id, Relation::CausedBy, 1.0);
            }
            for draft in &result.records {
                let mut record = Node::new(
                    draft.kind,
                    draft.content.clone(),
                    draft.importance.unwrap_or(default_importance),
                    now,
                );
                record.metadata = draft.metadata.clone();
                let record_id = batch.push_node(record);
                batch.add_edge(event_id, record_id, Relation::CausedBy, 1.0);
                written.record_nodes.push(record_id);
            }
            if let Some(previous) = previous {
                batch.add_edge(previous, event_id, Relation::FollowedBy, 1.0);
            }
            previous = Some(event_id);
            written.event_nodes.push(event_id);
        }

        for id in context_ids {
            batch.touch(id);
        }

        if !batch.is_empty() {
            self.graph.commit(batch)?;
        }
        if let Some(last) = written.event_nodes.last() {
            memory.last_event = Some(*last);
        }
        Ok(written)
    }

    /// Execution log and autosave.
    async fn persist(&self, cycle_id: Uuid, results: &[ExecutionResult]) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        if self.config.log_executions {
            self.log_executions(storage.as_ref(), cycle_id, results)
                .await
                .map_err(|e| Error::persistence(format!("Failed to log execution: {}", e)))?;
        }
        if self.config.autosave {
            let meta = self.graph.save(storage.as_ref()).await?;
            debug!(nodes = meta.node_count, edges = meta.edge_count, "Autosaved graph");
        }
        Ok(())
    }
}

impl Orchestrator {
    /// Write this cycle's results and drop the oldest logged cycles past the
    /// cap, in one batch.
    async fn log_executions(
        &self,
        storage: &dyn Storage,
        cycle_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<()> {
        // Timestamp first so keys sort by cycle age
        let dir = format!(
            "{}{}-{}",
            EXECUTION_LOG_PREFIX,
            self.graph.now().format("%Y%m%dT%H%M%S%.6fZ"),
            cycle_id
        );
        let mut ops = Vec::with_capacity(results.len());
        for (index, result) in results.iter().enumerate() {
            ops.push(WriteOp::put(
                format!("{}/{:03}", dir, index),
                serde_json::to_vec(result)?,
            ));
        }

        if let Some(max) = self.config.max_logged_cycles {
            let keys = storage.list_keys(EXECUTION_LOG_PREFIX).await?;
            let mut cycles: Vec<&str> = keys.iter().filter_map(|k| log_dir(k)).collect();
            if !results.is_empty() {
                cycles.push(&dir);
            }
            cycles.sort_unstable();
            cycles.dedup();
            if cycles.len() > max {
                let expired = &cycles[..cycles.len() - max];
                let stale = keys
                    .iter()
                    .filter(|k| log_dir(k).is_some_and(|d| expired.binary_search(&d).is_ok()));
                for key in stale {
                    ops.push(WriteOp::delete(key.clone()));
                }
                debug!(expired = expired.len(), "Trimming execution log");
            }
        }

        if ops.is_empty() {
            return Ok(());
        }
        storage.apply(ops).await
    }
}

/// `executions/<time>-<cycle>` part of a log key.
fn log_dir(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(EXECUTION_LOG_PREFIX)?;
    let end = rest.find('/')?;
    Some(&key[..EXECUTION_LOG_PREFIX.len() + end])
}

#[derive(Debug, Default)]
struct WrittenNodes {
    event_nodes: Vec<NodeId>,
    record_nodes: Vec<NodeId>,
    query_node: Option<NodeId>,
}

fn check_cancelled(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// The reasoner's text wins; otherwise summarize what ran.
fn compose_response(decision: &Decision, results: &[ExecutionResult]) -> String {
    if let Some(response) = &decision.response {
        return response.clone();
    }
    if results.is_empty() {
        return "No action was needed.".to_string();
    }
    results
        .iter()
        .map(ExecutionResult::summary)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EdgeKey, ManualClock};
    use crate::skills::builtin::register_builtins;
    use crate::skills::{
        ParamType, ParameterSpec, Params, Skill, SkillDescriptor, SkillOutput,
    };
    use crate::storage::{read_json, MemoryStorage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Reasoner backed by a closure over the query and context.
    struct FnReasoner<F>(F);

    #[async_trait]
    impl<F> Reasoner for FnReasoner<F>
    where
        F: Fn(&str, &[Node]) -> Result<Decision> + Send + Sync,
    {
        async fn reason(
            &self,
            query: &str,
            context: &[Node],
            _skills: &[crate::skills::SkillDescriptor],
        ) -> Result<Decision> {
            (self.0)(query, context)
        }
    }

    fn reasoner<F>(f: F) -> Arc<dyn Reasoner>
    where
        F: Fn(&str, &[Node]) -> Result<Decision> + Send + Sync + 'static,
    {
        Arc::new(FnReasoner(f))
    }

    fn fixed(decision: Decision) -> Arc<dyn Reasoner> {
        reasoner(move |_, _| Ok(decision.clone()))
    }

    struct SlowReasoner(Duration);

    #[async_trait]
    impl Reasoner for SlowReasoner {
        async fn reason(&self, _: &str, _: &[Node], _: &[SkillDescriptor]) -> Result<Decision> {
            tokio::time::sleep(self.0).await;
            Ok(Decision::respond("too late"))
        }
    }

    /// Sleeps, then appends its name to a shared log.
    struct Recorder {
        descriptor: SkillDescriptor,
        delay: Duration,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Skill for Recorder {
        fn descriptor(&self) -> &SkillDescriptor {
            &self.descriptor
        }

        async fn execute(&self, _ctx: &SkillContext, _params: Params) -> Result<SkillOutput> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.lock().unwrap().push(self.descriptor.name.clone());
            Ok(SkillOutput::new(json!(self.descriptor.name)))
        }
    }

    fn recorder(name: &str, delay_ms: u64, log: &Arc<StdMutex<Vec<String>>>) -> Arc<dyn Skill> {
        Arc::new(Recorder {
            descriptor: SkillDescriptor::new(name, "records its run")
                .with_parameter(ParameterSpec::new("note", ParamType::String).optional()),
            delay: Duration::from_millis(delay_ms),
            log: Arc::clone(log),
        })
    }

    fn setup(reasoner: Arc<dyn Reasoner>) -> Orchestrator {
        let registry = SkillRegistry::new();
        register_builtins(&registry).unwrap();
        Orchestrator::new(
            Arc::new(MemoryGraph::new()),
            Arc::new(registry),
            reasoner,
        )
    }

    fn create_task(title: &str, due: &str) -> SkillInvocation {
        SkillInvocation::new("create_task", json!({"title": title, "due": due}))
    }

    const ALL_STATES: [CycleState; 6] = [
        CycleState::Received,
        CycleState::ContextRetrieved,
        CycleState::Decided,
        CycleState::Executing,
        CycleState::MemoryUpdated,
        CycleState::Responded,
    ];

    #[tokio::test]
    async fn test_create_task_cycle() {
        let orchestrator = setup(fixed(
            Decision::default().with_invocation(create_task("call John", "tomorrow")),
        ));

        let response = orchestrator
            .process("remind me to call John tomorrow")
            .await
            .unwrap();

        assert_eq!(response.transitions, ALL_STATES.to_vec());
        assert_eq!(response.results.len(), 1);
        assert!(response.all_succeeded());
        assert_eq!(response.response, "create_task succeeded: created task 'call John'");

        let graph = orchestrator.graph();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);

        let task_id = response.record_nodes[0];
        let task = graph.get_node(&task_id).unwrap().unwrap();
        assert_eq!(task.kind, NodeKind::Task);
        assert_eq!(task.content, "call John");
        assert_eq!(task.metadata.get("due"), Some(&json!("tomorrow")));

        let event_id = response.event_nodes[0];
        let event = graph.get_node(&event_id).unwrap().unwrap();
        assert_eq!(event.kind, NodeKind::Event);
        assert_eq!(event.metadata.get("skill"), Some(&json!("create_task")));
        let key = EdgeKey::new(event_id, task_id, Relation::CausedBy);
        assert!(graph.get_edge(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_context_nodes_are_linked_and_touched() {
        let orchestrator = setup(fixed(
            Decision::default().with_invocation(create_task("call John", "tomorrow")),
        ));
        let graph = Arc::clone(orchestrator.graph());
        let john = graph.add_node(NodeKind::Entity, "John is my brother").unwrap();

        let response = orchestrator
            .process("remind me to call John tomorrow")
            .await
            .unwrap();

        assert_eq!(response.context, vec![john]);
        let event_id = response.event_nodes[0];
        let key = EdgeKey::new(event_id, john, Relation::CausedBy);
        assert!(graph.get_edge(&key).unwrap().is_some());
        // Edge creation touches once, the explicit context touch is merged into it
        assert_eq!(graph.get_node(&john).unwrap().unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_failing_sibling_does_not_block_others() {
        let orchestrator = setup(fixed(
            Decision::default()
                .with_invocation(create_task("call John", "tomorrow"))
                .with_invocation(SkillInvocation::new("send_email", json!({})))
                .with_invocation(SkillInvocation::new("create_task", json!({"due": "friday"})))
                .with_invocation(SkillInvocation::new("current_time", json!({}))),
        ));

        let response = orchestrator.process("do several things").await.unwrap();
        let outcomes: Vec<(bool, Option<ErrorKind>)> = response
            .results
            .iter()
            .map(|r| (r.success, r.error_kind))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                (true, None),
                (false, Some(ErrorKind::NotFound)),
                (false, Some(ErrorKind::ParameterValidation)),
                (true, None),
            ]
        );

        // Four events plus the one task record
        assert_eq!(orchestrator.graph().node_count(), 5);
        assert_eq!(response.record_nodes.len(), 1);
        assert!(response.response.contains("send_email failed"));
    }

    #[tokio::test]
    async fn test_disabled_skill_is_reported_not_run() {
        let orchestrator = setup(fixed(
            Decision::default().with_invocation(create_task("call John", "tomorrow")),
        ));
        orchestrator.registry().disable("create_task").unwrap();

        let response = orchestrator.process("remind me").await.unwrap();
        assert!(!response.results[0].success);
        assert_eq!(response.results[0].error_kind, Some(ErrorKind::NotFound));

        let nodes = orchestrator.graph().nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::Event);
        assert_eq!(nodes[0].metadata.get("success"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_malformed_decision_errors_without_running_skills() {
        let orchestrator = setup(reasoner(|_, _| {
            Err(Error::ReasoningFailure("malformed decision".into()))
        }));

        let err = orchestrator.process("hello").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReasoningFailure);
        assert_eq!(err.state, CycleState::ContextRetrieved);
        assert_eq!(err.transitions.last(), Some(&CycleState::Errored));
        assert_eq!(orchestrator.graph().node_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_error_becomes_reasoning_failure() {
        let orchestrator = setup(reasoner(|_, _| Err(Error::Internal("connection reset".into()))));
        let err = orchestrator.process("hello").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReasoningFailure);
        assert!(err.message.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reasoner_timeout() {
        let orchestrator = setup(Arc::new(SlowReasoner(Duration::from_secs(5))))
            .with_config(OrchestratorConfig::default().with_reasoner_timeout_ms(100));

        let err = orchestrator.process("hello").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReasoningFailure);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_during_execution_leaves_graph_untouched() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = setup(fixed(
            Decision::default()
                .with_invocation(create_task("call John", "tomorrow"))
                .with_invocation(SkillInvocation::new("slow", json!({}))),
        ));
        orchestrator
            .registry()
            .register(recorder("slow", 5_000, &log))
            .unwrap();
        let graph = orchestrator.graph();
        graph.add_node(NodeKind::Entity, "John").unwrap();
        let before = graph.snapshot().unwrap().digest();

        let token = CancelToken::new();
        let (outcome, _) = tokio::join!(
            orchestrator.process_with_cancel("call John", &token),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            }
        );

        let err = outcome.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.state, CycleState::Executing);
        assert_eq!(graph.snapshot().unwrap().digest(), before);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_commit_leaves_graph_untouched() {
        let token = CancelToken::new();
        let cancel_from_reasoner = token.clone();
        let orchestrator = setup(reasoner(move |_, _| {
            cancel_from_reasoner.cancel();
            Ok(Decision::default().with_invocation(create_task("call John", "tomorrow")))
        }));
        let before = orchestrator.graph().snapshot().unwrap().digest();

        let err = orchestrator
            .process_with_cancel("remind me", &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(orchestrator.graph().snapshot().unwrap().digest(), before);
    }

    #[tokio::test]
    async fn test_sequential_and_concurrent_ordering() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let decision = Decision::default()
            .with_invocation(SkillInvocation::new("slow", json!({})))
            .with_invocation(SkillInvocation::new("fast", json!({})));

        let concurrent = setup(fixed(decision.clone()));
        concurrent.registry().register(recorder("slow", 100, &log)).unwrap();
        concurrent.registry().register(recorder("fast", 0, &log)).unwrap();
        let response = concurrent.process("go").await.unwrap();
        let skills: Vec<&str> = response.results.iter().map(|r| r.skill.as_str()).collect();
        assert_eq!(skills, vec!["slow", "fast"]);
        assert_eq!(*log.lock().unwrap(), vec!["fast", "slow"]);

        log.lock().unwrap().clear();
        let sequential = setup(fixed(decision.sequential()));
        sequential.registry().register(recorder("slow", 100, &log)).unwrap();
        sequential.registry().register(recorder("fast", 0, &log)).unwrap();
        sequential.process("go").await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_per_invocation_timeout_fails_only_that_skill() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let orchestrator = setup(fixed(
            Decision::default()
                .with_invocation(SkillInvocation::new("slow", json!({})).with_timeout_ms(20))
                .with_invocation(SkillInvocation::new("current_time", json!({}))),
        ));
        orchestrator
            .registry()
            .register(recorder("slow", 2_000, &log))
            .unwrap();

        let response = orchestrator.process("time please").await.unwrap();
        assert_eq!(response.results[0].error_kind, Some(ErrorKind::Timeout));
        assert!(response.results[1].success);
    }

    #[tokio::test]
    async fn test_events_chain_across_cycles() {
        let orchestrator = setup(fixed(
            Decision::default().with_invocation(SkillInvocation::new("current_time", json!({}))),
        ));

        let first = orchestrator.process("time?").await.unwrap();
        let second = orchestrator.process("time again?").await.unwrap();

        let key = EdgeKey::new(first.event_nodes[0], second.event_nodes[0], Relation::FollowedBy);
        assert!(orchestrator.graph().get_edge(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_response_only_decision_runs_nothing() {
        let orchestrator = setup(fixed(Decision::respond("Hello there")));
        let response = orchestrator.process("hi").await.unwrap();
        assert_eq!(response.response, "Hello there");
        assert!(response.results.is_empty());
        assert_eq!(orchestrator.graph().node_count(), 0);
    }

    #[tokio::test]
    async fn test_query_recording() {
        let orchestrator = setup(fixed(Decision::respond("ok")))
            .with_config(OrchestratorConfig::default().with_query_recording(true));
        let graph = Arc::clone(orchestrator.graph());
        let ada = graph.add_node(NodeKind::Entity, "Ada likes tea").unwrap();

        let response = orchestrator.process("does Ada like tea").await.unwrap();
        let query_node = response.query_node.unwrap();
        assert_eq!(
            graph.get_node(&query_node).unwrap().unwrap().kind,
            NodeKind::Context
        );
        let key = EdgeKey::new(query_node, ada, Relation::References);
        assert!(graph.get_edge(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let orchestrator = setup(fixed(Decision::respond("ok")));
        let mut rx = orchestrator.subscribe();

        let response = orchestrator.process("hi").await.unwrap();
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.cycle_id, response.cycle_id);
            states.push(event.state);
        }
        assert_eq!(states, ALL_STATES.to_vec());
    }

    #[tokio::test]
    async fn test_autosave_and_execution_log() {
        let storage = Arc::new(MemoryStorage::new());
        let orchestrator = setup(fixed(
            Decision::default().with_invocation(create_task("call John", "tomorrow")),
        ))
        .with_config(
            OrchestratorConfig::default()
                .with_autosave(true)
                .with_execution_log(true),
        )
        .with_storage(storage.clone());

        let response = orchestrator.process("remind me").await.unwrap();

        let keys = storage.list_keys(EXECUTION_LOG_PREFIX).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with(&format!("-{}/000", response.cycle_id)));
        let logged: ExecutionResult = read_json(storage.as_ref(), &keys[0]).await.unwrap().unwrap();
        assert_eq!(logged.skill, "create_task");

        let reloaded = MemoryGraph::new();
        reloaded.load(storage.as_ref()).await.unwrap();
        assert_eq!(reloaded.node_count(), 2);
    }

    #[tokio::test]
    async fn test_execution_log_keeps_newest_cycles() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let registry = SkillRegistry::new();
        register_builtins(&registry).unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryGraph::new().with_clock(clock.clone())),
            Arc::new(registry),
            fixed(Decision::default().with_invocation(create_task("call John", "tomorrow"))),
        )
        .with_config(
            OrchestratorConfig::default()
                .with_execution_log(true)
                .with_max_logged_cycles(Some(2)),
        )
        .with_storage(storage.clone());

        let mut cycles = Vec::new();
        for _ in 0..4 {
            cycles.push(orchestrator.process("remind me").await.unwrap().cycle_id);
            clock.advance(chrono::Duration::seconds(1));
        }

        let keys = storage.list_keys(EXECUTION_LOG_PREFIX).await.unwrap();
        assert_eq!(keys.len(), 2);
        for (key, cycle) in keys.iter().zip(&cycles[2..]) {
            assert!(key.ends_with(&format!("-{}/000", cycle)), "{key}");
        }
    }

    #[test]
    fn test_log_dir() {
        assert_eq!(
            log_dir("executions/20260101T000000.000000Z-abc/001"),
            Some("executions/20260101T000000.000000Z-abc")
        );
        assert_eq!(log_dir("executions/loose"), None);
        assert_eq!(log_dir("graph/meta"), None);
    }

    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn write(&self, _key: &str, _blob: &[u8]) -> Result<()> {
            Err(Error::persistence("disk full"))
        }
        async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_autosave_failure_errors_cycle() {
        let orchestrator = setup(fixed(Decision::respond("ok")))
            .with_config(OrchestratorConfig::default().with_autosave(true))
            .with_storage(Arc::new(BrokenStorage));

        let err = orchestrator.process("hi").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PersistenceFailure);
        assert_eq!(err.state, CycleState::MemoryUpdated);
    }
}
