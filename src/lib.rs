//! # synk-core
//!
//! Memory graph and skill orchestration core for local-first personal AI
//! agents.
//!
//! ## Core Components
//!
//! - **Memory**: typed nodes and weighted edges with similarity and recency
//!   ranked retrieval, merging, pruning and snapshot persistence
//! - **Skills**: the skill contract, parameter validation, the registry and
//!   manifest discovery
//! - **Reasoning**: the decision contract and a prompt-and-parse adapter for
//!   text-completion backends
//! - **Orchestrator**: the retrieve, decide, execute, remember, respond cycle
//! - **Agent**: a session wiring all of the above to SQLite storage
//!
//! ## Example
//!
//! ```rust,ignore
//! use synk_core::{MemoryGraph, NodeKind, Relation};
//!
//! let graph = MemoryGraph::new();
//! let john = graph.add_node(NodeKind::Entity, "John, my brother")?;
//! let call = graph.add_node(NodeKind::Task, "call John")?;
//! graph.add_edge(&call, &john, Relation::References)?;
//!
//! let window = graph.retrieve_context("who is John?", 5)?;
//! for line in window.to_prompt_lines().lines() {
//!     println!("{}", line);
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod reasoning;
pub mod skills;
pub mod storage;

// Re-exports for convenience
pub use agent::{Agent, AgentBuilder};
pub use config::AgentConfig;
pub use error::{Error, ErrorKind, Result};
pub use memory::{
    Clock, CommitSummary, ContextWindow, Edge, EdgeKey, GraphMeta, GraphSnapshot, GraphStats,
    LoadOutcome, ManualClock, MemoryBatch, MemoryGraph, MergeSummary, Node, NodeId, NodeKind,
    Relation, RetentionPolicy, RetrievalConfig, ScoredNode, SimilarityScorer, SystemClock,
};
pub use orchestrator::{
    CancelToken, CycleError, CycleEvent, CycleResponse, CycleState, EventBus, Orchestrator,
    OrchestratorConfig,
};
pub use reasoning::{Completer, Decision, Reasoner, SkillInvocation, TextReasoner};
pub use skills::{
    ExecutionResult, NodeDraft, ParamType, ParameterSpec, Params, Skill, SkillContext,
    SkillDescriptor, SkillOutput, SkillRegistry,
};
pub use storage::{MemoryStorage, SqliteStorage, Storage, WriteOp};
