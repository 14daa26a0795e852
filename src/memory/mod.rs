//! Typed memory graph with recency-weighted retrieval.
//!
//! The memory module stores what the agent knows as nodes (entities, events,
//! concepts, tasks, context fragments) joined by directed, typed edges:
//!
//! - **Retrieval** ranks nodes by textual similarity and importance, decayed
//!   by how long ago each node was last touched
//! - **Reinforcement** bumps importance whenever a node is used
//! - **Merging** folds duplicates together without losing their edges
//! - **Batches** apply a cycle's writes all at once
//!
//! ## Example
//!
//! ```rust,ignore
//! use synk_core::memory::{MemoryGraph, NodeKind, Relation};
//!
//! let graph = MemoryGraph::new();
//! let john = graph.add_node(NodeKind::Entity, "John")?;
//! let task = graph.add_node(NodeKind::Task, "call John tomorrow")?;
//! graph.add_edge(&task, &john, Relation::References)?;
//!
//! let window = graph.retrieve_context("what do I owe John?", 5)?;
//! ```

mod clock;
mod graph;
mod persist;
mod proptest;
mod similarity;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use graph::{
    CommitSummary, GraphSnapshot, MemoryBatch, MemoryGraph, MergeSummary, RetentionPolicy,
    RetrievalConfig,
};
pub use persist::{GraphMeta, LoadOutcome, GRAPH_FORMAT_VERSION};
pub use similarity::{
    tokenize, EquivalencePolicy, ExactContent, LexicalOverlap, SimilarityScorer, TokenJaccard,
};
pub use types::{
    ContextWindow, Edge, EdgeKey, GraphStats, Node, NodeId, NodeKind, Relation, ScoredNode,
    DEFAULT_IMPORTANCE,
};
