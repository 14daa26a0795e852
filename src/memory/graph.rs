//! The memory graph engine.
//!
//! Nodes and edges live in an arena keyed by identifiers; relationships are
//! never expressed as pointers, so cycles (`A caused_by B caused_by A`) are
//! harmless. All writes go through one `RwLock`: writers are exclusive and
//! readers wait for in-flight writes.

use super::clock::{Clock, SystemClock};
use super::similarity::{EquivalencePolicy, LexicalOverlap, SimilarityScorer};
use super::types::*;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Tuning for retrieval scoring and access reinforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Recency half-life in seconds; `<= 0` disables decay
    pub half_life_secs: f64,
    /// Weight of textual similarity in the combined score
    pub similarity_weight: f64,
    /// Weight of node importance in the combined score
    pub importance_weight: f64,
    /// Nodes must score strictly above this similarity to match a non-empty query
    pub min_similarity: f64,
    /// Pull in one-hop neighbors of matching nodes
    pub expand_neighbors: bool,
    /// Multiplier applied to neighbor scores
    pub neighbor_discount: f64,
    /// Importance added by each touch (bounded at 1.0)
    pub touch_reinforcement: f64,
    /// Importance for nodes created without an explicit value
    pub default_importance: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            half_life_secs: 7.0 * 24.0 * 3600.0,
            similarity_weight: 0.7,
            importance_weight: 0.3,
            min_similarity: 0.0,
            expand_neighbors: true,
            neighbor_discount: 0.5,
            touch_reinforcement: 0.05,
            default_importance: DEFAULT_IMPORTANCE,
        }
    }
}

impl RetrievalConfig {
    pub fn with_half_life_secs(mut self, secs: f64) -> Self {
        self.half_life_secs = secs;
        self
    }

    pub fn with_weights(mut self, similarity: f64, importance: f64) -> Self {
        self.similarity_weight = similarity;
        self.importance_weight = importance;
        self
    }

    pub fn with_neighbor_expansion(mut self, expand: bool) -> Self {
        self.expand_neighbors = expand;
        self
    }

    pub fn with_touch_reinforcement(mut self, amount: f64) -> Self {
        self.touch_reinforcement = amount;
        self
    }

    /// Exponential recency factor `exp(-Δt/τ)` with `τ = half_life / ln 2`.
    pub fn recency_factor(&self, age: Duration) -> f64 {
        if self.half_life_secs <= 0.0 {
            return 1.0;
        }
        let age_secs = (age.num_milliseconds().max(0) as f64) / 1000.0;
        let tau = self.half_life_secs / std::f64::consts::LN_2;
        (-age_secs / tau).exp()
    }
}

/// Which nodes retention pruning may remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Nodes at or above this importance are kept
    pub min_importance: f64,
    /// Only nodes untouched for longer than this are removed (`None` = any age)
    pub max_idle_secs: Option<i64>,
    /// Kinds that are never pruned
    pub protected_kinds: Vec<NodeKind>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_importance: 0.1,
            max_idle_secs: Some(30 * 24 * 3600),
            protected_kinds: vec![NodeKind::Task],
        }
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub primary: NodeId,
    pub removed: NodeId,
    /// Edges re-pointed from the duplicate to the primary. Edges between
    /// the two become self-loops on the primary.
    pub redirected_edges: usize,
}

/// Staged writes applied all-or-nothing by [`MemoryGraph::commit`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBatch {
    now: DateTime<Utc>,
    default_importance: f64,
    nodes: Vec<Node>,
    edges: Vec<(EdgeKey, f64)>,
    touches: Vec<NodeId>,
}

impl MemoryBatch {
    /// Stage a node; its id is usable immediately for staged edges.
    pub fn add_node(&mut self, kind: NodeKind, content: impl Into<String>) -> NodeId {
        let importance = self.default_importance;
        self.add_node_with_importance(kind, content, importance)
    }

    pub fn add_node_with_importance(
        &mut self,
        kind: NodeKind,
        content: impl Into<String>,
        importance: f64,
    ) -> NodeId {
        self.push_node(Node::new(kind, content, importance, self.now))
    }

    /// Stage a fully built node (metadata included). Timestamps are reset to the batch time.
    pub fn push_node(&mut self, mut node: Node) -> NodeId {
        node.created_at = self.now;
        node.last_touched = self.now;
        node.importance = clamp_unit(node.importance);
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn add_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        relation: impl Into<Relation>,
        weight: f64,
    ) {
        self.edges
            .push((EdgeKey::new(source, target, relation), weight));
    }

    pub fn touch(&mut self, id: NodeId) {
        self.touches.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.touches.is_empty()
    }

    pub fn staged_nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// What a commit changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub nodes_added: Vec<NodeId>,
    pub edges_added: usize,
    pub edges_coalesced: usize,
    pub nodes_touched: usize,
}

/// A full, ordered copy of the graph's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    /// SHA-256 over the canonical JSON encoding, as lowercase hex.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

#[derive(Debug, Default)]
pub(crate) struct GraphState {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeKey, Edge>,
    /// Keys of every edge incident to a node
    incident: HashMap<NodeId, BTreeSet<EdgeKey>>,
}

impl GraphState {
    fn insert_node(&mut self, node: Node) {
        self.incident.entry(node.id).or_default();
        self.nodes.insert(node.id, node);
    }

    /// Insert or coalesce. Returns true when a new edge was created.
    fn upsert_edge(&mut self, key: EdgeKey, weight: f64, now: DateTime<Utc>) -> bool {
        if let Some(existing) = self.edges.get_mut(&key) {
            existing.weight += weight;
            return false;
        }
        self.incident.entry(key.source).or_default().insert(key.clone());
        self.incident.entry(key.target).or_default().insert(key.clone());
        self.edges.insert(
            key.clone(),
            Edge {
                source: key.source,
                target: key.target,
                relation: key.relation,
                weight,
                created_at: now,
            },
        );
        true
    }

    fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        if let Some(set) = self.incident.get_mut(&key.source) {
            set.remove(key);
        }
        if let Some(set) = self.incident.get_mut(&key.target) {
            set.remove(key);
        }
        Some(edge)
    }

    /// Remove a node and every edge touching it.
    fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        let keys: Vec<EdgeKey> = self
            .incident
            .remove(id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for key in keys {
            self.remove_edge(&key);
        }
        Some(node)
    }

    fn touch(&mut self, id: &NodeId, now: DateTime<Utc>, reinforcement: f64) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.last_touched = now;
                node.importance = clamp_unit(node.importance + reinforcement);
                node.access_count += 1;
                true
            }
            None => false,
        }
    }

    fn incident_keys(&self, id: &NodeId) -> Vec<EdgeKey> {
        self.incident
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut state = Self::default();
        for node in snapshot.nodes {
            state.insert_node(node);
        }
        for edge in snapshot.edges {
            if !state.nodes.contains_key(&edge.source) {
                return Err(Error::node_not_found(edge.source));
            }
            if !state.nodes.contains_key(&edge.target) {
                return Err(Error::node_not_found(edge.target));
            }
            let key = edge.key();
            state.incident.entry(key.source).or_default().insert(key.clone());
            state.incident.entry(key.target).or_default().insert(key.clone());
            state.edges.insert(key, edge);
        }
        Ok(state)
    }
}

/// The memory graph: exclusive owner of nodes and edges.
pub struct MemoryGraph {
    state: RwLock<GraphState>,
    config: RetrievalConfig,
    scorer: Arc<dyn SimilarityScorer>,
    clock: Arc<dyn Clock>,
    /// Serializes persistence so concurrent saves never interleave
    pub(crate) persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for MemoryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGraph")
            .field("config", &self.config)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    /// Create an empty graph with lexical scoring and the system clock.
    pub fn new() -> Self {
        Self::with_config(RetrievalConfig::default())
    }

    pub fn with_config(config: RetrievalConfig) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            config,
            scorer: Arc::new(LexicalOverlap),
            clock: Arc::new(SystemClock),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the similarity scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, GraphState>> {
        self.state
            .read()
            .map_err(|e| Error::Internal(format!("Failed to lock graph: {}", e)))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, GraphState>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock graph: {}", e)))
    }

    // ==================== Node Operations ====================

    /// Add a node with the configured default importance.
    pub fn add_node(&self, kind: NodeKind, content: impl Into<String>) -> Result<NodeId> {
        self.add_node_with_importance(kind, content, self.config.default_importance)
    }

    /// Add a node with an explicit importance (clamped to [0, 1]).
    pub fn add_node_with_importance(
        &self,
        kind: NodeKind,
        content: impl Into<String>,
        importance: f64,
    ) -> Result<NodeId> {
        let node = Node::new(kind, content, importance, self.clock.now());
        self.insert_node(node)
    }

    /// Insert a pre-built node, stamping it with the current time.
    pub fn insert_node(&self, mut node: Node) -> Result<NodeId> {
        let now = self.clock.now();
        node.created_at = now;
        node.last_touched = now;
        node.importance = clamp_unit(node.importance);
        let id = node.id;
        let mut state = self.write_state()?;
        if state.nodes.contains_key(&id) {
            return Err(Error::Internal(format!("Node id collision: {}", id)));
        }
        debug!(node_id = %id, kind = %node.kind, "Adding node");
        state.insert_node(node);
        Ok(id)
    }

    pub fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        Ok(self.read_state()?.nodes.get(id).cloned())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.read_state()
            .map(|s| s.nodes.contains_key(id))
            .unwrap_or(false)
    }

    pub fn node_count(&self) -> usize {
        self.read_state().map(|s| s.nodes.len()).unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.read_state().map(|s| s.edges.len()).unwrap_or(0)
    }

    /// All nodes ordered by id.
    pub fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read_state()?.nodes.values().cloned().collect())
    }

    /// All edges ordered by key.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        Ok(self.read_state()?.edges.values().cloned().collect())
    }

    /// Mark a node as used: refresh its timestamp and reinforce importance.
    pub fn touch(&self, id: &NodeId) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.write_state()?;
        if state.touch(id, now, self.config.touch_reinforcement) {
            Ok(())
        } else {
            Err(Error::node_not_found(id))
        }
    }

    // ==================== Edge Operations ====================

    /// Link two existing nodes with weight 1.0.
    pub fn add_edge(
        &self,
        source: &NodeId,
        target: &NodeId,
        relation: impl Into<Relation>,
    ) -> Result<()> {
        self.add_weighted_edge(source, target, relation, 1.0)
    }

    /// Link two existing nodes. An identical triple accumulates weight.
    pub fn add_weighted_edge(
        &self,
        source: &NodeId,
        target: &NodeId,
        relation: impl Into<Relation>,
        weight: f64,
    ) -> Result<()> {
        let now = self.clock.now();
        let key = EdgeKey::new(*source, *target, relation);
        let mut state = self.write_state()?;
        if !state.nodes.contains_key(source) {
            return Err(Error::node_not_found(source));
        }
        if !state.nodes.contains_key(target) {
            return Err(Error::node_not_found(target));
        }
        let created = state.upsert_edge(key.clone(), weight, now);
        debug!(edge = %key, created, "Linking nodes");
        let reinforcement = self.config.touch_reinforcement;
        state.touch(source, now, reinforcement);
        if source != target {
            state.touch(target, now, reinforcement);
        }
        Ok(())
    }

    pub fn get_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        Ok(self.read_state()?.edges.get(key).cloned())
    }

    /// Every edge with `id` as source or target.
    pub fn edges_of(&self, id: &NodeId) -> Result<Vec<Edge>> {
        let state = self.read_state()?;
        if !state.nodes.contains_key(id) {
            return Err(Error::node_not_found(id));
        }
        Ok(state
            .incident_keys(id)
            .iter()
            .filter_map(|k| state.edges.get(k).cloned())
            .collect())
    }

    /// Nodes reachable within `depth` hops in either direction, ordered by id.
    pub fn neighbors(&self, id: &NodeId, depth: usize) -> Result<Vec<Node>> {
        let state = self.read_state()?;
        if !state.nodes.contains_key(id) {
            return Err(Error::node_not_found(id));
        }
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        let mut frontier = vec![*id];
        for _ in 0..depth {
            let mut next = Vec::new();
            for current in &frontier {
                for key in state.incident_keys(current) {
                    let other = if key.source == *current {
                        key.target
                    } else {
                        key.source
                    };
                    if other != *id && seen.insert(other) {
                        next.push(other);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(seen
            .iter()
            .filter_map(|n| state.nodes.get(n).cloned())
            .collect())
    }

    // ==================== Merge & Dedup ====================

    /// Fold `duplicate` into `primary` and remove `duplicate`.
    pub fn merge_nodes(&self, primary: &NodeId, duplicate: &NodeId) -> Result<MergeSummary> {
        let now = self.clock.now();
        let mut state = self.write_state()?;
        let summary = merge_locked(&mut state, primary, duplicate, now)?;
        info!(
            primary = %primary,
            duplicate = %duplicate,
            redirected = summary.redirected_edges,
            "Merged nodes"
        );
        Ok(summary)
    }

    /// Pairs `(keep, duplicate)` that `policy` judges equivalent.
    ///
    /// Only nodes of the same kind are compared. The older node (by creation
    /// time, then id) is kept.
    pub fn find_duplicates(&self, policy: &dyn EquivalencePolicy) -> Result<Vec<(NodeId, NodeId)>> {
        let state = self.read_state()?;
        Ok(duplicate_pairs(&state, policy))
    }

    /// Merge every duplicate found by `policy`, atomically.
    pub fn dedup(&self, policy: &dyn EquivalencePolicy) -> Result<Vec<MergeSummary>> {
        let now = self.clock.now();
        let mut state = self.write_state()?;
        let pairs = duplicate_pairs(&state, policy);
        let mut merged = Vec::with_capacity(pairs.len());
        for (keep, dup) in pairs {
            merged.push(merge_locked(&mut state, &keep, &dup, now)?);
        }
        if !merged.is_empty() {
            info!(merged = merged.len(), "Deduplicated memory graph");
        }
        Ok(merged)
    }

    // ==================== Retrieval ====================

    /// Rank nodes for `query`.
    ///
    /// Score is `(similarity_weight * sim + importance_weight * importance)`
    /// times the recency factor of the node's last touch. An empty query ranks
    /// every node by importance and recency. Ties break by id ascending, so the
    /// result is a pure function of graph state, query, limit and clock.
    pub fn retrieve_context(&self, query: &str, max_nodes: usize) -> Result<ContextWindow> {
        let now = self.clock.now();
        let state = self.read_state()?;
        let cfg = &self.config;
        let open_query = super::similarity::tokenize(query).is_empty();

        let relevance = |node: &Node, sim: f64| {
            let base = cfg.similarity_weight * sim + cfg.importance_weight * node.importance;
            base * cfg.recency_factor(now - node.last_touched)
        };

        let mut scores: BTreeMap<NodeId, f64> = BTreeMap::new();
        for node in state.nodes.values() {
            let sim = self.scorer.score(query, node);
            if open_query || sim > cfg.min_similarity {
                scores.insert(node.id, relevance(node, sim));
            }
        }

        if cfg.expand_neighbors && !open_query {
            let matched: Vec<NodeId> = scores.keys().copied().collect();
            for id in matched {
                for key in state.incident_keys(&id) {
                    let other = if key.source == id { key.target } else { key.source };
                    if scores.contains_key(&other) {
                        continue;
                    }
                    if let Some(node) = state.nodes.get(&other) {
                        scores.insert(other, relevance(node, 0.0) * cfg.neighbor_discount);
                    }
                }
            }
        }

        let mut ranked: Vec<(NodeId, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_nodes);

        let entries = ranked
            .into_iter()
            .filter_map(|(id, score)| {
                state.nodes.get(&id).map(|node| ScoredNode {
                    node: node.clone(),
                    score,
                })
            })
            .collect::<Vec<_>>();

        debug!(query = %query, returned = entries.len(), "Retrieved context");
        Ok(ContextWindow::new(query, entries))
    }

    /// Substring search, ordered by importance, then access count, then id.
    pub fn find_nodes(
        &self,
        text: Option<&str>,
        kind: Option<NodeKind>,
        limit: usize,
    ) -> Result<Vec<Node>> {
        let state = self.read_state()?;
        let needle = text.map(|t| t.to_lowercase());
        let mut found: Vec<&Node> = state
            .nodes
            .values()
            .filter(|n| kind.map_or(true, |k| n.kind == k))
            .filter(|n| {
                needle
                    .as_ref()
                    .map_or(true, |t| n.content.to_lowercase().contains(t.as_str()))
            })
            .collect();
        found.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.access_count.cmp(&a.access_count))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found.into_iter().take(limit).cloned().collect())
    }

    // ==================== Batch Writes ====================

    /// Start a batch stamped with the graph clock.
    pub fn batch(&self) -> MemoryBatch {
        MemoryBatch {
            now: self.clock.now(),
            default_importance: self.config.default_importance,
            ..Default::default()
        }
    }

    /// Apply a batch atomically.
    ///
    /// Every edge endpoint and touch target must exist in the graph or be
    /// staged in the batch; otherwise nothing is applied.
    pub fn commit(&self, batch: MemoryBatch) -> Result<CommitSummary> {
        let now = self.clock.now();
        let mut state = self.write_state()?;

        let staged: BTreeSet<NodeId> = batch.nodes.iter().map(|n| n.id).collect();
        let exists = |id: &NodeId| state.nodes.contains_key(id) || staged.contains(id);
        for node in &batch.nodes {
            if state.nodes.contains_key(&node.id) {
                return Err(Error::Internal(format!("Node id collision: {}", node.id)));
            }
        }
        for (key, _) in &batch.edges {
            if !exists(&key.source) {
                return Err(Error::node_not_found(key.source));
            }
            if !exists(&key.target) {
                return Err(Error::node_not_found(key.target));
            }
        }
        if let Some(missing) = batch.touches.iter().find(|id| !exists(id)) {
            return Err(Error::node_not_found(missing));
        }

        let mut summary = CommitSummary::default();
        let mut to_touch: BTreeSet<NodeId> = batch.touches.iter().copied().collect();
        for node in batch.nodes {
            summary.nodes_added.push(node.id);
            state.insert_node(node);
        }
        for (key, weight) in batch.edges {
            to_touch.insert(key.source);
            to_touch.insert(key.target);
            if state.upsert_edge(key, weight, now) {
                summary.edges_added += 1;
            } else {
                summary.edges_coalesced += 1;
            }
        }
        for id in &to_touch {
            state.touch(id, now, self.config.touch_reinforcement);
        }
        summary.nodes_touched = to_touch.len();

        debug!(
            nodes = summary.nodes_added.len(),
            edges = summary.edges_added,
            coalesced = summary.edges_coalesced,
            "Committed memory batch"
        );
        Ok(summary)
    }

    // ==================== Evolution ====================

    /// Multiply every node's importance by `factor` (clamped to [0, 1]).
    pub fn decay(&self, factor: f64) -> Result<usize> {
        let factor = clamp_unit(factor);
        let mut state = self.write_state()?;
        let mut changed = 0;
        for node in state.nodes.values_mut() {
            let next = clamp_unit(node.importance * factor);
            if next < node.importance {
                node.importance = next;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Remove nodes that fall under the retention policy, cascading to their edges.
    pub fn prune(&self, policy: &RetentionPolicy) -> Result<Vec<NodeId>> {
        let now = self.clock.now();
        let mut state = self.write_state()?;
        let doomed: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| !policy.protected_kinds.contains(&n.kind))
            .filter(|n| n.importance < policy.min_importance)
            .filter(|n| {
                policy
                    .max_idle_secs
                    .map_or(true, |secs| now - n.last_touched > Duration::seconds(secs))
            })
            .map(|n| n.id)
            .collect();
        for id in &doomed {
            state.remove_node(id);
        }
        if !doomed.is_empty() {
            info!(removed = doomed.len(), "Pruned memory graph");
        }
        Ok(doomed)
    }

    // ==================== Snapshots ====================

    /// Copy of the full graph, ordered by id and edge key.
    pub fn snapshot(&self) -> Result<GraphSnapshot> {
        Ok(self.read_state()?.snapshot())
    }

    /// Replace the graph contents with a snapshot.
    pub fn restore(&self, snapshot: GraphSnapshot) -> Result<()> {
        let next = GraphState::from_snapshot(snapshot)?;
        *self.write_state()? = next;
        Ok(())
    }

    pub(crate) fn replace_state(&self, next: GraphState) -> Result<()> {
        *self.write_state()? = next;
        Ok(())
    }

    pub(crate) fn state_from_snapshot(snapshot: GraphSnapshot) -> Result<GraphState> {
        GraphState::from_snapshot(snapshot)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        let state = self.read_state()?;
        let mut stats = GraphStats {
            total_nodes: state.nodes.len(),
            total_edges: state.edges.len(),
            ..Default::default()
        };
        for node in state.nodes.values() {
            *stats.nodes_by_kind.entry(node.kind).or_default() += 1;
        }
        for key in state.edges.keys() {
            *stats
                .edges_by_relation
                .entry(key.relation.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}

fn merge_locked(
    state: &mut GraphState,
    primary: &NodeId,
    duplicate: &NodeId,
    now: DateTime<Utc>,
) -> Result<MergeSummary> {
    if primary == duplicate {
        return Err(Error::Internal(format!("Cannot merge node {} into itself", primary)));
    }
    if !state.nodes.contains_key(primary) {
        return Err(Error::node_not_found(primary));
    }
    let dup = state
        .nodes
        .get(duplicate)
        .cloned()
        .ok_or_else(|| Error::node_not_found(duplicate))?;

    let mut summary = MergeSummary {
        primary: *primary,
        removed: *duplicate,
        redirected_edges: 0,
    };

    for key in state.incident_keys(duplicate) {
        let Some(edge) = state.remove_edge(&key) else {
            continue;
        };
        let redirect = |id: NodeId| if id == *duplicate { *primary } else { id };
        let new_key = EdgeKey::new(redirect(key.source), redirect(key.target), key.relation);
        if !state.upsert_edge(new_key.clone(), edge.weight, now) {
            // Coalesced into an existing edge; keep the older creation time.
            if let Some(existing) = state.edges.get_mut(&new_key) {
                if edge.created_at < existing.created_at {
                    existing.created_at = edge.created_at;
                }
            }
        } else if let Some(created) = state.edges.get_mut(&new_key) {
            created.created_at = edge.created_at;
        }
        summary.redirected_edges += 1;
    }

    state.nodes.remove(duplicate);
    state.incident.remove(duplicate);

    if let Some(keep) = state.nodes.get_mut(primary) {
        let provenance = json!({
            "id": dup.id.to_string(),
            "content": dup.content,
            "created_at": dup.created_at.to_rfc3339(),
        });
        match keep.metadata.get_mut("merged_from") {
            Some(Value::Array(list)) => list.push(provenance),
            _ => {
                keep.metadata
                    .insert("merged_from".to_string(), Value::Array(vec![provenance]));
            }
        }
        let already_present = keep
            .content
            .to_lowercase()
            .contains(&dup.content.trim().to_lowercase());
        if !already_present {
            keep.content = format!("{}\n\n{}", keep.content, dup.content);
        }
        for (k, v) in dup.metadata {
            keep.metadata.entry(k).or_insert(v);
        }
        keep.importance = keep.importance.max(dup.importance);
        keep.access_count += dup.access_count;
        if dup.created_at < keep.created_at {
            keep.created_at = dup.created_at;
        }
        if dup.last_touched > keep.last_touched {
            keep.last_touched = dup.last_touched;
        }
    }

    Ok(summary)
}

fn duplicate_pairs(state: &GraphState, policy: &dyn EquivalencePolicy) -> Vec<(NodeId, NodeId)> {
    let mut ordered: Vec<&Node> = state.nodes.values().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut canonical: Vec<&Node> = Vec::new();
    let mut pairs = Vec::new();
    for node in ordered {
        match canonical
            .iter()
            .find(|c| c.kind == node.kind && policy.equivalent(c, node))
        {
            Some(keep) => pairs.push((keep.id, node.id)),
            None => canonical.push(node),
        }
    }
    pairs
}
