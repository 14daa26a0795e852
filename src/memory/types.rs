//! Node and edge records forming the memory graph vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default importance assigned to new nodes.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Stable identifier of a node. Ordered so that ties can be broken reproducibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier from its string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Person, place, thing
    Entity,
    /// Something that happened
    Event,
    /// Abstract idea
    Concept,
    /// Action item
    Task,
    /// Conversation context fragment
    Context,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Entity,
        NodeKind::Event,
        NodeKind::Concept,
        NodeKind::Task,
        NodeKind::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Event => "event",
            Self::Concept => "concept",
            Self::Task => "task",
            Self::Context => "context",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "entity" => Ok(Self::Entity),
            "event" => Ok(Self::Event),
            "concept" => Ok(Self::Concept),
            "task" => Ok(Self::Task),
            "context" => Ok(Self::Context),
            other => Err(format!("unknown node kind: {}", other)),
        }
    }
}

/// Relation carried by a directed edge.
///
/// The well-known relations cover what the orchestration loop writes; any
/// other label round-trips through [`Relation::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Relation {
    RelatedTo,
    PartOf,
    CausedBy,
    FollowedBy,
    References,
    Custom(String),
}

impl Relation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RelatedTo => "related_to",
            Self::PartOf => "part_of",
            Self::CausedBy => "caused_by",
            Self::FollowedBy => "followed_by",
            Self::References => "references",
            Self::Custom(label) => label,
        }
    }
}

impl From<String> for Relation {
    fn from(s: String) -> Self {
        match s.as_str() {
            "related_to" => Self::RelatedTo,
            "part_of" => Self::PartOf,
            "caused_by" => Self::CausedBy,
            "followed_by" => Self::FollowedBy,
            "references" => Self::References,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for Relation {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<Relation> for String {
    fn from(r: Relation) -> Self {
        r.as_str().to_string()
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic memory unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
    /// Importance/confidence in [0, 1]
    pub importance: f64,
    #[serde(default)]
    pub access_count: u64,
}

impl Node {
    /// Create a node stamped at `now`. Importance is clamped to [0, 1].
    pub fn new(kind: NodeKind, content: impl Into<String>, importance: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            content: content.into(),
            metadata: BTreeMap::new(),
            created_at: now,
            last_touched: now,
            importance: clamp_unit(importance),
            access_count: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Identity of an edge: the `(source, target, relation)` triple is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: Relation,
}

impl EdgeKey {
    pub fn new(source: NodeId, target: NodeId, relation: impl Into<Relation>) -> Self {
        Self {
            source,
            target,
            relation: relation.into(),
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.source, self.target, self.relation)
    }
}

/// A directed, typed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: Relation,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source, self.target, self.relation.clone())
    }
}

/// A node ranked into a context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f64,
}

/// The transient, ordered set of nodes retrieved for one orchestration cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub query: String,
    pub entries: Vec<ScoredNode>,
}

impl ContextWindow {
    pub fn new(query: impl Into<String>, entries: Vec<ScoredNode>) -> Self {
        Self {
            query: query.into(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter().map(|e| &e.node)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|e| e.node.id).collect()
    }

    /// Render the window as bullet lines for prompt construction.
    pub fn to_prompt_lines(&self) -> String {
        self.nodes()
            .map(|n| format!("- [{}] {}", n.kind, n.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Per-kind and per-relation counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub nodes_by_kind: BTreeMap<NodeKind, usize>,
    pub edges_by_relation: BTreeMap<String, usize>,
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_roundtrip_custom() {
        let json = serde_json::to_string(&Relation::Custom("mentions".into())).unwrap();
        assert_eq!(json, "\"mentions\"");
        let back: Relation = serde_json::from_str("\"caused_by\"").unwrap();
        assert_eq!(back, Relation::CausedBy);
    }

    #[test]
    fn test_node_kind_parse() {
        assert_eq!("Task".parse::<NodeKind>().unwrap(), NodeKind::Task);
        assert!("relationship".parse::<NodeKind>().is_err());
    }

    #[test]
    fn test_importance_clamped() {
        let node = Node::new(NodeKind::Entity, "John", 4.2, Utc::now());
        assert_eq!(node.importance, 1.0);
        let node = Node::new(NodeKind::Entity, "John", f64::NAN, Utc::now());
        assert_eq!(node.importance, 0.0);
    }

    #[test]
    fn test_edge_key_display() {
        let a = NodeId::new();
        let b = NodeId::new();
        let key = EdgeKey::new(a, b, Relation::PartOf);
        assert_eq!(key.to_string(), format!("{}|{}|part_of", a, b));
    }
}
