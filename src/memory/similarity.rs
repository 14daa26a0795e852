//! Pluggable scoring policies used by retrieval and deduplication.

use super::types::Node;
use std::collections::BTreeSet;

/// Scores the textual relevance of a node to a query, in [0, 1].
///
/// The default is lexical token overlap; an embedding-backed scorer can be
/// dropped in without touching graph logic.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, query: &str, node: &Node) -> f64;
}

/// Judges whether two nodes describe the same thing.
pub trait EquivalencePolicy: Send + Sync {
    fn equivalent(&self, a: &Node, b: &Node) -> bool;
}

/// Fraction of query tokens that also appear in the node content.
#[derive(Debug, Clone, Default)]
pub struct LexicalOverlap;

impl SimilarityScorer for LexicalOverlap {
    fn score(&self, query: &str, node: &Node) -> f64 {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return 0.0;
        }
        let content_tokens = tokenize(&node.content);
        let hits = query_tokens.intersection(&content_tokens).count();
        hits as f64 / query_tokens.len() as f64
    }
}

/// Two nodes are equivalent when their normalized contents are identical.
#[derive(Debug, Clone, Default)]
pub struct ExactContent;

impl EquivalencePolicy for ExactContent {
    fn equivalent(&self, a: &Node, b: &Node) -> bool {
        normalize(&a.content) == normalize(&b.content)
    }
}

/// Jaccard similarity of token sets at or above a threshold.
#[derive(Debug, Clone)]
pub struct TokenJaccard {
    pub threshold: f64,
}

impl TokenJaccard {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl EquivalencePolicy for TokenJaccard {
    fn equivalent(&self, a: &Node, b: &Node) -> bool {
        let ta = tokenize(&a.content);
        let tb = tokenize(&b.content);
        let union = ta.union(&tb).count();
        if union == 0 {
            return false;
        }
        let inter = ta.intersection(&tb).count();
        inter as f64 / union as f64 >= self.threshold
    }
}

/// Lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
