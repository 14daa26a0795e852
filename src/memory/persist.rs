//! Persisting the memory graph through a [`Storage`] collaborator.
//!
//! Layout:
//!
//! - `graph/meta`: format version, counts and the snapshot digest
//! - `graph/nodes/<id>`: one JSON record per node
//! - `graph/edges/<source>|<target>|<relation>`: one JSON record per edge
//!
//! Each record is addressable on its own, so a reader can reload a single
//! node without decoding the whole graph. A save goes out as one
//! [`Storage::apply`] batch with the meta record last, and a load checks the
//! records it read against the meta digest.

use super::graph::{GraphSnapshot, MemoryGraph};
use super::types::{Edge, Node, NodeId};
use crate::error::{Error, Result};
use crate::storage::{read_json, Storage, WriteOp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Current on-disk layout version.
pub const GRAPH_FORMAT_VERSION: u32 = 1;

pub const META_KEY: &str = "graph/meta";
pub const NODE_PREFIX: &str = "graph/nodes/";
pub const EDGE_PREFIX: &str = "graph/edges/";

/// Header written after all node and edge records.
///
/// `digest` is [`GraphSnapshot::digest`] of the graph the records came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMeta {
    pub version: u32,
    pub node_count: usize,
    pub edge_count: usize,
    pub digest: String,
    pub saved_at: DateTime<Utc>,
}

/// What a load found.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// No prior snapshot; the graph was left empty
    Empty,
    /// A snapshot was restored
    Restored { nodes: usize, edges: usize },
}

fn node_key(id: &NodeId) -> String {
    format!("{}{}", NODE_PREFIX, id)
}

fn edge_key(edge: &Edge) -> String {
    format!("{}{}", EDGE_PREFIX, edge.key())
}

fn as_persistence(err: Error) -> Error {
    match err {
        Error::PersistenceFailure { .. } => err,
        other => Error::persistence(other.to_string()),
    }
}

impl MemoryGraph {
    /// Write a consistent snapshot of the graph to `storage`.
    ///
    /// The snapshot is taken under the read lock, so writers are blocked only
    /// for the copy. Concurrent saves are serialized. New records, deletions
    /// of records no longer in the graph and the meta record are applied as
    /// one batch.
    pub async fn save(&self, storage: &dyn Storage) -> Result<GraphMeta> {
        let snapshot = self.snapshot()?;
        let _guard = self.persist_lock.lock().await;
        save_snapshot(storage, &snapshot, self.now())
            .await
            .map_err(as_persistence)
    }

    /// Replace the graph with what `storage` holds.
    ///
    /// A missing snapshot is not an error: the graph is cleared and
    /// [`LoadOutcome::Empty`] is returned. Records that fail to decode, or
    /// that do not hash to the meta digest, are a `PersistenceFailure` and
    /// leave the graph untouched.
    pub async fn load(&self, storage: &dyn Storage) -> Result<LoadOutcome> {
        let _guard = self.persist_lock.lock().await;
        let Some(snapshot) = read_snapshot(storage).await.map_err(as_persistence)? else {
            info!("No stored memory graph; starting empty");
            self.restore(GraphSnapshot::default())?;
            return Ok(LoadOutcome::Empty);
        };

        let nodes = snapshot.nodes.len();
        let edges = snapshot.edges.len();
        let state = MemoryGraph::state_from_snapshot(snapshot).map_err(as_persistence)?;
        self.replace_state(state)?;
        info!(nodes, edges, "Loaded memory graph");
        Ok(LoadOutcome::Restored { nodes, edges })
    }

    /// Read a single stored node without loading the graph.
    pub async fn read_stored_node(storage: &dyn Storage, id: &NodeId) -> Result<Option<Node>> {
        read_json(storage, &node_key(id)).await
    }
}

/// Read every record back and verify it against the meta record.
async fn read_snapshot(storage: &dyn Storage) -> Result<Option<GraphSnapshot>> {
    let Some(meta) = read_json::<GraphMeta>(storage, META_KEY).await? else {
        return Ok(None);
    };
    if meta.version > GRAPH_FORMAT_VERSION {
        return Err(Error::persistence(format!(
            "Unsupported graph format version {} (max {})",
            meta.version, GRAPH_FORMAT_VERSION
        )));
    }

    let mut snapshot = GraphSnapshot::default();
    for key in storage.list_keys(NODE_PREFIX).await? {
        if let Some(node) = read_json::<Node>(storage, &key).await? {
            snapshot.nodes.push(node);
        }
    }
    for key in storage.list_keys(EDGE_PREFIX).await? {
        if let Some(edge) = read_json::<Edge>(storage, &key).await? {
            snapshot.edges.push(edge);
        }
    }
    // Same order as `MemoryGraph::snapshot`, so the digest is comparable
    snapshot.nodes.sort_by_key(|n| n.id);
    snapshot.edges.sort_by_key(|e| e.key());

    let digest = snapshot.digest();
    if digest != meta.digest {
        return Err(Error::persistence(format!(
            "Stored graph does not match its header: expected {} nodes, {} edges (digest {}), found {} nodes, {} edges (digest {})",
            meta.node_count,
            meta.edge_count,
            meta.digest,
            snapshot.nodes.len(),
            snapshot.edges.len(),
            digest
        )));
    }
    Ok(Some(snapshot))
}

async fn save_snapshot(
    storage: &dyn Storage,
    snapshot: &GraphSnapshot,
    now: DateTime<Utc>,
) -> Result<GraphMeta> {
    let mut ops = Vec::with_capacity(snapshot.nodes.len() + snapshot.edges.len() + 1);
    let mut live: BTreeSet<String> = BTreeSet::new();

    for node in &snapshot.nodes {
        let key = node_key(&node.id);
        ops.push(WriteOp::put(key.clone(), serde_json::to_vec(node)?));
        live.insert(key);
    }
    for edge in &snapshot.edges {
        let key = edge_key(edge);
        ops.push(WriteOp::put(key.clone(), serde_json::to_vec(edge)?));
        live.insert(key);
    }

    let mut stale = 0;
    for prefix in [NODE_PREFIX, EDGE_PREFIX] {
        for key in storage.list_keys(prefix).await? {
            if !live.contains(&key) {
                ops.push(WriteOp::delete(key));
                stale += 1;
            }
        }
    }

    let meta = GraphMeta {
        version: GRAPH_FORMAT_VERSION,
        node_count: snapshot.nodes.len(),
        edge_count: snapshot.edges.len(),
        digest: snapshot.digest(),
        saved_at: now,
    };
    ops.push(WriteOp::put(META_KEY, serde_json::to_vec(&meta)?));
    storage.apply(ops).await?;
    debug!(
        nodes = meta.node_count,
        edges = meta.edge_count,
        stale,
        "Saved memory graph"
    );
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{NodeKind, Relation};
    use crate::storage::{MemoryStorage, SqliteStorage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_load_roundtrip_preserves_digest() {
        let storage = MemoryStorage::new();
        let graph = MemoryGraph::new();
        let john = graph.add_node(NodeKind::Entity, "John").unwrap();
        let task = graph.add_node(NodeKind::Task, "call John").unwrap();
        graph.add_edge(&task, &john, Relation::References).unwrap();
        graph.add_edge(&task, &task, "reminds").unwrap();

        let meta = graph.save(&storage).await.unwrap();
        assert_eq!(meta.node_count, 2);
        assert_eq!(meta.edge_count, 2);

        let reloaded = MemoryGraph::new();
        let outcome = reloaded.load(&storage).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Restored { nodes: 2, edges: 2 });
        assert_eq!(reloaded.snapshot().unwrap().digest(), meta.digest);
        assert_eq!(reloaded.snapshot().unwrap(), graph.snapshot().unwrap());
    }

    #[tokio::test]
    async fn test_load_without_snapshot_is_empty() {
        let storage = MemoryStorage::new();
        let graph = MemoryGraph::new();
        graph.add_node(NodeKind::Concept, "scratch").unwrap();

        assert_eq!(graph.load(&storage).await.unwrap(), LoadOutcome::Empty);
        assert_eq!(graph.node_count(), 0);
    }

    #[tokio::test]
    async fn test_save_removes_stale_records() {
        let storage = MemoryStorage::new();
        let graph = MemoryGraph::new();
        let a = graph.add_node(NodeKind::Entity, "John").unwrap();
        let b = graph.add_node(NodeKind::Entity, "John").unwrap();
        graph.save(&storage).await.unwrap();
        assert_eq!(storage.list_keys(NODE_PREFIX).await.unwrap().len(), 2);

        graph.merge_nodes(&a, &b).unwrap();
        graph.save(&storage).await.unwrap();
        assert_eq!(
            storage.list_keys(NODE_PREFIX).await.unwrap(),
            vec![node_key(&a)]
        );
        assert!(MemoryGraph::read_stored_node(&storage, &b)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let id = {
            let storage = SqliteStorage::open(&path).unwrap();
            let graph = MemoryGraph::new();
            let id = graph.add_node(NodeKind::Entity, "Ada").unwrap();
            graph.save(&storage).await.unwrap();
            id
        };

        let storage = SqliteStorage::open(&path).unwrap();
        let graph = MemoryGraph::new();
        graph.load(&storage).await.unwrap();
        assert_eq!(graph.get_node(&id).unwrap().unwrap().content, "Ada");
    }

    #[tokio::test]
    async fn test_missing_record_fails_load() {
        let storage = MemoryStorage::new();
        let graph = MemoryGraph::new();
        let a = graph.add_node(NodeKind::Entity, "a").unwrap();
        let b = graph.add_node(NodeKind::Entity, "b").unwrap();
        graph.add_edge(&a, &b, Relation::RelatedTo).unwrap();
        graph.save(&storage).await.unwrap();
        storage.delete(&node_key(&b)).await.unwrap();

        let reloaded = MemoryGraph::new();
        reloaded.add_node(NodeKind::Concept, "kept").unwrap();
        let err = reloaded.load(&storage).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceFailure);
        assert_eq!(reloaded.node_count(), 1);
    }

    #[tokio::test]
    async fn test_edited_record_fails_digest_check() {
        let storage = MemoryStorage::new();
        let graph = MemoryGraph::new();
        let a = graph.add_node(NodeKind::Entity, "Ada").unwrap();
        graph.save(&storage).await.unwrap();

        let mut node = MemoryGraph::read_stored_node(&storage, &a)
            .await
            .unwrap()
            .unwrap();
        node.content = "Grace".to_string();
        storage
            .write(&node_key(&a), &serde_json::to_vec(&node).unwrap())
            .await
            .unwrap();

        let err = MemoryGraph::new().load(&storage).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceFailure);
    }

    /// Applies ops one at a time through the trait default and fails after
    /// `budget` successful writes.
    struct FlakyStorage {
        inner: MemoryStorage,
        budget: std::sync::atomic::AtomicUsize,
    }

    impl FlakyStorage {
        fn new(inner: MemoryStorage) -> Self {
            Self {
                inner,
                budget: std::sync::atomic::AtomicUsize::new(usize::MAX),
            }
        }

        fn fail_after(&self, writes: usize) {
            self.budget
                .store(writes, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn write(&self, key: &str, blob: &[u8]) -> Result<()> {
            use std::sync::atomic::Ordering;
            let left = self.budget.load(Ordering::SeqCst);
            if left == 0 {
                return Err(Error::Internal("disk full".into()));
            }
            self.budget.store(left - 1, Ordering::SeqCst);
            self.inner.write(key, blob).await
        }
        async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.read(key).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list_keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_interrupted_save_is_detected_on_load() {
        let storage = FlakyStorage::new(MemoryStorage::new());
        let graph = MemoryGraph::new();
        let a = graph.add_node(NodeKind::Entity, "a").unwrap();
        graph.save(&storage).await.unwrap();

        let b = graph.add_node(NodeKind::Entity, "b").unwrap();
        graph.add_edge(&a, &b, Relation::RelatedTo).unwrap();
        storage.fail_after(2);
        let err = graph.save(&storage).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceFailure);

        // Both node records landed; the edge and meta records did not
        let err = MemoryGraph::new().load(&storage).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceFailure);
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_previous_save() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("memory.db")).unwrap();
        let graph = MemoryGraph::new();
        let a = graph.add_node(NodeKind::Entity, "a").unwrap();
        let first = graph.save(&storage).await.unwrap();

        let b = graph.add_node(NodeKind::Entity, "b").unwrap();
        graph.add_edge(&a, &b, Relation::RelatedTo).unwrap();
        // Reject the meta record so the second batch fails at its last op
        rusqlite::Connection::open(dir.path().join("memory.db"))
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_meta BEFORE UPDATE ON kv WHEN NEW.key = 'graph/meta'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        assert!(graph.save(&storage).await.is_err());

        let reloaded = MemoryGraph::new();
        let outcome = reloaded.load(&storage).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Restored { nodes: 1, edges: 0 });
        assert_eq!(reloaded.snapshot().unwrap().digest(), first.digest);
    }

    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn write(&self, _key: &str, _blob: &[u8]) -> Result<()> {
            Err(Error::Internal("disk unplugged".into()))
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
    async fn test_save_failure_is_persistence_error() {
        let graph = MemoryGraph::new();
        graph.add_node(NodeKind::Entity, "a").unwrap();
        let err = graph.save(&BrokenStorage).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceFailure);
        assert_eq!(graph.node_count(), 1);
    }
}
