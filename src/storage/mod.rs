//! Storage collaborators.
//!
//! The graph engine and skill registry persist through a narrow key/value
//! surface. Two implementations ship with the crate:
//!
//! - **MemoryStorage**: a `BTreeMap` behind an async lock, for tests and
//!   ephemeral sessions
//! - **SqliteStorage**: a single key/value table in a SQLite database
//!
//! Missing keys are reported as `Ok(None)` rather than errors.

mod schema;
mod sqlite;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sqlite::SqliteStorage;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Key-indexed blob storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write (or overwrite) a blob under `key`.
    async fn write(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// Read the blob under `key`, `None` if absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete `key`. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, in ascending order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply `ops` in order.
    ///
    /// The shipped backends apply the whole batch or nothing. This default
    /// runs the ops one at a time and may stop partway; readers that need
    /// all-or-nothing must check what they read back.
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        for op in ops {
            match op {
                WriteOp::Put { key, blob } => self.write(&key, &blob).await?,
                WriteOp::Delete { key } => {
                    self.delete(&key).await?;
                }
            }
        }
        Ok(())
    }
}

/// One step of a [`Storage::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, blob: Vec<u8> },
    Delete { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, blob: Vec<u8>) -> Self {
        Self::Put {
            key: key.into(),
            blob,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Serialize `value` as JSON and write it under `key`.
pub async fn write_json<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<()> {
    let blob = serde_json::to_vec(value)?;
    storage.write(key, &blob).await
}

/// Read and deserialize the JSON value under `key`.
pub async fn read_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    match storage.read(key).await? {
        Some(blob) => serde_json::from_slice(&blob)
            .map(Some)
            .map_err(|e| Error::persistence_with_source(format!("Corrupt record at '{}'", key), e)),
        None => Ok(None),
    }
}

/// In-process storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut entries = self.entries.write().await;
        for op in ops {
            match op {
                WriteOp::Put { key, blob } => {
                    entries.insert(key, blob);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
