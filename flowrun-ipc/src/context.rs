//! Execution context store: write-once/read-once input handoff
//!
//! The enqueuer writes an execution's serialized input under its execution
//! id; the one worker assigned to it takes the entry. No key is ever read
//! twice, which is what makes the store lock-free from the callers' point of
//! view. Entries are not assumed durable beyond the lifetime of one
//! execution.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

/// Context store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Context store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Context store encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Key/value handoff for execution input
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Write the input blob for an execution. Called exactly once per id.
    async fn put(&self, execution_id: &str, context: JsonValue) -> Result<(), StoreError>;

    /// Take the input blob for an execution, removing it from the store.
    /// Returns `None` when no entry exists.
    async fn take(&self, execution_id: &str) -> Result<Option<JsonValue>, StoreError>;
}

/// In-process store for tests and embedded single-process use
#[derive(Default)]
pub struct InMemoryContextStore {
    entries: Mutex<HashMap<String, JsonValue>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn put(&self, execution_id: &str, context: JsonValue) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(execution_id.to_string(), context);
        Ok(())
    }

    async fn take(&self, execution_id: &str) -> Result<Option<JsonValue>, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(execution_id))
    }
}

/// Filesystem-backed store shared between the pool and worker processes:
/// one JSON file per execution under a common directory.
pub struct FsContextStore {
    dir: PathBuf,
}

impl FsContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, execution_id: &str) -> PathBuf {
        // Execution ids are caller-supplied; strip path separators so an id
        // can never escape the store directory.
        let safe: String = execution_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl ContextStore for FsContextStore {
    async fn put(&self, execution_id: &str, context: JsonValue) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_vec(&context)?;
        tokio::fs::write(self.entry_path(execution_id), content).await?;
        Ok(())
    }

    async fn take(&self, execution_id: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = self.entry_path(execution_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_slice(&content)?;
        tokio::fs::remove_file(&path).await?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_take_removes_entry() {
        let store = InMemoryContextStore::new();
        store.put("e1", json!({"input": 1})).await.unwrap();

        let first = store.take("e1").await.unwrap();
        assert_eq!(first, Some(json!({"input": 1})));

        let second = store.take("e1").await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_memory_store_missing_key() {
        let store = InMemoryContextStore::new();
        assert_eq!(store.take("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContextStore::new(dir.path());

        store.put("e2", json!({"code": "ref-1"})).await.unwrap();
        assert_eq!(store.take("e2").await.unwrap(), Some(json!({"code": "ref-1"})));
        assert_eq!(store.take("e2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_store_sanitizes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContextStore::new(dir.path());

        store.put("../evil", json!(1)).await.unwrap();
        // The entry resolves inside the store directory, not its parent.
        assert!(dir.path().join(".._evil.json").exists());
        assert_eq!(store.take("../evil").await.unwrap(), Some(json!(1)));
    }
}
